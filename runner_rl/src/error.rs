//! Typed errors for invalid calls and rejected configuration.
//!
//! Everything else in the crate flows through `anyhow::Result`; these are the
//! cases a caller may want to match on.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunnerError {
    /// The physics engine already reported a collision and was not reset.
    #[error("physics engine stepped after termination without a reset")]
    PhysicsTerminated,

    /// The environment returned a terminal result and was not reset.
    #[error("environment stepped after a terminal result without a reset")]
    EpisodeTerminated,

    #[error("cannot sample from an empty replay buffer")]
    EmptyBuffer,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("action index {0} is outside the action set")]
    UnknownAction(usize),
}

impl RunnerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
