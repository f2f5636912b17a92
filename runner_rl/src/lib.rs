//! Runner RL - Core Library
//!
//! Physics simulation, reward shaping and double-DQN training for a
//! side-scrolling obstacle-jumping game, driven by a message-passing
//! orchestrator.

pub mod agent;
pub mod cli;
pub mod environment;
pub mod error;
pub mod network;
pub mod orchestrator;
pub mod physics;
pub mod replay;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use agent::{DqnAgent, LearningAgent, RandomAgent};
pub use environment::{Action, Environment, Observation, StepOutcome, ACTION_COUNT, OBS_DIM};
pub use error::RunnerError;
pub use orchestrator::{Command, Event, Orchestrator, OrchestratorHandle};
pub use physics::{PhysicsEngine, Snapshot};
pub use replay::{ReplayBuffer, Transition};
pub use settings::Settings;
pub use store::ModelStore;
