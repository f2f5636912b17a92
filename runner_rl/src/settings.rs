//! Layered configuration: embedded defaults, optional file, environment overrides.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::RunnerError;

/// How obstacles are scheduled after the initial delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// Cooldown drawn uniformly from `[spawn_min_frames, spawn_max_frames]`.
    Random,
    /// Cooldown is always `spawn_interval_frames`.
    Fixed,
}

/// World geometry and dynamics. Units are pixels and frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicsConfig {
    pub world_width: f32,
    pub ground_y: f32,
    pub actor_x: f32,
    pub actor_width: f32,
    pub actor_height: f32,
    pub gravity: f32,
    /// Negative: screen y grows downward.
    pub jump_velocity: f32,
    pub base_speed: f32,
    pub speed_bonus_cap: f32,
    pub speed_divisor: f32,
    pub obstacle_min_width: f32,
    pub obstacle_max_width: f32,
    pub obstacle_min_height: f32,
    pub obstacle_max_height: f32,
    pub spawn_mode: SpawnMode,
    pub spawn_min_frames: f32,
    pub spawn_max_frames: f32,
    pub spawn_interval_frames: f32,
    pub initial_spawn_delay: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            world_width: 800.0,
            ground_y: 300.0,
            actor_x: 50.0,
            actor_width: 40.0,
            actor_height: 44.0,
            gravity: 0.6,
            jump_velocity: -12.0,
            base_speed: 6.0,
            speed_bonus_cap: 6.0,
            speed_divisor: 100.0,
            obstacle_min_width: 20.0,
            obstacle_max_width: 40.0,
            obstacle_min_height: 30.0,
            obstacle_max_height: 60.0,
            spawn_mode: SpawnMode::Random,
            spawn_min_frames: 60.0,
            spawn_max_frames: 140.0,
            spawn_interval_frames: 90.0,
            initial_spawn_delay: 30.0,
        }
    }
}

impl PhysicsConfig {
    /// Highest point of a jump above the ground line.
    pub fn jump_apex(&self) -> f32 {
        self.jump_velocity * self.jump_velocity / (2.0 * self.gravity)
    }

    pub fn max_speed(&self) -> f32 {
        self.base_speed + self.speed_bonus_cap
    }
}

/// Reward shaping coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardConfig {
    pub survival_per_frame: f32,
    pub score_coefficient: f32,
    pub clear_bonus: f32,
    pub timed_jump_bonus: f32,
    pub untimed_jump_penalty: f32,
    pub terminal_penalty: f32,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            survival_per_frame: 0.01,
            score_coefficient: 0.01,
            clear_bonus: 1.0,
            timed_jump_bonus: 0.1,
            untimed_jump_penalty: 0.05,
            terminal_penalty: -10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Normalised distance under which a jump counts as well timed.
    pub proximity_threshold: f32,
    /// Time-to-impact (frames) that maps to 1.0 in the observation.
    pub impact_horizon_frames: f32,
    pub rewards: RewardConfig,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            proximity_threshold: 0.25,
            impact_horizon_frames: 120.0,
            rewards: RewardConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Hard,
    Soft,
}

/// Resolved target-network update rule; exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetSync {
    /// Overwrite the target every `interval` gradient updates.
    Hard { interval: u64 },
    /// Blend `tau` of the online parameters into the target after every update.
    Soft { tau: f32 },
}

/// Q-learning hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub hidden_layers: Vec<usize>,
    pub learning_rate: f32,
    pub gamma: f32,
    pub batch_size: usize,
    pub buffer_capacity: usize,
    /// Buffer occupancy required before the first update.
    pub warmup: usize,
    /// Run an update on every n-th `train` call.
    pub train_every: u64,
    pub sync_mode: SyncMode,
    pub hard_sync_interval: u64,
    pub soft_sync_tau: f32,
    pub huber_delta: f32,
    pub max_grad_norm: Option<f32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![64, 64],
            learning_rate: 1e-3,
            gamma: 0.99,
            batch_size: 64,
            buffer_capacity: 50_000,
            warmup: 1_000,
            train_every: 4,
            sync_mode: SyncMode::Hard,
            hard_sync_interval: 500,
            soft_sync_tau: 0.005,
            huber_delta: 1.0,
            max_grad_norm: Some(10.0),
        }
    }
}

impl AgentConfig {
    pub fn target_sync(&self) -> TargetSync {
        match self.sync_mode {
            SyncMode::Hard => TargetSync::Hard {
                interval: self.hard_sync_interval,
            },
            SyncMode::Soft => TargetSync::Soft {
                tau: self.soft_sync_tau,
            },
        }
    }
}

/// Defaults applied to `start` / `evaluate` commands that omit a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub episodes: usize,
    pub max_steps: usize,
    pub frame_skip: u32,
    pub epsilon_start: f32,
    pub epsilon_end: f32,
    /// Falls back to the episode count when unset.
    pub epsilon_decay_episodes: Option<usize>,
    pub autosave_threshold: Option<u64>,
    pub eval_episodes: usize,
    pub emit_frames: bool,
    pub frame_interval_ms: u64,
    pub channel_capacity: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            episodes: 50,
            max_steps: 2_000,
            frame_skip: 2,
            epsilon_start: 1.0,
            epsilon_end: 0.05,
            epsilon_decay_episodes: None,
            autosave_threshold: None,
            eval_episodes: 5,
            emit_frames: true,
            frame_interval_ms: 50,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub path: PathBuf,
    pub model_name: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/models"),
            model_name: "runner-dqn".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub physics: PhysicsConfig,
    pub environment: EnvConfig,
    pub agent: AgentConfig,
    pub training: TrainingConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    /// Seeds obstacle spawning and exploration when set.
    pub seed: Option<u64>,
}

impl Settings {
    /// Load the embedded defaults, then `path` (if any), then `RUNNER__*`
    /// environment variables, and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(File::from_str(
            include_str!("../config.toml"),
            FileFormat::Toml,
        ));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        } else {
            builder = builder.add_source(File::with_name("runner").required(false));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("RUNNER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("agent.hidden_layers")
                    .try_parsing(true),
            )
            .build()
            .context("failed to assemble configuration sources")?;

        let settings: Settings = config
            .try_deserialize()
            .context("failed to deserialize settings")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations that would only fail mid-run.
    pub fn validate(&self) -> Result<(), RunnerError> {
        let p = &self.physics;
        if p.base_speed <= 0.0 {
            return Err(RunnerError::config("physics.base_speed must be positive"));
        }
        if p.gravity <= 0.0 {
            return Err(RunnerError::config("physics.gravity must be positive"));
        }
        if p.jump_velocity >= 0.0 {
            return Err(RunnerError::config("physics.jump_velocity must be negative (upward)"));
        }
        if p.speed_divisor <= 0.0 {
            return Err(RunnerError::config("physics.speed_divisor must be positive"));
        }
        if p.obstacle_min_width > p.obstacle_max_width || p.obstacle_min_width <= 0.0 {
            return Err(RunnerError::config("physics obstacle width range is empty"));
        }
        if p.obstacle_min_height > p.obstacle_max_height || p.obstacle_min_height <= 0.0 {
            return Err(RunnerError::config("physics obstacle height range is empty"));
        }
        if p.spawn_min_frames > p.spawn_max_frames || p.spawn_min_frames <= 0.0 {
            return Err(RunnerError::config("physics spawn cooldown range is empty"));
        }
        if p.spawn_interval_frames <= 0.0 {
            return Err(RunnerError::config("physics.spawn_interval_frames must be positive"));
        }
        if p.actor_x <= 0.0 || p.actor_x + p.actor_width >= p.world_width {
            return Err(RunnerError::config("physics actor must sit inside the world"));
        }

        if self.environment.proximity_threshold <= 0.0 {
            return Err(RunnerError::config("environment.proximity_threshold must be positive"));
        }
        if self.environment.impact_horizon_frames <= 0.0 {
            return Err(RunnerError::config("environment.impact_horizon_frames must be positive"));
        }

        let a = &self.agent;
        if a.buffer_capacity == 0 {
            return Err(RunnerError::config("agent.buffer_capacity must be at least 1"));
        }
        if a.batch_size == 0 {
            return Err(RunnerError::config("agent.batch_size must be at least 1"));
        }
        if a.batch_size > a.buffer_capacity {
            return Err(RunnerError::config("agent.batch_size exceeds agent.buffer_capacity"));
        }
        if a.hidden_layers.iter().any(|&w| w == 0) {
            return Err(RunnerError::config("agent.hidden_layers widths must be non-zero"));
        }
        if a.learning_rate <= 0.0 {
            return Err(RunnerError::config("agent.learning_rate must be positive"));
        }
        if !(0.0..=1.0).contains(&a.gamma) {
            return Err(RunnerError::config("agent.gamma must lie in [0, 1]"));
        }
        if a.train_every == 0 {
            return Err(RunnerError::config("agent.train_every must be at least 1"));
        }
        if a.huber_delta <= 0.0 {
            return Err(RunnerError::config("agent.huber_delta must be positive"));
        }
        match a.target_sync() {
            TargetSync::Hard { interval } if interval == 0 => {
                return Err(RunnerError::config("agent.hard_sync_interval must be at least 1"));
            }
            TargetSync::Soft { tau } if !(tau > 0.0 && tau <= 1.0) => {
                return Err(RunnerError::config("agent.soft_sync_tau must lie in (0, 1]"));
            }
            _ => {}
        }
        if a.warmup < a.batch_size {
            warn!(
                warmup = a.warmup,
                batch_size = a.batch_size,
                "warmup is smaller than the batch size; early batches will repeat transitions"
            );
        }

        let t = &self.training;
        if t.max_steps == 0 {
            return Err(RunnerError::config("training.max_steps must be at least 1"));
        }
        if t.frame_skip == 0 {
            return Err(RunnerError::config("training.frame_skip must be at least 1"));
        }
        if t.channel_capacity == 0 {
            return Err(RunnerError::config("training.channel_capacity must be at least 1"));
        }

        if self.persistence.model_name.trim().is_empty() {
            return Err(RunnerError::config("persistence.model_name must not be empty"));
        }
        if self.persistence.model_name.contains('/') {
            return Err(RunnerError::config("persistence.model_name must not contain '/'"));
        }

        Ok(())
    }
}
