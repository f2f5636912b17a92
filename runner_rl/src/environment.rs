//! Gym-style adapter over the physics engine: discrete actions in, normalised
//! observations and shaped rewards out.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::RunnerError;
use crate::physics::{Obstacle, PhysicsEngine, Snapshot};
use crate::settings::{EnvConfig, PhysicsConfig};

/// Length of an [`Observation`] vector.
pub const OBS_DIM: usize = 7;

/// Size of the learnable action set (`Idle`, `Jump`).
pub const ACTION_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Idle = 0,
    Jump = 1,
    /// Reserved; currently identical to `Idle`.
    Duck = 2,
}

impl Action {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Action::Jump)
    }
}

impl TryFrom<usize> for Action {
    type Error = RunnerError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(Action::Idle),
            1 => Ok(Action::Jump),
            2 => Ok(Action::Duck),
            other => Err(RunnerError::UnknownAction(other)),
        }
    }
}

/// Fixed-length feature vector, in order:
///
/// 0. height above ground / jump apex
/// 1. speed / max speed
/// 2. distance to the nearest unpassed obstacle / world width, in `[-1, 1]`
/// 3. time to impact / impact horizon
/// 4. obstacle width / max width
/// 5. obstacle height / max height
/// 6. grounded flag
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation(pub [f32; OBS_DIM]);

impl Observation {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn height(&self) -> f32 {
        self.0[0]
    }

    pub fn distance(&self) -> f32 {
        self.0[2]
    }

    pub fn grounded(&self) -> bool {
        self.0[6] > 0.5
    }
}

impl Default for Observation {
    fn default() -> Self {
        Self([0.0; OBS_DIM])
    }
}

fn nearest_unpassed(snapshot: &Snapshot) -> Option<&Obstacle> {
    snapshot.obstacles.iter().find(|o| !o.passed)
}

/// Pure function of the snapshot and the two configs.
pub fn observe(snapshot: &Snapshot, physics: &PhysicsConfig, env: &EnvConfig) -> Observation {
    let height = ((physics.ground_y - snapshot.actor_y) / physics.jump_apex()).clamp(0.0, 1.0);
    let speed = (snapshot.speed / physics.max_speed()).clamp(0.0, 1.0);

    let (distance, impact, width, obstacle_height) = match nearest_unpassed(snapshot) {
        Some(o) => {
            let gap = o.x - (physics.actor_x + physics.actor_width);
            let frames_to_impact = gap.max(0.0) / snapshot.speed.max(f32::EPSILON);
            (
                (gap / physics.world_width).clamp(-1.0, 1.0),
                (frames_to_impact / env.impact_horizon_frames).clamp(0.0, 1.0),
                (o.width / physics.obstacle_max_width).clamp(0.0, 1.0),
                (o.height / physics.obstacle_max_height).clamp(0.0, 1.0),
            )
        }
        None => (1.0, 1.0, 0.0, 0.0),
    };

    let grounded = if snapshot.grounded { 1.0 } else { 0.0 };
    Observation([height, speed, distance, impact, width, obstacle_height, grounded])
}

/// Per-component view of one step's reward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub survival: f32,
    pub score: f32,
    pub clear: f32,
    pub jump: f32,
    /// Set on a terminal step; replaces the sum of the other components.
    pub terminal: Option<f32>,
}

impl RewardBreakdown {
    pub fn total(&self) -> f32 {
        self.terminal
            .unwrap_or(self.survival + self.score + self.clear + self.jump)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub observation: Observation,
    pub reward: f32,
    pub done: bool,
    pub snapshot: Snapshot,
    pub score_delta: u64,
    pub cleared_delta: u64,
    pub breakdown: RewardBreakdown,
}

pub struct Environment {
    engine: PhysicsEngine,
    config: EnvConfig,
    frame_skip: u32,
    terminal: bool,
}

impl Environment {
    pub fn new(
        physics: PhysicsConfig,
        config: EnvConfig,
        frame_skip: u32,
        seed: Option<u64>,
    ) -> Result<Self, RunnerError> {
        if frame_skip == 0 {
            return Err(RunnerError::config("frame_skip must be at least 1"));
        }
        Ok(Self {
            engine: PhysicsEngine::new(physics, seed),
            config,
            frame_skip,
            terminal: false,
        })
    }

    pub fn reset(&mut self) -> Observation {
        let snapshot = self.engine.reset();
        self.terminal = false;
        observe(&snapshot, self.engine.config(), &self.config)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn frame_skip(&self) -> u32 {
        self.frame_skip
    }

    pub fn snapshot(&self) -> Snapshot {
        self.engine.snapshot()
    }

    /// Apply `action` for `frame_skip` physics frames. A jump is issued on
    /// the first frame only; the repetition stops early on collision.
    pub fn step(&mut self, action: Action) -> Result<StepOutcome, RunnerError> {
        if self.terminal {
            return Err(RunnerError::EpisodeTerminated);
        }

        let before = self.engine.snapshot();
        let proximity = observe(&before, self.engine.config(), &self.config).distance();
        let well_timed = (0.0..=self.config.proximity_threshold).contains(&proximity);

        let mut snapshot = before.clone();
        let mut frames = 0u32;
        for repeat in 0..self.frame_skip {
            let jump = action.is_jump() && repeat == 0;
            snapshot = self.engine.step(jump, 1.0)?;
            frames += 1;
            if snapshot.done {
                break;
            }
        }

        let score_delta = snapshot.score - before.score;
        let cleared_delta = snapshot.cleared - before.cleared;
        let rewards = &self.config.rewards;
        let breakdown = RewardBreakdown {
            survival: rewards.survival_per_frame * frames as f32,
            score: rewards.score_coefficient * score_delta as f32,
            clear: rewards.clear_bonus * cleared_delta as f32,
            jump: match (action.is_jump(), well_timed) {
                (false, _) => 0.0,
                (true, true) => rewards.timed_jump_bonus,
                (true, false) => -rewards.untimed_jump_penalty,
            },
            terminal: snapshot.done.then_some(rewards.terminal_penalty),
        };
        let reward = breakdown.total();
        self.terminal = snapshot.done;

        trace!(?action, frames, reward, done = snapshot.done, "environment step");

        Ok(StepOutcome {
            observation: observe(&snapshot, self.engine.config(), &self.config),
            reward,
            done: snapshot.done,
            snapshot,
            score_delta,
            cleared_delta,
            breakdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_physics() -> PhysicsConfig {
        PhysicsConfig {
            initial_spawn_delay: f32::MAX,
            ..PhysicsConfig::default()
        }
    }

    fn env(frame_skip: u32) -> Environment {
        Environment::new(quiet_physics(), EnvConfig::default(), frame_skip, Some(11)).unwrap()
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn zero_frame_skip_is_rejected() {
        let result = Environment::new(quiet_physics(), EnvConfig::default(), 0, None);
        assert!(matches!(result.err(), Some(RunnerError::InvalidConfig(_))));
    }

    #[test]
    fn reset_observation_without_obstacles() {
        let mut env = env(2);
        let obs = env.reset();
        assert_eq!(obs.height(), 0.0);
        assert!(close(obs.0[1], 0.5));
        assert_eq!(obs.distance(), 1.0);
        assert_eq!(obs.0[3], 1.0);
        assert_eq!(obs.0[4], 0.0);
        assert_eq!(obs.0[5], 0.0);
        assert!(obs.grounded());
    }

    #[test]
    fn observation_describes_nearest_unpassed_obstacle() {
        let physics = PhysicsConfig::default();
        let env = EnvConfig::default();
        let mut passed = Obstacle::new(0.0, 20.0, 30.0);
        passed.passed = true;
        let snapshot = Snapshot {
            done: false,
            score: 0,
            speed: 6.0,
            actor_y: 240.0,
            velocity_y: -3.0,
            grounded: false,
            obstacles: vec![passed, Obstacle::new(490.0, 20.0, 30.0)],
            cleared: 1,
        };
        let obs = observe(&snapshot, &physics, &env);
        assert!(close(obs.height(), 0.5));
        // Gap from the actor's front edge (90) to 490 is 400 px.
        assert!(close(obs.distance(), 0.5));
        assert!(close(obs.0[3], 400.0 / 6.0 / 120.0));
        assert!(close(obs.0[4], 0.5));
        assert!(close(obs.0[5], 0.5));
        assert!(!obs.grounded());
    }

    #[test]
    fn idle_step_earns_survival_and_score() {
        let mut env = env(2);
        env.reset();
        let out = env.step(Action::Idle).unwrap();
        assert!(!out.done);
        assert_eq!(out.score_delta, 2);
        assert_eq!(out.cleared_delta, 0);
        assert!(close(out.breakdown.survival, 0.02));
        assert!(close(out.reward, 0.04));
    }

    #[test]
    fn jump_far_from_obstacles_is_penalised() {
        let mut env = env(2);
        env.reset();
        let out = env.step(Action::Jump).unwrap();
        assert!(close(out.breakdown.jump, -0.05));
        assert!(!out.snapshot.grounded);
    }

    #[test]
    fn jump_near_an_obstacle_is_rewarded() {
        let mut env = env(2);
        env.reset();
        env.engine.insert_obstacle(Obstacle::new(200.0, 20.0, 30.0));
        let out = env.step(Action::Jump).unwrap();
        assert!(!out.done);
        assert!(close(out.breakdown.jump, 0.1));
    }

    #[test]
    fn duck_behaves_as_idle() {
        let mut a = env(2);
        let mut b = env(2);
        a.reset();
        b.reset();
        let idle = a.step(Action::Idle).unwrap();
        let duck = b.step(Action::Duck).unwrap();
        assert_eq!(idle.snapshot, duck.snapshot);
        assert_eq!(idle.reward, duck.reward);
    }

    #[test]
    fn jump_is_only_issued_on_the_first_repeated_frame() {
        // Airtime is 40 frames; a repeated jump would relaunch after landing.
        let mut env = env(45);
        env.reset();
        let out = env.step(Action::Jump).unwrap();
        assert!(out.snapshot.grounded);
        assert_eq!(out.snapshot.velocity_y, 0.0);
    }

    #[test]
    fn collision_overrides_reward_and_stops_early() {
        let mut env = env(10);
        env.reset();
        env.engine.insert_obstacle(Obstacle::new(60.0, 30.0, 40.0));
        let out = env.step(Action::Jump).unwrap();
        assert!(out.done);
        assert_eq!(out.reward, -10.0);
        assert_eq!(out.breakdown.terminal, Some(-10.0));
        assert_eq!(out.score_delta, 0);
        assert!(env.is_terminal());
        assert_eq!(env.step(Action::Idle), Err(RunnerError::EpisodeTerminated));

        env.reset();
        assert!(!env.is_terminal());
        assert!(env.step(Action::Idle).is_ok());
    }

    #[test]
    fn unknown_action_index_is_rejected() {
        assert_eq!(Action::try_from(1), Ok(Action::Jump));
        assert_eq!(Action::try_from(7), Err(RunnerError::UnknownAction(7)));
    }
}
