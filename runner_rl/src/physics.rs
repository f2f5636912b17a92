//! Frame-stepped runner simulation.
//!
//! The engine owns all game state: the actor's vertical position and
//! velocity, the scroll speed, the score accumulator and the live obstacle
//! queue. Screen coordinates are used throughout, so y grows downward and the
//! actor's `actor_y` is the y of its feet.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::RunnerError;
use crate::settings::{PhysicsConfig, SpawnMode};

/// Categorical tag carried for renderers; the simulation ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObstacleKind {
    Small,
    Tall,
    Wide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub x: f32,
    pub width: f32,
    pub height: f32,
    /// Set once, the first time the trailing edge scrolls behind the actor.
    pub passed: bool,
    pub kind: ObstacleKind,
    /// Sprite index for display.
    pub variant: u8,
}

impl Obstacle {
    pub fn new(x: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            width,
            height,
            passed: false,
            kind: ObstacleKind::Small,
            variant: 0,
        }
    }

    pub fn trailing_edge(&self) -> f32 {
        self.x + self.width
    }
}

/// Mutable game state. Only [`PhysicsEngine::step`] and
/// [`PhysicsEngine::reset`] change it.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationState {
    pub actor_y: f32,
    pub velocity_y: f32,
    pub speed: f32,
    pub score: u64,
    pub score_fraction: f32,
    /// Oldest first, which is also ascending x.
    pub obstacles: VecDeque<Obstacle>,
    pub cleared: u64,
    pub spawn_cooldown: f32,
    pub done: bool,
}

/// Read-only view of the state after a step, suitable for rendering or replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub done: bool,
    pub score: u64,
    pub speed: f32,
    pub actor_y: f32,
    pub velocity_y: f32,
    pub grounded: bool,
    pub obstacles: Vec<Obstacle>,
    pub cleared: u64,
}

pub struct PhysicsEngine {
    config: PhysicsConfig,
    state: SimulationState,
    rng: StdRng,
}

impl PhysicsEngine {
    /// Build an engine in its canonical start state. With `seed` set, obstacle
    /// spawning is reproducible.
    pub fn new(config: PhysicsConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = Self::start_state(&config);
        Self { config, state, rng }
    }

    fn start_state(config: &PhysicsConfig) -> SimulationState {
        SimulationState {
            actor_y: config.ground_y,
            velocity_y: 0.0,
            speed: config.base_speed,
            score: 0,
            score_fraction: 0.0,
            obstacles: VecDeque::new(),
            cleared: 0,
            spawn_cooldown: config.initial_spawn_delay,
            done: false,
        }
    }

    /// Actor grounded, no obstacles, zero score, short spawn delay. The spawn
    /// RNG keeps its position so consecutive episodes differ.
    pub fn reset(&mut self) -> Snapshot {
        self.state = Self::start_state(&self.config);
        self.snapshot()
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn is_grounded(&self) -> bool {
        self.state.actor_y >= self.config.ground_y
    }

    /// Place an obstacle by hand, keeping the queue ordered by x.
    pub fn insert_obstacle(&mut self, obstacle: Obstacle) {
        let at = self
            .state
            .obstacles
            .iter()
            .position(|o| o.x > obstacle.x)
            .unwrap_or(self.state.obstacles.len());
        self.state.obstacles.insert(at, obstacle);
    }

    /// Advance by `frames` (may be fractional). Calling this again after a
    /// collision without [`reset`](Self::reset) is rejected.
    pub fn step(&mut self, jump: bool, frames: f32) -> Result<Snapshot, RunnerError> {
        if self.state.done {
            return Err(RunnerError::PhysicsTerminated);
        }
        let grounded = self.is_grounded();
        let Self { config, state, rng } = self;

        state.speed = config.base_speed
            + (state.score as f32 / config.speed_divisor).min(config.speed_bonus_cap);

        if jump && grounded {
            state.velocity_y = config.jump_velocity;
        }

        state.velocity_y += config.gravity * frames;
        state.actor_y += state.velocity_y * frames;
        if state.actor_y >= config.ground_y {
            state.actor_y = config.ground_y;
            state.velocity_y = 0.0;
        }

        state.spawn_cooldown -= frames;
        if state.spawn_cooldown <= 0.0 {
            state.obstacles.push_back(spawn_obstacle(config, rng));
            state.spawn_cooldown = next_cooldown(config, rng);
        }

        let dx = state.speed * frames;
        for obstacle in state.obstacles.iter_mut() {
            obstacle.x -= dx;
            if !obstacle.passed && obstacle.trailing_edge() < config.actor_x {
                obstacle.passed = true;
                state.cleared += 1;
            }
        }

        while state
            .obstacles
            .front()
            .map_or(false, |o| o.trailing_edge() < 0.0)
        {
            state.obstacles.pop_front();
        }

        if collides(config, state) {
            state.done = true;
            return Ok(self.snapshot());
        }

        state.score_fraction += state.speed / config.base_speed * frames;
        let whole = state.score_fraction.floor();
        if whole >= 1.0 {
            state.score += whole as u64;
            state.score_fraction -= whole;
        }

        Ok(self.snapshot())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            done: self.state.done,
            score: self.state.score,
            speed: self.state.speed,
            actor_y: self.state.actor_y,
            velocity_y: self.state.velocity_y,
            grounded: self.is_grounded(),
            obstacles: self.state.obstacles.iter().cloned().collect(),
            cleared: self.state.cleared,
        }
    }
}

fn spawn_obstacle(config: &PhysicsConfig, rng: &mut StdRng) -> Obstacle {
    let width = rng.gen_range(config.obstacle_min_width..=config.obstacle_max_width);
    let height = rng.gen_range(config.obstacle_min_height..=config.obstacle_max_height);
    let kind = if height > 0.75 * config.obstacle_max_height {
        ObstacleKind::Tall
    } else if width > 0.75 * config.obstacle_max_width {
        ObstacleKind::Wide
    } else {
        ObstacleKind::Small
    };
    Obstacle {
        x: config.world_width,
        width,
        height,
        passed: false,
        kind,
        variant: rng.gen_range(0..3),
    }
}

fn next_cooldown(config: &PhysicsConfig, rng: &mut StdRng) -> f32 {
    match config.spawn_mode {
        SpawnMode::Random => rng.gen_range(config.spawn_min_frames..=config.spawn_max_frames),
        SpawnMode::Fixed => config.spawn_interval_frames,
    }
}

/// Strict AABB overlap between the actor and any obstacle standing on the ground.
fn collides(config: &PhysicsConfig, state: &SimulationState) -> bool {
    let (ax0, ax1) = (config.actor_x, config.actor_x + config.actor_width);
    let (ay0, ay1) = (state.actor_y - config.actor_height, state.actor_y);
    state.obstacles.iter().any(|o| {
        let (ox0, ox1) = (o.x, o.trailing_edge());
        let (oy0, oy1) = (config.ground_y - o.height, config.ground_y);
        ax0 < ox1 && ox0 < ax1 && ay0 < oy1 && oy0 < ay1
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn engine(seed: u64) -> PhysicsEngine {
        PhysicsEngine::new(PhysicsConfig::default(), Some(seed))
    }

    #[test]
    fn reset_is_canonical() {
        let mut engine = engine(1);
        for _ in 0..100 {
            if engine.step(true, 1.0).unwrap().done {
                break;
            }
        }
        let snap = engine.reset();
        assert!(snap.grounded);
        assert!(!snap.done);
        assert_eq!(snap.score, 0);
        assert_eq!(snap.cleared, 0);
        assert!(snap.obstacles.is_empty());
        assert_eq!(engine.state().spawn_cooldown, engine.config().initial_spawn_delay);
    }

    #[test]
    fn no_double_jump() {
        let mut engine = engine(2);
        engine.step(true, 1.0).unwrap();
        let airborne = engine.state().velocity_y;
        assert!(airborne < 0.0);
        engine.step(true, 1.0).unwrap();
        let gravity = engine.config().gravity;
        assert!((engine.state().velocity_y - (airborne + gravity)).abs() < 1e-5);
    }

    #[test]
    fn jump_returns_to_ground() {
        let mut engine = engine(3);
        engine.step(true, 1.0).unwrap();
        assert!(!engine.snapshot().grounded);
        // Airtime is about 2 * |jump_velocity| / gravity = 40 frames.
        let mut airborne = 1;
        let snap = loop {
            let snap = engine.step(false, 1.0).unwrap();
            if snap.grounded {
                break snap;
            }
            airborne += 1;
            assert!(airborne < 60, "actor never landed");
        };
        assert!((37..=41).contains(&airborne));
        assert_eq!(snap.velocity_y, 0.0);
        assert_eq!(snap.actor_y, engine.config().ground_y);
    }

    #[test]
    fn collision_terminates_and_rejects_further_steps() {
        let mut engine = engine(4);
        let x = engine.config().actor_x;
        engine.insert_obstacle(Obstacle::new(x + 10.0, 30.0, 40.0));
        let snap = engine.step(false, 1.0).unwrap();
        assert!(snap.done);
        assert_eq!(engine.step(false, 1.0), Err(RunnerError::PhysicsTerminated));
        assert!(!engine.reset().done);
        assert!(engine.step(false, 1.0).is_ok());
    }

    #[test]
    fn fractional_frames_accumulate_score() {
        let mut engine = engine(5);
        assert_eq!(engine.step(false, 0.5).unwrap().score, 0);
        assert_eq!(engine.step(false, 0.5).unwrap().score, 1);
        assert!(engine.state().score_fraction.abs() < 1e-6);
    }

    #[test]
    fn speed_grows_with_score_up_to_cap() {
        let mut engine = PhysicsEngine::new(
            PhysicsConfig {
                initial_spawn_delay: f32::MAX,
                ..PhysicsConfig::default()
            },
            Some(6),
        );
        let mut last = 0.0;
        for _ in 0..3_000 {
            let snap = engine.step(false, 1.0).unwrap();
            assert!(snap.speed >= last);
            last = snap.speed;
        }
        assert_eq!(last, engine.config().max_speed());
    }

    #[test]
    fn obstacle_is_cleared_once_and_dropped_off_screen() {
        let mut engine = PhysicsEngine::new(
            PhysicsConfig {
                initial_spawn_delay: f32::MAX,
                ..PhysicsConfig::default()
            },
            Some(7),
        );
        // Behind the actor already, but still on screen.
        engine.insert_obstacle(Obstacle::new(5.0, 20.0, 30.0));
        let snap = engine.step(false, 1.0).unwrap();
        assert_eq!(snap.cleared, 1);
        assert!(snap.obstacles[0].passed);
        for _ in 0..3 {
            let snap = engine.step(false, 1.0).unwrap();
            assert_eq!(snap.obstacles.len(), 1);
            assert!(snap.obstacles[0].trailing_edge() >= 0.0);
            assert_eq!(snap.cleared, 1);
        }
        let snap = engine.step(false, 1.0).unwrap();
        assert!(snap.obstacles.is_empty());
        assert_eq!(snap.cleared, 1);
    }

    #[test]
    fn fixed_spawn_mode_is_scheduled() {
        let mut engine = PhysicsEngine::new(
            PhysicsConfig {
                spawn_mode: SpawnMode::Fixed,
                spawn_interval_frames: 10.0,
                initial_spawn_delay: 1.0,
                ..PhysicsConfig::default()
            },
            Some(8),
        );
        engine.step(false, 1.0).unwrap();
        assert_eq!(engine.state().obstacles.len(), 1);
        assert_eq!(engine.state().spawn_cooldown, 10.0);
    }

    #[test]
    fn same_seed_same_trajectory() {
        let actions: Vec<bool> = (0..400).map(|i| i % 37 == 0).collect();
        let run = |seed| {
            let mut engine = engine(seed);
            let mut snaps = vec![engine.reset()];
            for &jump in &actions {
                let snap = engine.step(jump, 1.0).unwrap();
                let done = snap.done;
                snaps.push(snap);
                if done {
                    break;
                }
            }
            snaps
        };
        assert_eq!(run(42), run(42));
    }

    proptest! {
        #[test]
        fn actor_never_penetrates_ground(
            seed in any::<u64>(),
            inputs in proptest::collection::vec((any::<bool>(), 0.1f32..3.0), 1..300),
        ) {
            let mut engine = engine(seed);
            let ground = engine.config().ground_y;
            let actor_x = engine.config().actor_x;
            let mut last_cleared = 0;
            for (jump, frames) in inputs {
                let snap = engine.step(jump, frames).unwrap();
                prop_assert!(snap.actor_y <= ground);
                if snap.actor_y == ground {
                    prop_assert_eq!(snap.velocity_y, 0.0);
                }
                for o in &snap.obstacles {
                    prop_assert!(o.trailing_edge() >= 0.0);
                    // Edges only move left, so this also makes the flag monotonic.
                    prop_assert_eq!(o.passed, o.trailing_edge() < actor_x);
                }
                prop_assert!(snap.cleared >= last_cleared);
                last_cleared = snap.cleared;
                if snap.done {
                    break;
                }
            }
        }
    }
}
