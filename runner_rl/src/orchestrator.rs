//! Training and evaluation loop running in its own task.
//!
//! Callers talk to it only through two channels: [`Command`]s in and
//! [`Event`]s out. One run executes at a time; its environment, agent and
//! replay buffer live on the task's stack and are dropped when the run ends.

use anyhow::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{DqnAgent, LearningAgent, RandomAgent};
use crate::environment::{Action, Environment, ACTION_COUNT};
use crate::error::RunnerError;
use crate::physics::Snapshot;
use crate::replay::Transition;
use crate::settings::{Settings, TrainingConfig};
use crate::store::ModelStore;

/// Overrides for a training run; unset fields fall back to `[training]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub episodes: Option<usize>,
    pub max_steps: Option<usize>,
    pub frame_skip: Option<u32>,
    pub epsilon_start: Option<f32>,
    pub epsilon_end: Option<f32>,
    pub epsilon_decay_episodes: Option<usize>,
    pub autosave_threshold: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalRequest {
    pub episodes: Option<usize>,
    pub max_steps: Option<usize>,
    /// Use the uniform random baseline instead of the saved model.
    pub random: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Start(StartRequest),
    Stop,
    Evaluate(EvalRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Progress {
        episode: usize,
        steps: usize,
        #[serde(rename = "return")]
        episode_return: f32,
        epsilon: f32,
        best_score: u64,
        episode_cleared: u64,
    },
    Frame {
        episode: usize,
        step: usize,
        epsilon: f32,
        snapshot: Snapshot,
        best_score: u64,
    },
    Autosaved {
        best_score: u64,
    },
    SaveFailed {
        message: String,
    },
    EvalResult {
        episode: usize,
        steps: usize,
    },
    Failed {
        message: String,
    },
    Done,
}

/// Fully resolved parameters of one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainPlan {
    pub episodes: usize,
    pub max_steps: usize,
    pub frame_skip: u32,
    pub epsilon_start: f32,
    pub epsilon_end: f32,
    pub decay_episodes: usize,
    pub autosave_threshold: Option<u64>,
}

impl StartRequest {
    /// Merge with `defaults`, rejecting values a run cannot honour.
    pub fn resolve(&self, defaults: &TrainingConfig) -> Result<TrainPlan, RunnerError> {
        let episodes = self.episodes.unwrap_or(defaults.episodes);
        let plan = TrainPlan {
            episodes,
            max_steps: self.max_steps.unwrap_or(defaults.max_steps),
            frame_skip: self.frame_skip.unwrap_or(defaults.frame_skip),
            epsilon_start: self.epsilon_start.unwrap_or(defaults.epsilon_start),
            epsilon_end: self.epsilon_end.unwrap_or(defaults.epsilon_end),
            decay_episodes: self
                .epsilon_decay_episodes
                .or(defaults.epsilon_decay_episodes)
                .unwrap_or(episodes),
            autosave_threshold: self.autosave_threshold.or(defaults.autosave_threshold),
        };
        if plan.max_steps == 0 {
            return Err(RunnerError::config("max_steps must be at least 1"));
        }
        if plan.frame_skip == 0 {
            return Err(RunnerError::config("frame_skip must be at least 1"));
        }
        for (name, value) in [("epsilon_start", plan.epsilon_start), ("epsilon_end", plan.epsilon_end)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RunnerError::config(format!("{name} must lie in [0, 1], got {value}")));
            }
        }
        Ok(plan)
    }
}

/// Linear interpolation from `start` to `end`, reached at episode `horizon`
/// and held afterwards.
pub fn epsilon_at(episode: usize, start: f32, end: f32, horizon: usize) -> f32 {
    if horizon == 0 {
        return end;
    }
    let progress = (episode as f32 / horizon as f32).min(1.0);
    start + (end - start) * progress
}

/// Caller side of a spawned orchestrator.
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    events: mpsc::Receiver<Event>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("orchestrator task has exited"))
    }

    /// Another sender for the command channel, e.g. for a signal handler.
    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Close the command channel and wait for the task to finish. A run in
    /// progress observes the closed channel as a stop.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            commands,
            events,
            task,
        } = self;
        drop(commands);
        drop(events);
        task.await?;
        Ok(())
    }
}

enum Poll {
    Continue,
    Stop,
}

pub struct Orchestrator {
    settings: Settings,
    store: ModelStore,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<Event>,
    rng: StdRng,
    last_frame: Option<Instant>,
}

impl Orchestrator {
    /// Start the orchestrator task on the current tokio runtime.
    pub fn spawn(settings: Settings, store: ModelStore) -> OrchestratorHandle {
        let capacity = settings.training.channel_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(2)),
            None => StdRng::from_entropy(),
        };
        let orchestrator = Self {
            settings,
            store,
            commands: command_rx,
            events: event_tx,
            rng,
            last_frame: None,
        };
        let task = tokio::spawn(orchestrator.run());
        OrchestratorHandle {
            commands: command_tx,
            events: event_rx,
            task,
        }
    }

    async fn run(mut self) {
        info!("orchestrator ready");
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Start(request) => {
                    let outcome = match request.resolve(&self.settings.training) {
                        Ok(plan) => self.train(&plan).await,
                        Err(e) => Err(e.into()),
                    };
                    self.finish("training", outcome).await;
                }
                Command::Evaluate(request) => {
                    let outcome = self.evaluate(&request).await;
                    self.finish("evaluation", outcome).await;
                }
                Command::Stop => debug!("stop received while idle; ignoring"),
            }
        }
        info!("command channel closed; orchestrator exiting");
    }

    async fn finish(&mut self, kind: &str, outcome: Result<()>) {
        if let Err(e) = outcome {
            error!(error = %e, "{} run failed", kind);
            self.emit(Event::Failed {
                message: format!("{e:#}"),
            })
            .await;
        }
        self.emit(Event::Done).await;
    }

    /// Drain pending commands. Only `stop` (or a closed channel) interrupts
    /// the run; anything else is dropped.
    fn poll_commands(&mut self) -> Poll {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Stop) => return Poll::Stop,
                Ok(other) => warn!(command = ?other, "run in progress; ignoring command"),
                Err(TryRecvError::Empty) => return Poll::Continue,
                Err(TryRecvError::Disconnected) => return Poll::Stop,
            }
        }
    }

    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }

    /// Best-effort and throttled; never waits on the consumer.
    fn emit_frame(&mut self, episode: usize, step: usize, epsilon: f32, snapshot: &Snapshot, best_score: u64) {
        if !self.settings.training.emit_frames {
            return;
        }
        let interval = Duration::from_millis(self.settings.training.frame_interval_ms);
        let now = Instant::now();
        if self
            .last_frame
            .map_or(false, |last| now.duration_since(last) < interval)
        {
            return;
        }
        self.last_frame = Some(now);
        let frame = Event::Frame {
            episode,
            step,
            epsilon,
            snapshot: snapshot.clone(),
            best_score,
        };
        match self.events.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!(episode, step, "event channel full; frame dropped"),
            Err(TrySendError::Closed(_)) => debug!("event receiver dropped"),
        }
    }

    fn new_environment(&self, frame_skip: u32) -> Result<Environment, RunnerError> {
        Environment::new(
            self.settings.physics.clone(),
            self.settings.environment.clone(),
            frame_skip,
            self.settings.seed,
        )
    }

    fn new_agent(&self) -> Result<DqnAgent> {
        Ok(
            DqnAgent::new(&self.settings.agent, self.settings.seed.map(|s| s.wrapping_add(1)))?
                .with_store(self.store.clone(), self.settings.persistence.model_name.clone()),
        )
    }

    #[instrument(skip(self), fields(episodes = plan.episodes))]
    async fn train(&mut self, plan: &TrainPlan) -> Result<()> {
        let mut env = self.new_environment(plan.frame_skip)?;
        let mut agent = self.new_agent()?;
        // The orchestrator draws exploration itself; the agent only exploits.
        agent.set_epsilon(0.0);

        let mut best_score = 0u64;
        let mut autosave_fired = false;
        info!(?plan, "training started");

        for episode in 0..plan.episodes {
            if let Poll::Stop = self.poll_commands() {
                info!(episode, "stop requested");
                break;
            }

            let epsilon = epsilon_at(episode, plan.epsilon_start, plan.epsilon_end, plan.decay_episodes);
            let mut observation = env.reset();
            let mut episode_return = 0.0;
            let mut steps = 0;
            let mut cleared = 0;
            let mut stopped = false;

            for step in 0..plan.max_steps {
                // Lets the command sender run on a single-threaded runtime.
                tokio::task::yield_now().await;
                if let Poll::Stop = self.poll_commands() {
                    stopped = true;
                    break;
                }

                let index = if self.rng.gen::<f32>() < epsilon {
                    self.rng.gen_range(0..ACTION_COUNT)
                } else {
                    agent.select_action(&observation).await
                };
                let outcome = env.step(Action::try_from(index)?)?;
                agent.observe(Transition {
                    state: observation,
                    action: index,
                    reward: outcome.reward,
                    next_state: outcome.observation,
                    done: outcome.done,
                });
                if let Some(loss) = agent.train().await? {
                    debug!(episode, step, loss, "update");
                }

                episode_return += outcome.reward;
                steps = step + 1;
                cleared = outcome.snapshot.cleared;
                observation = outcome.observation;
                self.emit_frame(episode, step, epsilon, &outcome.snapshot, best_score);

                if outcome.done {
                    break;
                }
            }

            best_score = best_score.max(cleared);
            if let Some(threshold) = plan.autosave_threshold {
                if !autosave_fired && best_score >= threshold {
                    autosave_fired = true;
                    match agent.save().await {
                        Ok(()) => self.emit(Event::Autosaved { best_score }).await,
                        Err(e) => {
                            warn!(error = %e, "autosave failed");
                            self.emit(Event::SaveFailed {
                                message: format!("{e:#}"),
                            })
                            .await;
                        }
                    }
                }
            }

            info!(episode, steps, episode_return, epsilon, best_score, cleared, "episode finished");
            self.emit(Event::Progress {
                episode,
                steps,
                episode_return,
                epsilon,
                best_score,
                episode_cleared: cleared,
            })
            .await;

            if stopped {
                info!(episode, "stop requested");
                break;
            }
        }

        info!(best_score, updates = agent.updates(), "training finished");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn evaluate(&mut self, request: &EvalRequest) -> Result<()> {
        let defaults = &self.settings.training;
        let episodes = request.episodes.unwrap_or(defaults.eval_episodes);
        let max_steps = request.max_steps.unwrap_or(defaults.max_steps);
        if max_steps == 0 {
            return Err(RunnerError::config("max_steps must be at least 1").into());
        }
        let mut env = self.new_environment(defaults.frame_skip)?;

        let mut agent: Box<dyn LearningAgent> = if request.random {
            Box::new(RandomAgent::new(self.settings.seed.map(|s| s.wrapping_add(3))))
        } else {
            let mut agent = self.new_agent()?;
            if !agent.load().await {
                warn!("no usable saved model; evaluating freshly initialised parameters");
            }
            agent.set_epsilon(0.0);
            Box::new(agent)
        };
        info!(agent = agent.name(), episodes, max_steps, "evaluation started");

        let mut best_score = 0u64;
        for episode in 0..episodes {
            if let Poll::Stop = self.poll_commands() {
                info!(episode, "stop requested");
                break;
            }

            let mut observation = env.reset();
            let mut steps = 0;
            let mut stopped = false;
            for step in 0..max_steps {
                tokio::task::yield_now().await;
                if let Poll::Stop = self.poll_commands() {
                    stopped = true;
                    break;
                }
                let index = agent.select_action(&observation).await;
                let outcome = env.step(Action::try_from(index)?)?;
                steps = step + 1;
                observation = outcome.observation;
                best_score = best_score.max(outcome.snapshot.cleared);
                self.emit_frame(episode, step, agent.epsilon(), &outcome.snapshot, best_score);
                if outcome.done {
                    break;
                }
            }

            info!(episode, steps, "evaluation episode finished");
            self.emit(Event::EvalResult { episode, steps }).await;
            if stopped {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epsilon_anneals_then_holds() {
        assert!((epsilon_at(0, 1.0, 0.1, 200) - 1.0).abs() < 1e-6);
        assert!((epsilon_at(100, 1.0, 0.1, 200) - 0.55).abs() < 1e-6);
        assert!((epsilon_at(200, 1.0, 0.1, 200) - 0.1).abs() < 1e-6);
        assert!((epsilon_at(400, 1.0, 0.1, 200) - 0.1).abs() < 1e-6);
        assert_eq!(epsilon_at(3, 1.0, 0.1, 0), 0.1);
    }

    #[test]
    fn start_request_falls_back_to_defaults() {
        let defaults = TrainingConfig::default();
        let plan = StartRequest::default().resolve(&defaults).unwrap();
        assert_eq!(plan.episodes, 50);
        assert_eq!(plan.max_steps, 2000);
        assert_eq!(plan.frame_skip, 2);
        assert_eq!(plan.decay_episodes, 50);
        assert_eq!(plan.autosave_threshold, None);

        let plan = StartRequest {
            episodes: Some(10),
            epsilon_decay_episodes: Some(4),
            autosave_threshold: Some(3),
            ..StartRequest::default()
        }
        .resolve(&defaults)
        .unwrap();
        assert_eq!(plan.episodes, 10);
        assert_eq!(plan.decay_episodes, 4);
        assert_eq!(plan.autosave_threshold, Some(3));
    }

    #[test]
    fn out_of_range_overrides_are_rejected() {
        let defaults = TrainingConfig::default();
        let cases = [
            StartRequest {
                max_steps: Some(0),
                ..StartRequest::default()
            },
            StartRequest {
                frame_skip: Some(0),
                ..StartRequest::default()
            },
            StartRequest {
                epsilon_start: Some(7.0),
                ..StartRequest::default()
            },
            StartRequest {
                epsilon_end: Some(-0.1),
                ..StartRequest::default()
            },
        ];
        for request in cases {
            assert!(
                matches!(request.resolve(&defaults), Err(RunnerError::InvalidConfig(_))),
                "{request:?} was accepted"
            );
        }
    }

    #[test]
    fn commands_use_a_type_tag() {
        let start: Command =
            serde_json::from_str(r#"{"type":"start","episodes":3,"max_steps":10}"#).unwrap();
        assert_eq!(
            start,
            Command::Start(StartRequest {
                episodes: Some(3),
                max_steps: Some(10),
                ..StartRequest::default()
            })
        );
        let stop: Command = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(stop, Command::Stop);
        let eval: Command = serde_json::from_str(r#"{"type":"evaluate","random":true}"#).unwrap();
        assert!(matches!(eval, Command::Evaluate(EvalRequest { random: true, .. })));
    }

    #[test]
    fn progress_serialises_return_field() {
        let event = Event::Progress {
            episode: 1,
            steps: 20,
            episode_return: 1.5,
            epsilon: 0.5,
            best_score: 2,
            episode_cleared: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["return"], 1.5);
        assert_eq!(serde_json::to_value(Event::Done).unwrap()["type"], "done");
    }
}
