use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, instrument, warn};

use crate::environment::{Observation, ACTION_COUNT, OBS_DIM};
use crate::error::RunnerError;
use crate::network::{argmax, huber, Adam, Gradients, QNetwork};
use crate::replay::{ReplayBuffer, Transition};
use crate::settings::{AgentConfig, TargetSync};
use crate::store::ModelStore;

/// Anything the orchestrator can drive through an episode.
#[async_trait]
pub trait LearningAgent: Send {
    fn name(&self) -> &str;
    async fn select_action(&mut self, observation: &Observation) -> usize;
    fn observe(&mut self, transition: Transition);
    /// `Ok(None)` when no update ran on this call.
    async fn train(&mut self) -> Result<Option<f32>>;
    async fn save(&mut self) -> Result<()>;
    /// Restore saved parameters. Never fails outward; `false` means the
    /// agent kept its current parameters.
    async fn load(&mut self) -> bool;
    fn epsilon(&self) -> f32;
    fn set_epsilon(&mut self, epsilon: f32);
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

// --- Baseline ---

/// Uniform random policy over the learnable actions.
pub struct RandomAgent {
    rng: StdRng,
}

impl RandomAgent {
    pub fn new(seed: Option<u64>) -> Self {
        Self { rng: seeded(seed) }
    }
}

#[async_trait]
impl LearningAgent for RandomAgent {
    fn name(&self) -> &str {
        "random"
    }

    async fn select_action(&mut self, _observation: &Observation) -> usize {
        self.rng.gen_range(0..ACTION_COUNT)
    }

    fn observe(&mut self, _transition: Transition) {}

    async fn train(&mut self) -> Result<Option<f32>> {
        Ok(None)
    }

    async fn save(&mut self) -> Result<()> {
        Ok(())
    }

    async fn load(&mut self) -> bool {
        false
    }

    fn epsilon(&self) -> f32 {
        1.0
    }

    fn set_epsilon(&mut self, _epsilon: f32) {}
}

// --- Double DQN ---

pub struct DqnAgent {
    config: AgentConfig,
    online: QNetwork,
    target: QNetwork,
    optimizer: Adam,
    buffer: ReplayBuffer,
    rng: StdRng,
    epsilon: f32,
    train_calls: u64,
    updates: u64,
    store: Option<(ModelStore, String)>,
}

impl DqnAgent {
    pub fn new(config: &AgentConfig, seed: Option<u64>) -> Result<Self> {
        let buffer = ReplayBuffer::new(config.buffer_capacity)?;
        if config.batch_size == 0 {
            return Err(RunnerError::config("agent.batch_size must be at least 1").into());
        }
        if config.batch_size > config.buffer_capacity {
            return Err(RunnerError::config("agent.batch_size exceeds agent.buffer_capacity").into());
        }
        let mut rng = seeded(seed);
        let online = QNetwork::new(OBS_DIM, &config.hidden_layers, ACTION_COUNT, &mut rng);
        let target = online.clone();
        let optimizer = Adam::new(config.learning_rate, &online);
        Ok(Self {
            config: config.clone(),
            online,
            target,
            optimizer,
            buffer,
            rng,
            epsilon: 1.0,
            train_calls: 0,
            updates: 0,
            store: None,
        })
    }

    /// Persist to and restore from `store` under `model_name`.
    pub fn with_store(mut self, store: ModelStore, model_name: impl Into<String>) -> Self {
        self.store = Some((store, model_name.into()));
        self
    }

    pub fn q_values(&self, observation: &Observation) -> Vec<f32> {
        self.online.forward(observation.as_slice())
    }

    /// Deterministic argmax over the online network.
    pub fn greedy_action(&self, observation: &Observation) -> usize {
        argmax(&self.q_values(observation))
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    pub fn online(&self) -> &QNetwork {
        &self.online
    }

    pub fn target(&self) -> &QNetwork {
        &self.target
    }

    /// One gradient step on a sampled batch; returns the mean Huber loss.
    fn update(&mut self) -> Result<f32> {
        let batch = self.buffer.sample(self.config.batch_size, &mut self.rng)?;
        let n = batch.len() as f32;
        let mut grads = Gradients::zeros_like(&self.online);
        let mut loss = 0.0;

        for t in &batch {
            if t.action >= ACTION_COUNT {
                return Err(RunnerError::UnknownAction(t.action).into());
            }
            // Online net picks the next action, target net values it.
            let next_action = argmax(&self.online.forward(t.next_state.as_slice()));
            let next_value = self.target.forward(t.next_state.as_slice())[next_action];
            let continuing = if t.done { 0.0 } else { 1.0 };
            let td_target = t.reward + self.config.gamma * continuing * next_value;

            let trace = self.online.forward_trace(t.state.as_slice());
            let (l, dl) = huber(trace.output()[t.action] - td_target, self.config.huber_delta);
            loss += l;

            let mut grad_out = [0.0; ACTION_COUNT];
            grad_out[t.action] = dl / n;
            self.online.backward(&trace, &grad_out, &mut grads);
        }

        if let Some(max_norm) = self.config.max_grad_norm {
            grads.clip_global_norm(max_norm);
        }
        self.optimizer.step(&mut self.online, &grads);
        self.updates += 1;

        match self.config.target_sync() {
            TargetSync::Hard { interval } => {
                if self.updates % interval.max(1) == 0 {
                    self.target.copy_from(&self.online);
                    debug!(updates = self.updates, "target network synced");
                }
            }
            TargetSync::Soft { tau } => self.target.blend_from(&self.online, tau),
        }

        Ok(loss / n)
    }
}

#[async_trait]
impl LearningAgent for DqnAgent {
    fn name(&self) -> &str {
        "dqn"
    }

    async fn select_action(&mut self, observation: &Observation) -> usize {
        if self.rng.gen::<f32>() < self.epsilon {
            self.rng.gen_range(0..ACTION_COUNT)
        } else {
            self.greedy_action(observation)
        }
    }

    fn observe(&mut self, transition: Transition) {
        self.buffer.add(transition);
    }

    async fn train(&mut self) -> Result<Option<f32>> {
        self.train_calls += 1;
        if self.buffer.len() < self.config.warmup.max(1) {
            return Ok(None);
        }
        if self.train_calls % self.config.train_every.max(1) != 0 {
            return Ok(None);
        }
        self.update().map(Some)
    }

    #[instrument(skip(self), fields(agent = "dqn"))]
    async fn save(&mut self) -> Result<()> {
        let (store, name) = self
            .store
            .clone()
            .ok_or_else(|| anyhow!("no model store configured"))?;
        let online = self.online.clone();
        let target = self.target.clone();
        tokio::task::spawn_blocking(move || store.save_pair(&name, &online, &target))
            .await
            .context("model save task panicked")??;
        info!(updates = self.updates, "model saved");
        Ok(())
    }

    async fn load(&mut self) -> bool {
        let Some((store, name)) = self.store.clone() else {
            return false;
        };
        let loaded = tokio::task::spawn_blocking(move || store.load_pair(&name)).await;
        match loaded {
            Ok(Ok(Some((online, target)))) => {
                let shape = self.online.shape();
                if online.shape() != shape || target.shape() != shape {
                    warn!(
                        saved = ?online.shape(),
                        expected = ?shape,
                        "saved model shape does not match; keeping current parameters"
                    );
                    return false;
                }
                self.optimizer = Adam::new(self.config.learning_rate, &online);
                self.online = online;
                self.target = target;
                info!("model loaded");
                true
            }
            Ok(Ok(None)) => {
                debug!("no saved model found");
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to read saved model");
                false
            }
            Err(e) => {
                warn!(error = %e, "model load task panicked");
                false
            }
        }
    }

    fn epsilon(&self) -> f32 {
        self.epsilon
    }

    fn set_epsilon(&mut self, epsilon: f32) {
        self.epsilon = epsilon.clamp(0.0, 1.0);
    }
}
