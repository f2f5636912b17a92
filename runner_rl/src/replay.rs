//! Fixed-capacity experience store with uniform sampling.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::environment::Observation;
use crate::error::RunnerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: Observation,
    pub action: usize,
    pub reward: f32,
    pub next_state: Observation,
    pub done: bool,
}

/// Ring buffer of transitions. Once full, each `add` overwrites the oldest
/// entry in place.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    storage: Vec<Transition>,
    capacity: usize,
    write: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Result<Self, RunnerError> {
        if capacity == 0 {
            return Err(RunnerError::config("replay buffer capacity must be at least 1"));
        }
        Ok(Self {
            storage: Vec::with_capacity(capacity.min(4096)),
            capacity,
            write: 0,
        })
    }

    pub fn add(&mut self, transition: Transition) {
        if self.storage.len() < self.capacity {
            self.storage.push(transition);
        } else {
            self.storage[self.write] = transition;
        }
        self.write = (self.write + 1) % self.capacity;
    }

    pub fn size(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Storage order, not insertion order, once the buffer has wrapped.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.storage.iter()
    }

    /// Draw `n` transitions uniformly, with replacement.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<&Transition>, RunnerError> {
        if self.storage.is_empty() {
            return Err(RunnerError::EmptyBuffer);
        }
        Ok((0..n)
            .map(|_| &self.storage[rng.gen_range(0..self.storage.len())])
            .collect())
    }
}
