//! Small fully connected Q-value network with manual backpropagation.
//!
//! Layers are dense with ReLU between them and a linear output. Parameters
//! are plain `Vec<f32>` so the whole network serialises with serde.

use rand::{distributions::Uniform, Rng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    /// Row-major `[out_dim, in_dim]`.
    weights: Vec<f32>,
    bias: Vec<f32>,
    in_dim: usize,
    out_dim: usize,
}

impl Dense {
    pub fn xavier(in_dim: usize, out_dim: usize, rng: &mut impl Rng) -> Self {
        let limit = (6.0f32 / (in_dim as f32 + out_dim as f32)).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        Self {
            weights: (0..in_dim * out_dim).map(|_| rng.sample(dist)).collect(),
            bias: vec![0.0; out_dim],
            in_dim,
            out_dim,
        }
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn forward(&self, x: &[f32]) -> Vec<f32> {
        (0..self.out_dim)
            .map(|o| {
                let row = &self.weights[o * self.in_dim..(o + 1) * self.in_dim];
                self.bias[o] + row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>()
            })
            .collect()
    }

    /// Accumulate parameter gradients into `grad` and return d(loss)/d(x).
    fn backward(&self, x: &[f32], grad_out: &[f32], grad: &mut DenseGrad) -> Vec<f32> {
        let mut grad_in = vec![0.0; self.in_dim];
        for (o, &go) in grad_out.iter().enumerate() {
            let base = o * self.in_dim;
            for i in 0..self.in_dim {
                grad.weights[base + i] += go * x[i];
                grad_in[i] += self.weights[base + i] * go;
            }
            grad.bias[o] += go;
        }
        grad_in
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DenseGrad {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

/// Gradients (or optimiser moments) shaped like a [`QNetwork`].
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    layers: Vec<DenseGrad>,
}

impl Gradients {
    pub fn zeros_like(net: &QNetwork) -> Self {
        Self {
            layers: net
                .layers
                .iter()
                .map(|l| DenseGrad {
                    weights: vec![0.0; l.weights.len()],
                    bias: vec![0.0; l.bias.len()],
                })
                .collect(),
        }
    }

    fn values(&self) -> impl Iterator<Item = &f32> {
        self.layers
            .iter()
            .flat_map(|l| l.weights.iter().chain(l.bias.iter()))
    }

    fn values_mut(&mut self) -> impl Iterator<Item = &mut f32> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.weights.iter_mut().chain(l.bias.iter_mut()))
    }

    pub fn scale(&mut self, factor: f32) {
        self.values_mut().for_each(|g| *g *= factor);
    }

    pub fn global_norm(&self) -> f32 {
        self.values().map(|g| g * g).sum::<f32>().sqrt()
    }

    /// Rescale so the global L2 norm is at most `max_norm`. Returns the norm
    /// before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        if norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
        norm
    }
}

/// Per-layer activations from a forward pass; `activations[0]` is the input.
#[derive(Debug, Clone)]
pub struct Trace {
    activations: Vec<Vec<f32>>,
}

impl Trace {
    pub fn output(&self) -> &[f32] {
        self.activations.last().map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QNetwork {
    layers: Vec<Dense>,
}

impl QNetwork {
    pub fn new(input: usize, hidden: &[usize], output: usize, rng: &mut impl Rng) -> Self {
        let mut widths = Vec::with_capacity(hidden.len() + 2);
        widths.push(input);
        widths.extend_from_slice(hidden);
        widths.push(output);
        let layers = widths
            .windows(2)
            .map(|w| Dense::xavier(w[0], w[1], rng))
            .collect();
        Self { layers }
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, Dense::in_dim)
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, Dense::out_dim)
    }

    /// `(in, out)` per layer; two networks with equal shapes can exchange
    /// parameters.
    pub fn shape(&self) -> Vec<(usize, usize)> {
        self.layers.iter().map(|l| (l.in_dim, l.out_dim)).collect()
    }

    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        self.forward_trace(x).activations.pop().unwrap_or_default()
    }

    pub fn forward_trace(&self, x: &[f32]) -> Trace {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(x.to_vec());
        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter().enumerate() {
            let mut out = layer.forward(&activations[i]);
            if i < last {
                out.iter_mut().for_each(|v| *v = v.max(0.0));
            }
            activations.push(out);
        }
        Trace { activations }
    }

    /// Backpropagate d(loss)/d(output) through a recorded forward pass,
    /// accumulating into `grads`.
    pub fn backward(&self, trace: &Trace, grad_out: &[f32], grads: &mut Gradients) {
        let last = self.layers.len().saturating_sub(1);
        let mut grad = grad_out.to_vec();
        for (i, layer) in self.layers.iter().enumerate().rev() {
            if i < last {
                for (g, &a) in grad.iter_mut().zip(&trace.activations[i + 1]) {
                    if a <= 0.0 {
                        *g = 0.0;
                    }
                }
            }
            grad = layer.backward(&trace.activations[i], &grad, &mut grads.layers[i]);
        }
    }

    pub fn copy_from(&mut self, other: &QNetwork) {
        self.layers.clone_from(&other.layers);
    }

    /// Polyak update: `self = tau * other + (1 - tau) * self`.
    pub fn blend_from(&mut self, other: &QNetwork, tau: f32) {
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            for (a, b) in mine.weights.iter_mut().zip(&theirs.weights) {
                *a = tau * b + (1.0 - tau) * *a;
            }
            for (a, b) in mine.bias.iter_mut().zip(&theirs.bias) {
                *a = tau * b + (1.0 - tau) * *a;
            }
        }
    }

    fn params_mut(&mut self) -> impl Iterator<Item = &mut f32> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.weights.iter_mut().chain(l.bias.iter_mut()))
    }
}

/// Index of the largest value; ties resolve to the lowest index.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Huber loss of a residual and its derivative.
pub fn huber(error: f32, delta: f32) -> (f32, f32) {
    if error.abs() <= delta {
        (0.5 * error * error, error)
    } else {
        (delta * (error.abs() - 0.5 * delta), delta * error.signum())
    }
}

pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    m: Gradients,
    v: Gradients,
}

impl Adam {
    pub fn new(lr: f32, net: &QNetwork) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Gradients::zeros_like(net),
            v: Gradients::zeros_like(net),
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }

    pub fn step(&mut self, net: &mut QNetwork, grads: &Gradients) {
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);
        let (beta1, beta2, lr, eps) = (self.beta1, self.beta2, self.lr, self.eps);
        let moments = self.m.values_mut().zip(self.v.values_mut());
        for ((p, g), (m, v)) in net.params_mut().zip(grads.values()).zip(moments) {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        }
    }
}
