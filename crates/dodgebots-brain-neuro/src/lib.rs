//! NeuroFlow-backed controller genomes.
//!
//! A [`NeuroGenome`] records a feed-forward architecture plus every weight,
//! and builds an activatable [`FeedForward`] network on demand. The network
//! is constructed by serializing a seed structure that mirrors NeuroFlow's
//! own layout and deserializing it back, since the crate exposes no public
//! setter for individual weights. Weight-level mutation happens on the
//! genome, so the evolutionary layer never touches a live network.

use neuroflow::FeedForward;
use neuroflow::activators::Type;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use dodgebots_brain::{Brain, BrainKind, into_runner};
use dodgebots_core::{
    ControllerFault, ControllerRunner, EvalGenome, MOTOR_COUNT, SENSOR_COUNT,
};

/// Number of inputs inherited from the agent sensors.
const INPUT_SIZE: usize = SENSOR_COUNT;
/// Number of outputs consumed by the actuation stage.
const OUTPUT_SIZE: usize = MOTOR_COUNT;

/// Activation families supported by NeuroFlow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum ActivationKind {
    /// Hyperbolic tangent activation.
    #[default]
    Tanh,
    /// Logistic sigmoid activation.
    Sigmoid,
    /// Rectified linear unit (ReLU).
    Relu,
}

impl ActivationKind {
    fn to_type(self) -> Type {
        match self {
            Self::Tanh => Type::Tanh,
            Self::Sigmoid => Type::Sigmoid,
            Self::Relu => Type::Relu,
        }
    }
}

/// Configuration options shared by every genome of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NeuroConfig {
    /// Sizes of hidden layers between the fixed input/output layers.
    pub hidden_layers: Vec<usize>,
    /// Activation function applied to hidden/output layers.
    pub activation: ActivationKind,
    /// Learning rate baked into the network (unused during pure inference).
    pub learning_rate: f64,
    /// Momentum factor baked into the network.
    pub momentum: f64,
}

impl Default for NeuroConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![24, 12],
            activation: ActivationKind::Tanh,
            learning_rate: 0.01,
            momentum: 0.05,
        }
    }
}

// Serde mirrors of NeuroFlow's internal layout, used to seed weights.
#[derive(Serialize)]
struct LayerSeed {
    v: Vec<f64>,
    y: Vec<f64>,
    delta: Vec<f64>,
    prev_delta: Vec<f64>,
    w: Vec<Vec<f64>>,
}

#[derive(Serialize)]
struct FeedForwardSeed {
    layers: Vec<LayerSeed>,
    learn_rate: f64,
    momentum: f64,
    error: f64,
    act_type: Type,
}

/// One evolvable controller: architecture, weights, and the fitness the
/// evaluator wrote back after the last generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuroGenome {
    config: NeuroConfig,
    /// `weights[layer][neuron]` holds that neuron's input weights plus bias.
    weights: Vec<Vec<Vec<f64>>>,
    pub fitness: f64,
}

impl NeuroGenome {
    /// Fully connected architecture, input layer first.
    fn architecture(config: &NeuroConfig) -> Vec<usize> {
        let mut layers = Vec::with_capacity(config.hidden_layers.len() + 2);
        layers.push(INPUT_SIZE);
        layers.extend(config.hidden_layers.iter().copied());
        layers.push(OUTPUT_SIZE);
        layers
    }

    /// Construct a genome with uniformly random weights in [-1, 1].
    #[must_use]
    pub fn random(config: NeuroConfig, rng: &mut dyn RngCore) -> Self {
        let architecture = Self::architecture(&config);
        let mut weights = Vec::with_capacity(architecture.len() - 1);
        for window in architecture.windows(2) {
            let (inputs, outputs) = (window[0], window[1]);
            let mut layer = Vec::with_capacity(outputs);
            for _ in 0..outputs {
                let mut neuron = Vec::with_capacity(inputs + 1);
                for _ in 0..=inputs {
                    neuron.push(rng.random_range(-1.0..1.0));
                }
                layer.push(neuron);
            }
            weights.push(layer);
        }
        Self {
            config,
            weights,
            fitness: 0.0,
        }
    }

    /// Shared run configuration.
    #[must_use]
    pub fn config(&self) -> &NeuroConfig {
        &self.config
    }

    /// Perturb each weight with probability `rate` by a uniform delta in
    /// `[-scale, scale]`.
    pub fn mutate(&mut self, rng: &mut dyn RngCore, rate: f32, scale: f64) {
        if rate <= 0.0 || scale <= 0.0 {
            return;
        }
        for layer in &mut self.weights {
            for neuron in layer {
                for weight in neuron {
                    if rng.random::<f32>() < rate {
                        *weight += rng.random_range(-scale..scale);
                    }
                }
            }
        }
    }

    /// Build the activatable network recorded by this genome.
    pub fn build_brain(&self) -> Result<NeuroBrain, ControllerFault> {
        let layers = self
            .weights
            .iter()
            .map(|layer| LayerSeed {
                v: vec![0.0; layer.len()],
                y: vec![0.0; layer.len()],
                delta: vec![0.0; layer.len()],
                prev_delta: vec![0.0; layer.len()],
                w: layer.clone(),
            })
            .collect();
        let seed = FeedForwardSeed {
            layers,
            learn_rate: self.config.learning_rate,
            momentum: self.config.momentum,
            error: 0.0,
            act_type: self.config.activation.to_type(),
        };

        let value = serde_json::to_value(&seed)
            .map_err(|error| ControllerFault::Activation(format!("network seed: {error}")))?;
        let mut network: FeedForward = serde_json::from_value(value)
            .map_err(|error| ControllerFault::Activation(format!("network build: {error}")))?;
        network
            .activation(self.config.activation.to_type())
            .learning_rate(self.config.learning_rate)
            .momentum(self.config.momentum);

        Ok(NeuroBrain {
            network,
            inputs: vec![0.0; INPUT_SIZE],
        })
    }
}

impl EvalGenome for NeuroGenome {
    fn build_runner(&self) -> Result<Box<dyn ControllerRunner>, ControllerFault> {
        Ok(into_runner(self.build_brain()?))
    }

    fn set_fitness(&mut self, fitness: f64) {
        self.fitness = fitness;
    }
}

/// Runtime brain leveraging NeuroFlow's feed-forward network.
pub struct NeuroBrain {
    network: FeedForward,
    inputs: Vec<f64>,
}

impl std::fmt::Debug for NeuroBrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeuroBrain").finish_non_exhaustive()
    }
}

impl NeuroBrain {
    /// Identifier for this brain family.
    pub const KIND: BrainKind = BrainKind::new("ml.neuroflow");
}

impl Brain for NeuroBrain {
    fn kind(&self) -> BrainKind {
        Self::KIND
    }

    fn think(&mut self, sensors: &[f32; SENSOR_COUNT]) -> [f32; MOTOR_COUNT] {
        for (slot, value) in self.inputs.iter_mut().zip(sensors.iter()) {
            *slot = f64::from(*value);
        }
        let outputs = self.network.calc(&self.inputs);
        let mut result = [0.0; MOTOR_COUNT];
        for (dst, src) in result.iter_mut().zip(outputs.iter()) {
            *dst = *src as f32;
        }
        result
    }

    fn mutate(&mut self, _rng: &mut dyn RngCore, _rate: f32, _scale: f32) {
        // Mutation operates on the genome, not on a live network.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    #[test]
    fn runner_executes_and_returns_outputs() {
        let mut rng = SmallRng::seed_from_u64(0xBEEF);
        let genome = NeuroGenome::random(NeuroConfig::default(), &mut rng);
        let mut runner = genome.build_runner().expect("runner");
        let outputs = runner.activate(&[0.0; SENSOR_COUNT]).expect("activation");
        assert_eq!(outputs.len(), MOTOR_COUNT);
        assert!(outputs.iter().all(|value| value.is_finite()));
    }

    #[test]
    fn identical_genomes_activate_identically() {
        let mut rng = SmallRng::seed_from_u64(0xCAFE);
        let genome = NeuroGenome::random(NeuroConfig::default(), &mut rng);
        let sensors = [0.25; SENSOR_COUNT];

        let mut first = genome.build_brain().expect("brain");
        let mut second = genome.build_brain().expect("brain");
        assert_eq!(first.think(&sensors), second.think(&sensors));
    }

    #[test]
    fn mutation_changes_behavior() {
        let mut rng = SmallRng::seed_from_u64(0xF00D);
        let baseline = NeuroGenome::random(NeuroConfig::default(), &mut rng);
        let mut mutated = baseline.clone();
        mutated.mutate(&mut rng, 1.0, 0.5);

        let sensors = [0.5; SENSOR_COUNT];
        let before = baseline.build_brain().expect("brain").think(&sensors);
        let after = mutated.build_brain().expect("brain").think(&sensors);
        assert_ne!(before, after);
    }
}
