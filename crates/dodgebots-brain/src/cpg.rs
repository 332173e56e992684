//! Open-loop oscillator brain used as a baseline and in smoke tests.
//!
//! Each motor is driven by an independent sine generator. The brain ignores
//! its sensors entirely, which makes it a useful control subject: any fitness
//! it earns comes from body dynamics alone.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use dodgebots_core::{MOTOR_COUNT, SENSOR_COUNT};

use crate::{Brain, BrainKind};

/// Parameters of one sine generator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Oscillator {
    pub amplitude: f32,
    pub frequency: f32,
    pub phase: f32,
    pub bias: f32,
}

impl Oscillator {
    fn random(rng: &mut dyn RngCore) -> Self {
        Self {
            amplitude: rng.random_range(0.1..1.0),
            frequency: rng.random_range(0.5..4.0),
            phase: rng.random_range(0.0..std::f32::consts::TAU),
            bias: rng.random_range(-0.3..0.3),
        }
    }

    fn sample(&self, time: f32) -> f32 {
        (self.bias + self.amplitude * (self.frequency * time + self.phase).sin()).clamp(-1.0, 1.0)
    }
}

/// Baseline central-pattern-generator brain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpgBrain {
    oscillators: [Oscillator; MOTOR_COUNT],
    dt: f32,
    elapsed: f32,
}

impl CpgBrain {
    /// Trait identifier for this brain family.
    pub const KIND: BrainKind = BrainKind::new("baseline.cpg");

    /// Construct a randomly parameterized brain stepping at `dt` seconds per think.
    #[must_use]
    pub fn random(rng: &mut dyn RngCore, dt: f32) -> Self {
        Self {
            oscillators: std::array::from_fn(|_| Oscillator::random(rng)),
            dt,
            elapsed: 0.0,
        }
    }
}

impl Brain for CpgBrain {
    fn kind(&self) -> BrainKind {
        Self::KIND
    }

    fn think(&mut self, _sensors: &[f32; SENSOR_COUNT]) -> [f32; MOTOR_COUNT] {
        let time = self.elapsed;
        self.elapsed += self.dt;
        std::array::from_fn(|index| self.oscillators[index].sample(time))
    }

    fn mutate(&mut self, rng: &mut dyn RngCore, rate: f32, scale: f32) {
        if rate <= 0.0 || scale <= 0.0 {
            return;
        }
        for oscillator in &mut self.oscillators {
            if rng.random::<f32>() < rate {
                oscillator.amplitude =
                    (oscillator.amplitude + rng.random_range(-scale..scale)).clamp(0.0, 1.0);
            }
            if rng.random::<f32>() < rate {
                oscillator.frequency =
                    (oscillator.frequency + rng.random_range(-scale..scale)).clamp(0.1, 6.0);
            }
            if rng.random::<f32>() < rate {
                oscillator.phase += rng.random_range(-scale..scale);
            }
            if rng.random::<f32>() < rate {
                oscillator.bias =
                    (oscillator.bias + rng.random_range(-scale..scale)).clamp(-0.5, 0.5);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    #[test]
    fn outputs_stay_in_motor_range() {
        let mut rng = SmallRng::seed_from_u64(0x0C9);
        let mut brain = CpgBrain::random(&mut rng, 1.0 / 60.0);
        for _ in 0..600 {
            let outputs = brain.think(&[0.0; SENSOR_COUNT]);
            for value in outputs {
                assert!((-1.0..=1.0).contains(&value));
            }
        }
    }

    #[test]
    fn mutation_perturbs_parameters() {
        let mut rng = SmallRng::seed_from_u64(0x5EED);
        let mut brain = CpgBrain::random(&mut rng, 1.0 / 60.0);
        let baseline = brain.clone();
        brain.mutate(&mut rng, 1.0, 0.5);
        let before: Vec<f32> = baseline
            .oscillators
            .iter()
            .map(|oscillator| oscillator.frequency)
            .collect();
        let after: Vec<f32> = brain
            .oscillators
            .iter()
            .map(|oscillator| oscillator.frequency)
            .collect();
        assert_ne!(before, after);
    }
}
