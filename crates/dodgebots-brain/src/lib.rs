//! Traits and baseline implementations for DodgeBots controller brains.

use dodgebots_core::{ControllerFault, ControllerRunner, MOTOR_COUNT, SENSOR_COUNT};
use rand::RngCore;

mod cpg;

pub use cpg::{CpgBrain, Oscillator};

/// Identifier for a brain family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrainKind(&'static str);

impl BrainKind {
    /// Build a kind from a static identifier string.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The identifier string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

/// Shared interface implemented by all agent brains.
pub trait Brain: Send {
    /// Immutable brain identifier (useful for diagnostics).
    fn kind(&self) -> BrainKind;

    /// Evaluate motor outputs given the latest sensor vector.
    fn think(&mut self, sensors: &[f32; SENSOR_COUNT]) -> [f32; MOTOR_COUNT];

    /// Mutate the brain's internal state given mutation rate and scale.
    fn mutate(&mut self, rng: &mut dyn RngCore, rate: f32, scale: f32);
}

/// Adapter lifting a [`Brain`] into the core's object-safe runner.
///
/// Outputs are checked for finiteness; a NaN or infinite command surfaces as
/// a controller fault and terminates the owning agent instead of poisoning
/// the physics state.
pub struct BrainRunnerAdapter<B: Brain> {
    pub brain: B,
}

impl<B: Brain> ControllerRunner for BrainRunnerAdapter<B> {
    fn kind(&self) -> &'static str {
        self.brain.kind().as_str()
    }

    fn activate(
        &mut self,
        sensors: &[f32; SENSOR_COUNT],
    ) -> Result<[f32; MOTOR_COUNT], ControllerFault> {
        let outputs = self.brain.think(sensors);
        if outputs.iter().all(|value| value.is_finite()) {
            Ok(outputs)
        } else {
            Err(ControllerFault::NonFinite)
        }
    }
}

/// Box a brain into a [`ControllerRunner`].
#[must_use]
pub fn into_runner<B: Brain + 'static>(brain: B) -> Box<dyn ControllerRunner> {
    Box::new(BrainRunnerAdapter { brain })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NanBrain;

    impl Brain for NanBrain {
        fn kind(&self) -> BrainKind {
            BrainKind::new("test.nan")
        }

        fn think(&mut self, _sensors: &[f32; SENSOR_COUNT]) -> [f32; MOTOR_COUNT] {
            [f32::NAN; MOTOR_COUNT]
        }

        fn mutate(&mut self, _rng: &mut dyn RngCore, _rate: f32, _scale: f32) {}
    }

    #[test]
    fn non_finite_outputs_surface_as_faults() {
        let mut runner = into_runner(NanBrain);
        let result = runner.activate(&[0.0; SENSOR_COUNT]);
        assert_eq!(result, Err(ControllerFault::NonFinite));
    }
}
