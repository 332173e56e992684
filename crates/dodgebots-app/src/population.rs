//! Minimal generation-to-generation population management.
//!
//! Truncation selection plus weight mutation, just enough to drive the
//! evaluator in a standalone binary. A full neuroevolution library plugs in
//! at the same `EvalGenome` seam and replaces this module wholesale.

use rand::RngCore;
use tracing::debug;

use dodgebots_brain_neuro::{NeuroConfig, NeuroGenome};
use dodgebots_core::GenomeId;

const MUTATION_RATE: f32 = 0.15;
const MUTATION_SCALE: f64 = 0.4;

pub struct Population {
    candidates: Vec<(GenomeId, NeuroGenome)>,
    config: NeuroConfig,
    next_id: u64,
}

impl Population {
    /// Seed a population of random genomes.
    pub fn new(size: usize, config: NeuroConfig, rng: &mut dyn RngCore) -> Self {
        let mut population = Self {
            candidates: Vec::with_capacity(size),
            config,
            next_id: 0,
        };
        for _ in 0..size {
            let id = population.allocate_id();
            let genome = NeuroGenome::random(population.config.clone(), rng);
            population.candidates.push((id, genome));
        }
        population
    }

    fn allocate_id(&mut self) -> GenomeId {
        let id = GenomeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// The candidate list handed to the evaluator each generation.
    pub fn candidates_mut(&mut self) -> &mut [(GenomeId, NeuroGenome)] {
        &mut self.candidates
    }

    /// Best genome seen in the last evaluated generation.
    pub fn champion(&self) -> Option<&NeuroGenome> {
        self.candidates
            .iter()
            .map(|(_, genome)| genome)
            .max_by(|a, b| a.fitness.total_cmp(&b.fitness))
    }

    /// Replace the bottom half of the population with mutated clones of the
    /// top half. Survivors keep their ids, offspring get fresh ones.
    pub fn next_generation(&mut self, rng: &mut dyn RngCore) {
        if self.candidates.len() < 2 {
            return;
        }
        self.candidates
            .sort_by(|(_, a), (_, b)| b.fitness.total_cmp(&a.fitness));

        let survivors = self.candidates.len().div_ceil(2);
        let size = self.candidates.len();
        self.candidates.truncate(survivors);

        let mut offspring = Vec::with_capacity(size - survivors);
        for parent_index in (0..survivors).cycle() {
            if self.candidates.len() + offspring.len() >= size {
                break;
            }
            let mut child = self.candidates[parent_index].1.clone();
            child.mutate(rng, MUTATION_RATE, MUTATION_SCALE);
            child.fitness = 0.0;
            let id = self.allocate_id();
            debug!(
                parent = self.candidates[parent_index].0.0,
                child = id.0,
                "bred offspring"
            );
            offspring.push((id, child));
        }
        self.candidates.append(&mut offspring);
    }
}
