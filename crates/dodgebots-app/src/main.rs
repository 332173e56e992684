//! Headless evolution driver: evaluates NeuroFlow genomes generation by
//! generation and writes the best genome found to `champion.json`.

use anyhow::{Context, Result};
use rand::{SeedableRng, rngs::SmallRng};
use tracing::{info, warn};

use dodgebots_brain_neuro::NeuroConfig;
use dodgebots_core::{DodgeBotsConfig, GenerationEvaluator};

mod population;

use population::Population;

fn main() -> Result<()> {
    init_tracing();

    let generations = env_usize("DODGEBOTS_GENERATIONS", 25);
    let population_size = env_usize("DODGEBOTS_POPULATION", 24);

    let mut config = DodgeBotsConfig::default();
    if let Some(workers) = env_opt_usize("DODGEBOTS_WORKERS") {
        config.worker_threads = Some(workers);
    }
    if let Some(seed) = env_opt_u64("DODGEBOTS_SEED") {
        config.rng_seed = Some(seed);
    }

    let mut evaluator = GenerationEvaluator::new(config.clone())?;
    let mut rng = SmallRng::seed_from_u64(config.rng_seed.unwrap_or(0x0D0D_6EB0_7535_EEDD));
    let mut population = Population::new(population_size, NeuroConfig::default(), &mut rng);

    info!(
        generations,
        population_size,
        workers = config.resolve_workers(),
        "starting evolution run"
    );

    let mut history = Vec::with_capacity(generations);
    for generation in 0..generations {
        let summary = evaluator.evaluate(population.candidates_mut());
        info!(
            generation,
            evaluated = summary.evaluated,
            best = summary.best_fitness.unwrap_or(0.0),
            mean = summary.mean_fitness,
            "generation complete"
        );
        let aborted = summary.aborted;
        history.push(summary);
        if aborted {
            warn!("display session ended, stopping the run");
            break;
        }
        if generation + 1 < generations {
            population.next_generation(&mut rng);
        }
    }

    let run_best = history
        .iter()
        .filter_map(|summary| summary.best_fitness)
        .fold(0.0f64, f64::max);
    info!(
        generations_run = history.len(),
        run_best, "evolution run finished"
    );

    let champion = population.champion().context("population is empty")?;
    let payload = serde_json::to_string_pretty(champion)?;
    std::fs::write("champion.json", payload)?;
    info!(fitness = champion.fitness, "wrote champion.json");

    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn env_usize(key: &str, default: usize) -> usize {
    match env_opt_usize(key) {
        Some(value) => value,
        None => default,
    }
}

fn env_opt_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!("{key} must be a positive integer; got '{raw}'");
            None
        }
    }
}

fn env_opt_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("{key} must be an unsigned integer; got '{raw}'");
            None
        }
    }
}
