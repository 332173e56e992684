use dodgebots_core::{
    ControllerFault, ControllerRunner, Display, DodgeBotsConfig, EvalGenome, GenerationEvaluator,
    GenomeId, MOTOR_COUNT, SENSOR_COUNT, WorldSnapshot,
};

fn seeded_config() -> DodgeBotsConfig {
    DodgeBotsConfig {
        rng_seed: Some(0xBADD_0D6E),
        spawn_jitter_y: 0.0,
        ..DodgeBotsConfig::default()
    }
}

struct StillRunner;

impl ControllerRunner for StillRunner {
    fn kind(&self) -> &'static str {
        "test.still"
    }

    fn activate(
        &mut self,
        _sensors: &[f32; SENSOR_COUNT],
    ) -> Result<[f32; MOTOR_COUNT], ControllerFault> {
        Ok([0.0; MOTOR_COUNT])
    }
}

struct StillGenome {
    fitness: f64,
}

impl EvalGenome for StillGenome {
    fn build_runner(&self) -> Result<Box<dyn ControllerRunner>, ControllerFault> {
        Ok(Box::new(StillRunner))
    }

    fn set_fitness(&mut self, fitness: f64) {
        self.fitness = fitness;
    }
}

struct FaultAfter {
    remaining: u64,
}

impl ControllerRunner for FaultAfter {
    fn kind(&self) -> &'static str {
        "test.fault_after"
    }

    fn activate(
        &mut self,
        _sensors: &[f32; SENSOR_COUNT],
    ) -> Result<[f32; MOTOR_COUNT], ControllerFault> {
        if self.remaining == 0 {
            return Err(ControllerFault::Activation("synthetic failure".into()));
        }
        self.remaining -= 1;
        Ok([0.0; MOTOR_COUNT])
    }
}

struct FaultGenome {
    ticks_before_fault: u64,
    fitness: f64,
}

impl EvalGenome for FaultGenome {
    fn build_runner(&self) -> Result<Box<dyn ControllerRunner>, ControllerFault> {
        Ok(Box::new(FaultAfter {
            remaining: self.ticks_before_fault,
        }))
    }

    fn set_fitness(&mut self, fitness: f64) {
        self.fitness = fitness;
    }
}

/// Display that keeps drawing until its countdown runs out, then asks to stop.
struct CountdownDisplay {
    remaining: usize,
}

impl Display for CountdownDisplay {
    fn is_open(&self) -> bool {
        true
    }

    fn draw(&mut self, _frame: &WorldSnapshot) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Display that never objects.
struct OpenDisplay {
    frames: usize,
}

impl Display for OpenDisplay {
    fn is_open(&self) -> bool {
        true
    }

    fn draw(&mut self, frame: &WorldSnapshot) -> bool {
        assert_eq!(frame.parts.len() % 8, 0, "agents draw as whole bodies");
        self.frames += 1;
        true
    }
}

#[test]
fn identical_stationary_genomes_score_identically() {
    let config = DodgeBotsConfig {
        isolated_tick_limit: 1_500,
        ..seeded_config()
    };
    let mut evaluator = GenerationEvaluator::new(config).expect("evaluator");

    let mut genomes: Vec<(GenomeId, StillGenome)> = (0..5)
        .map(|index| (GenomeId(index), StillGenome { fitness: -1.0 }))
        .collect();
    let summary = evaluator.evaluate(&mut genomes);

    assert!(!summary.aborted);
    assert_eq!(summary.evaluated, 5);

    let first = genomes[0].1.fitness;
    assert!(first > 0.0, "stationary dummies should survive some ticks");
    for (id, genome) in &genomes {
        assert_eq!(
            genome.fitness, first,
            "{id} diverged despite an identical body and controller"
        );
    }
}

#[test]
fn laser_strike_freezes_final_position() {
    // Park the laser close and make it fast so it reaches the dummy long
    // before physics can knock it over.
    let config = DodgeBotsConfig {
        laser_start_x: 150.0,
        laser_speed: 600.0,
        isolated_tick_limit: 600,
        ..seeded_config()
    };
    let mut evaluator = GenerationEvaluator::new(config).expect("evaluator");
    let mut genomes = vec![(GenomeId(0), StillGenome { fitness: -1.0 })];
    let summary = evaluator.evaluate(&mut genomes);

    let outcome = &summary.outcomes[0];
    assert!(outcome.fitness > 0.0);
    assert!(outcome.fitness < 60.0, "strike should land within a second");
    let final_x = outcome.final_x.expect("strike captures the trunk position");
    assert!(
        (final_x - 250.0).abs() < 30.0,
        "a stationary dummy should be struck near its spawn x, got {final_x}"
    );
}

#[test]
fn shared_world_scores_match_survived_ticks() {
    let mut evaluator = GenerationEvaluator::new(seeded_config()).expect("evaluator");
    evaluator.attach_display(Box::new(OpenDisplay { frames: 0 }));

    let mut genomes = vec![
        (
            GenomeId(0),
            FaultGenome {
                ticks_before_fault: 5,
                fitness: 0.0,
            },
        ),
        (
            GenomeId(1),
            FaultGenome {
                ticks_before_fault: 23,
                fitness: 0.0,
            },
        ),
        (
            GenomeId(2),
            FaultGenome {
                ticks_before_fault: 0,
                fitness: 0.0,
            },
        ),
    ];
    let summary = evaluator.evaluate(&mut genomes);

    assert!(!summary.aborted);
    assert_eq!(genomes[0].1.fitness, 5.0);
    assert_eq!(genomes[1].1.fitness, 23.0);
    assert_eq!(genomes[2].1.fitness, 0.0);
    assert_eq!(summary.best_fitness, Some(23.0));
    assert_eq!(evaluator.world().alive_count(), 0);
}

#[test]
fn closing_the_display_leaves_unreached_genomes_at_zero() {
    let mut evaluator = GenerationEvaluator::new(seeded_config()).expect("evaluator");
    evaluator.attach_display(Box::new(CountdownDisplay { remaining: 3 }));

    let mut genomes: Vec<(GenomeId, StillGenome)> = (0..4)
        .map(|index| (GenomeId(index), StillGenome { fitness: -1.0 }))
        .collect();
    let summary = evaluator.evaluate(&mut genomes);

    assert!(summary.aborted);
    assert_eq!(summary.evaluated, 0, "no agent reached a terminal state");
    for (_, genome) in &genomes {
        assert_eq!(genome.fitness, 0.0);
    }
}
