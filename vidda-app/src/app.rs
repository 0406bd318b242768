//! Command dispatch and logging setup.

use std::error::Error;
use std::path::PathBuf;
use tracing::info;
use vidda_data::{SampleLoader, SequenceDataset, SyntheticConfig, SyntheticSequence};
use vidda_train::eval::EvalMode;
use vidda_train::{AdaptationMethod, Config, datasets, select_device};

/// What the binary was asked to do
pub enum Command {
    Train {
        cfg: PathBuf,
        exp_suffix: String,
        synthetic: bool,
    },
    Eval {
        cfg: PathBuf,
    },
}

/// Logging configuration.
pub struct LoggingConfig {
    pub level: String,
}

pub struct App {
    logging: LoggingConfig,
}

impl App {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            logging: LoggingConfig {
                level: level.into(),
            },
        }
    }

    /// Initialise logging and run `command` to completion.
    pub fn run(self, command: Command) -> Result<(), Box<dyn Error>> {
        self.init_logging();

        match command {
            Command::Train {
                cfg,
                exp_suffix,
                synthetic,
            } => {
                let config = Config::from_file(&cfg)?.with_exp_suffix(&exp_suffix);
                train(&config, synthetic)
            }
            Command::Eval { cfg } => {
                let config = Config::from_file(&cfg)?;
                eval(&config)
            }
        }
    }

    fn init_logging(&self) {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.logging.level)),
            )
            .with_target(false)
            .init();
    }
}

fn synthetic_domain(config: &Config, seed: u64) -> Box<dyn SequenceDataset> {
    Box::new(SyntheticSequence::new(SyntheticConfig {
        width: 64,
        height: 32,
        num_classes: config.num_classes,
        seed,
        ..SyntheticConfig::default()
    }))
}

fn train(config: &Config, synthetic: bool) -> Result<(), Box<dyn Error>> {
    info!("Experiment {}", config.exp_name);
    let method = AdaptationMethod::parse(&config.train.da_method)?;
    let device = select_device(config.gpu_id);

    let (source, target): (Box<dyn SequenceDataset>, Box<dyn SequenceDataset>) = if synthetic {
        (
            synthetic_domain(config, config.train.random_seed),
            synthetic_domain(config, config.train.random_seed + 1),
        )
    } else {
        (
            Box::new(datasets::source_train(config)?),
            Box::new(datasets::target_train(config)?),
        )
    };
    let seed = config.train.random_seed;
    let mut source = SampleLoader::new(source, true, seed)?;
    let mut target = SampleLoader::new(target, true, seed.wrapping_add(1))?;

    let mut strategy = method.build(config, &device)?;
    let summary = strategy.run(&mut source, &mut target)?;
    info!(
        "Finished {} iterations, {} checkpoints written",
        summary.iterations,
        summary.checkpoints.len()
    );
    Ok(())
}

fn eval(config: &Config) -> Result<(), Box<dyn Error>> {
    let mode = EvalMode::parse(&config.test.mode)?;
    let device = select_device(config.gpu_id);
    let dataset = datasets::target_eval(config)?;
    let mut strategy = mode.build(config, &device)?;
    let summary = strategy.run(&dataset)?;
    match summary.best {
        Some(best) => info!("Best mIoU {} at {}", best.miou, best.path.display()),
        None => info!("No checkpoint was evaluated"),
    }
    Ok(())
}
