//! Vidda Application
//!
//! Trains and evaluates flow-guided domain adaptation for video semantic
//! segmentation.
//!
//! Commands:
//! - `train`: adapt a source-trained model to the target domain
//! - `eval`: score one checkpoint or the best of a snapshot series

mod app;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Vidda - Video Domain Adaptation for Semantic Segmentation
#[derive(Parser, Debug)]
#[command(name = "vidda")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train with the configured adaptation method
    Train {
        /// JSON file with configuration overrides
        #[arg(long)]
        cfg: PathBuf,

        /// Appended to the experiment name
        #[arg(long, default_value = "")]
        exp_suffix: String,

        /// Train on generated sequences instead of the configured datasets
        #[arg(long)]
        synthetic: bool,
    },
    /// Evaluate checkpoints on the target validation set
    Eval {
        /// JSON file with configuration overrides
        #[arg(long)]
        cfg: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let command = match args.command {
        Command::Train {
            cfg,
            exp_suffix,
            synthetic,
        } => app::Command::Train {
            cfg,
            exp_suffix,
            synthetic,
        },
        Command::Eval { cfg } => app::Command::Eval { cfg },
    };

    if let Err(e) = app::App::new(args.log_level).run(command) {
        eprintln!("Application error: {}", e);
        std::process::exit(1);
    }
}
