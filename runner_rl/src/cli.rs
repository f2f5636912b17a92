//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::orchestrator::{Command, EvalRequest, StartRequest};

/// Runner RL CLI
#[derive(Parser)]
#[command(name = "runner-cli")]
#[command(about = "Train and evaluate a double-DQN agent on the runner game")]
#[command(version)]
pub struct Cli {
    /// Settings file layered over the built-in defaults
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Seed for obstacle spawning and exploration
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Print every event to stdout as a JSON line
    #[arg(long, global = true)]
    pub events_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a fresh agent
    Train {
        #[arg(long)]
        episodes: Option<usize>,
        #[arg(long)]
        max_steps: Option<usize>,
        #[arg(long)]
        frame_skip: Option<u32>,
        #[arg(long)]
        epsilon_start: Option<f32>,
        #[arg(long)]
        epsilon_end: Option<f32>,
        #[arg(long)]
        epsilon_decay_episodes: Option<usize>,
        /// Save once the best cleared count reaches this value
        #[arg(long)]
        autosave_threshold: Option<u64>,
    },
    /// Run greedy episodes with the saved model, or the random baseline
    Evaluate {
        #[arg(long)]
        episodes: Option<usize>,
        #[arg(long)]
        max_steps: Option<usize>,
        #[arg(long)]
        random: bool,
    },
}

impl Commands {
    pub fn into_command(self) -> Command {
        match self {
            Commands::Train {
                episodes,
                max_steps,
                frame_skip,
                epsilon_start,
                epsilon_end,
                epsilon_decay_episodes,
                autosave_threshold,
            } => Command::Start(StartRequest {
                episodes,
                max_steps,
                frame_skip,
                epsilon_start,
                epsilon_end,
                epsilon_decay_episodes,
                autosave_threshold,
            }),
            Commands::Evaluate {
                episodes,
                max_steps,
                random,
            } => Command::Evaluate(EvalRequest {
                episodes,
                max_steps,
                random,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn train_flags_map_to_start() {
        let cli = Cli::try_parse_from([
            "runner-cli",
            "train",
            "--episodes",
            "5",
            "--autosave-threshold",
            "3",
            "--seed",
            "9",
        ])
        .unwrap();
        assert_eq!(cli.seed, Some(9));
        assert_eq!(
            cli.command.into_command(),
            Command::Start(StartRequest {
                episodes: Some(5),
                autosave_threshold: Some(3),
                ..StartRequest::default()
            })
        );
    }

    #[test]
    fn evaluate_random_baseline() {
        let cli = Cli::try_parse_from(["runner-cli", "evaluate", "--random", "--max-steps", "10"])
            .unwrap();
        assert_eq!(
            cli.command.into_command(),
            Command::Evaluate(EvalRequest {
                episodes: None,
                max_steps: Some(10),
                random: true,
            })
        );
    }
}
