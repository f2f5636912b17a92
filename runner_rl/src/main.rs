//! Main entry point for the runner RL CLI.

use anyhow::Result;
use clap::Parser;
use runner_rl::{
    cli,
    orchestrator::{Command, Event, Orchestrator},
    settings::Settings,
    store::ModelStore,
    telemetry,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let mut settings = Settings::load(args.config.as_deref())?;
    if args.seed.is_some() {
        settings.seed = args.seed;
    }

    // Initialize telemetry
    telemetry::init(&settings.logging)?;

    let store = ModelStore::open(&settings.persistence.path)?;
    let mut handle = Orchestrator::spawn(settings, store);

    let stop = handle.commands();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current step");
            let _ = stop.send(Command::Stop).await;
        }
    });

    handle.send(args.command.into_command()).await?;

    let mut failure = None;
    while let Some(event) = handle.next_event().await {
        if args.events_json {
            println!("{}", serde_json::to_string(&event)?);
        }
        match event {
            Event::Progress {
                episode,
                steps,
                episode_return,
                epsilon,
                best_score,
                ..
            } => info!(episode, steps, episode_return, epsilon, best_score, "progress"),
            Event::EvalResult { episode, steps } => info!(episode, steps, "evaluation episode"),
            Event::Autosaved { best_score } => info!(best_score, "model autosaved"),
            Event::SaveFailed { message } => warn!(%message, "autosave failed"),
            Event::Failed { message } => failure = Some(message),
            Event::Frame { .. } => {}
            Event::Done => break,
        }
    }

    interrupt.abort();
    handle.shutdown().await?;

    match failure {
        Some(message) => Err(anyhow::anyhow!(message)),
        None => Ok(()),
    }
}
