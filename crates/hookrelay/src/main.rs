//! hookrelay CLI: webhook ingress, consumer and reconciler.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use hookrelay::{CliArgs, Command, Relay, init_tracing, spawn_shutdown_handler};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    if args.config.is_empty() {
        eprintln!("Error: no config files specified (use -c/--config)");
        return ExitCode::FAILURE;
    }

    info!("Loading config from {} file(s)", args.config.len());

    let shutdown = CancellationToken::new();
    let relay = match Relay::load(&args.config, shutdown.clone()) {
        Ok(relay) => relay,
        Err(e) => {
            eprintln!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = relay.init_metrics() {
        eprintln!("Failed to start metrics: {e}");
        return ExitCode::FAILURE;
    }
    let signals = spawn_shutdown_handler(shutdown.clone());

    let result = match args.command {
        Command::Serve { with_consumer } => {
            info!(
                address = %relay.config().ingress.address,
                with_consumer,
                "Starting hookrelay ingress"
            );
            relay.serve(with_consumer).await
        }
        Command::Consume => {
            info!(topic = %relay.config().broker.topic, "Starting hookrelay consumer");
            relay.consume().await
        }
        Command::Reconcile => relay.reconcile().await.map(|report| {
            println!(
                "processed {} file(s), failed {} file(s), reprocessed {} of {} dead letter(s)",
                report.files_processed.len(),
                report.files_failed.len(),
                report.dead_letters_reprocessed,
                report.dead_letters_seen
            );
        }),
    };

    shutdown.cancel();
    let _ = signals.await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hookrelay failed: {e}");
            ExitCode::FAILURE
        }
    }
}
