mod agents;
mod cli;
mod config;
mod error;
mod index;
mod manifest;
mod pypi;
mod utils;
mod workflow;

use clap::Parser;
use cli::Cli;
use colored::Colorize;
use error::PkgupError;
use std::process;
use std::thread;
use tracing_subscriber::EnvFilter;
use utils::CancellationToken;
use workflow::RunOutcome;

const EXIT_SETUP_ERROR: i32 = 1;
const EXIT_FAILURE: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

fn init_logging(verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Flip `cancel` on the first Ctrl-C; a second one exits immediately.
fn spawn_interrupt_listener(cancel: CancellationToken) {
    let spawned = thread::Builder::new()
        .name("pkgup-interrupt".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::warn!(error = %e, "interrupt handling unavailable");
                    return;
                }
            };

            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                eprintln!(
                    "\n{}",
                    "Interrupted: stopping trials and cleaning up sandboxes (Ctrl-C again to force quit)"
                        .yellow()
                );
                cancel.cancel();

                if tokio::signal::ctrl_c().await.is_ok() {
                    process::exit(EXIT_INTERRUPTED);
                }
            });
        });

    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to start interrupt listener");
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cancel = CancellationToken::new();
    spawn_interrupt_listener(cancel.clone());

    match workflow::execute_update(&cli, cancel) {
        Ok(RunOutcome::Completed) => {}
        Ok(RunOutcome::Cancelled) | Err(PkgupError::Cancelled) => {
            eprintln!("{}", "Run cancelled.".yellow().bold());
            process::exit(EXIT_INTERRUPTED);
        }
        Err(e) if e.is_fatal_setup() => {
            eprintln!("{} {}", "Setup error:".red().bold(), e);
            process::exit(EXIT_SETUP_ERROR);
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            process::exit(EXIT_FAILURE);
        }
    }
}
