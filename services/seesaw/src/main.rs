//! Seesaw
//!
//! A simple shell-friendly TCP reverse proxy / load balancer.
//!
//! This binary:
//! - Listens on one address and port
//! - Sends each client to the next port of a sequential destination pool
//! - Relays bytes both ways until either side closes
//!
//! Exit codes: 0 on clean shutdown or `--help`, 1 on configuration or flag
//! errors, 2 on runtime errors (bind failure, runtime startup failure).

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use seesaw::config::{Cli, ProxyConfig};
use seesaw::supervisor::{self, Supervisor};

const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_CONFIG),
            };
        }
    };

    let config = match ProxyConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}\n\n{}", Cli::command().render_help());
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_tracing(&cli);

    // Single-threaded event loop; sessions interleave on one thread.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    match runtime.block_on(Supervisor::new(config).run(supervisor::shutdown_signal())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Seesaw stopped");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn init_tracing(cli: &Cli) {
    // Prefer RUST_LOG, fall back to --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(cli.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!cli.log_json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}
