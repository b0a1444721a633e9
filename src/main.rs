//! command-dispatch
//!
//! `serve` runs a worker that executes allow-listed command batches;
//! `dispatch` sends a batch file to a worker and prints the results.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use command_dispatch::{
    backend::HostShell,
    batch,
    command::Executor,
    config::{self, Config},
    credentials::{ClientCredentials, WorkerCredentials},
    dispatcher::Dispatcher,
    worker::{shutdown_on, Worker},
};

#[derive(Parser, Debug)]
#[command(name = "command-dispatch")]
#[command(
    about = "Send allow-listed command batches to a remote worker over an encrypted channel"
)]
struct Args {
    /// JSON config file (overrides COMMAND_DISPATCH_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Verbose mode (same as --log-level debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the worker until interrupted
    Serve {
        /// Port to listen on
        #[arg(short, long, value_parser = config::parse_port)]
        port: Option<u16>,
    },
    /// Send a batch of commands to a worker and print the results
    Dispatch {
        /// Worker host
        #[arg(long)]
        host: Option<String>,

        /// Worker port
        #[arg(short, long, value_parser = config::parse_port)]
        port: Option<u16>,

        /// Batch definition file
        #[arg(short, long, default_value = "samples/commands.json")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout only carries results
    let level = if args.verbose { "debug" } else { args.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Mode::Serve { port } => serve(config, port).await,
        Mode::Dispatch { host, port, file } => dispatch(config, host, port, &file).await,
    }
}

async fn serve(config: Config, port: Option<u16>) -> Result<()> {
    let mut worker_config = config.worker;
    if let Some(port) = port {
        worker_config.port = port;
    }

    let credentials = WorkerCredentials::load(
        &worker_config.secret_keys_dir,
        &worker_config.public_keys_dir,
        &worker_config.identity,
    )
    .context("Failed to load worker credentials")?;

    let backend =
        HostShell::new(worker_config.shell.clone()).with_timeout(worker_config.command_timeout());
    let executor = Executor::new(worker_config.policy(), backend);

    info!(
        shell_commands = ?executor.policy().shell_commands(),
        math_names = executor.policy().math_names().len(),
        allowed_addresses = ?worker_config.allowed_addresses,
        "Loaded configuration"
    );

    let worker = Worker::bind(
        worker_config.bind_addr(),
        credentials,
        worker_config.allowed_addresses.clone(),
        executor,
    )
    .await
    .context("Could not bind to port. Use another port")?
    .with_idle_timeout(worker_config.idle_timeout());

    worker
        .serve_until(shutdown_on(tokio::signal::ctrl_c()))
        .await;

    Ok(())
}

async fn dispatch(
    config: Config,
    host: Option<String>,
    port: Option<u16>,
    file: &Path,
) -> Result<()> {
    let dispatcher_config = config.dispatcher;
    let host = host.unwrap_or_else(|| dispatcher_config.host.clone());
    let port = port.unwrap_or(dispatcher_config.port);

    // Parse the whole batch before touching the network
    let batch = batch::load_batch(file)
        .with_context(|| format!("Failed to load batch {}", file.display()))?;

    let credentials = ClientCredentials::load(
        &dispatcher_config.secret_keys_dir,
        &dispatcher_config.public_keys_dir,
        &dispatcher_config.identity,
        &dispatcher_config.worker_identity,
    )
    .context("Failed to load client credentials")?;

    info!(%host, port, "Connecting to worker");
    let mut dispatcher = Dispatcher::connect(&host, port, &credentials)
        .await?
        .with_response_timeout(dispatcher_config.response_timeout());

    info!(commands = batch.len(), "Sending commands");
    dispatcher.send(&batch).await?;
    info!("Waiting for results");
    let results = dispatcher.receive().await?;

    for result in &results {
        println!("{}", "=".repeat(100));
        println!("{result}");
    }
    println!("{}", "/".repeat(100));

    info!(results = results.len(), "Results received");
    dispatcher.close().await?;
    Ok(())
}
