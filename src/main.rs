//! echo-supervisor binary.
//!
//! - `serve` (default): run the supervisor
//! - `worker`: serve one inherited connection (spawned by the supervisor)
//! - `client`: exercise a running server

use clap::Parser;
use echo_supervisor::config::{ClientArgs, CliArgs, Command, Config, ServeArgs, WorkerArgs};
use echo_supervisor::worker::process;
use echo_supervisor::{client, logging, supervisor};
use std::time::Duration;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    match cli.into_command() {
        Command::Serve(args) => run_serve(args),
        Command::Worker(args) => run_worker(args),
        Command::Client(args) => run_client(args),
    }
}

fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(args)?;
    logging::init(&config.log_level, config.log_file.as_deref(), "supervisor")?;

    info!(
        listen = %config.listen,
        max_workers = config.max_workers,
        worker_mode = ?config.worker_mode,
        grace_ms = config.grace_period.as_millis() as u64,
        "Starting echo-supervisor"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(supervisor::serve(config))?;

    if report.shutdown.unconfirmed > 0 {
        return Err(format!(
            "{} workers could not be confirmed reclaimed",
            report.shutdown.unconfirmed
        )
        .into());
    }
    Ok(())
}

fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tag = format!("worker-{}", args.session_id);
    if logging::init(&args.log_level, args.log_file.as_deref(), &tag).is_err() {
        std::process::exit(echo_supervisor::worker::EXIT_FAILED_TO_START);
    }
    std::process::exit(process::run_child(&args));
}

fn run_client(args: ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&args.log_level, None, "client")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(client::run(
        &args.connect,
        args.count,
        &args.prefix,
        Duration::from_millis(args.timeout_ms),
    ))?;

    println!(
        "echoed {} messages in {:?} (server closed: {})",
        report.echoed, report.elapsed, report.server_closed
    );
    Ok(())
}
