//! taskvent - divide-and-conquer pipelines over ZeroMQ

mod cli;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use std::time::Duration;

use cli::{Cli, Commands, MonitorArgs, SquaresArgs};
use taskvent::logging::{self, LogConfig};
use taskvent::process::{LocalManager, ManagerConfig};
use taskvent::relay::{Liveness, Logger, Severity, monitor_and_relay, monitor_until};
use taskvent::roles::SyncMode;
use taskvent::squares::{SquaresSink, SquaresVentilator, SquaresWorker, expected_sum};
use taskvent::transport::{
    BIND_ANY, DEFAULT_MAX_RETRIES, EndpointSpec, bind_endpoint, uninterruptible,
};

/// Parses arguments, sets up logging, runs the selected command and prints
/// the error chain on failure.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let mut log_config = LogConfig::for_verbosity(cli.verbose, cli.quiet).with_ansi(!cli.no_color);
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    logging::init(log_config.with_env_overrides());

    let result = match &cli.command {
        Commands::Squares(args) => cmd_squares(args, cli.verbose),
        Commands::Monitor(args) => cmd_monitor(args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Run the sum-of-squares pipeline and print the total.
fn cmd_squares(args: &SquaresArgs, verbose: u8) -> Result<()> {
    if args.workers == 0 {
        bail!("at least one worker is required");
    }

    let sync = match args.handshake_port {
        Some(port) => SyncMode::handshake(port),
        None => SyncMode::Tolerant,
    };
    let config = ManagerConfig::new(args.ventilator_port, args.sink_port)
        .with_ventilator_hwm(args.ventilator_hwm)
        .with_worker_hwms(args.worker_receiver_hwm, args.worker_sender_hwm)
        .with_sink_hwm(args.sink_hwm)
        .with_sync(sync)
        .with_log_port(Some(args.log_port));

    // Lifecycle events are only relayed when they would be displayed.
    let roles_logger = Logger::new("taskvent::roles");
    roles_logger.set_level(if verbose >= 2 {
        Severity::Debug
    } else {
        Severity::Info
    });

    let workers = (0..args.workers).map(|_| SquaresWorker).collect();
    let mut manager = LocalManager::new(
        SquaresVentilator::new(args.count),
        SquaresSink::new(args.count).with_result_port(args.result_port),
        workers,
        config,
    )
    .with_logger(roles_logger);

    // Roles are forked before this process creates its own messaging context.
    manager.launch().context("Failed to launch role processes")?;
    tracing::info!(
        workers = args.workers,
        count = args.count,
        "Launched sum-of-squares pipeline"
    );

    let context = zmq::Context::new();
    let results = context.socket(zmq::PULL)?;
    bind_endpoint(
        &results,
        &EndpointSpec::Port(args.result_port),
        BIND_ANY,
        DEFAULT_MAX_RETRIES,
    )
    .context("Failed to bind the result port")?;

    let logger = Logger::new("taskvent::monitor");
    let mut reported: Option<Result<u64>> = None;
    {
        let Some(sink) = manager.sink_process_mut() else {
            bail!("sink process was not launched");
        };
        // Watch only the sink: workers never exit on their own.
        let monitored = monitor_until(
            &logger,
            &context,
            std::slice::from_mut(sink),
            args.log_port,
            args.failure_level,
            || {
                if reported.is_none() {
                    reported = poll_sum(&results);
                }
                false
            },
        );
        if let Err(e) = monitored {
            manager.cleanup();
            return Err(e).context("A role process reported a failure");
        }
    }

    let sum = match reported {
        Some(sum) => sum?,
        None => {
            results.set_rcvtimeo(timeout_millis(args.result_timeout))?;
            let payload = uninterruptible(|| results.recv_bytes(0))
                .context("The sink exited without reporting a sum")?;
            decode_sum(&payload)?
        }
    };

    let reason = manager.wait()?;
    tracing::debug!(%reason, "Sink process finished");

    let expected = expected_sum(args.count);
    if sum != expected {
        bail!("sum of squares was {}, expected {}", sum, expected);
    }
    println!("{}", sum);
    Ok(())
}

/// Non-blocking check for the sink's report. `None` means nothing arrived.
fn poll_sum(results: &zmq::Socket) -> Option<Result<u64>> {
    match uninterruptible(|| results.recv_bytes(zmq::DONTWAIT)) {
        Ok(payload) => Some(decode_sum(&payload)),
        Err(zmq::Error::EAGAIN) => None,
        Err(e) => Some(Err(e).context("Failed to receive the sum from the sink")),
    }
}

fn decode_sum(payload: &[u8]) -> Result<u64> {
    serde_json::from_slice(payload).context("Malformed sum from the sink")
}

/// Relay log records arriving on a port until one crosses the threshold.
fn cmd_monitor(args: &MonitorArgs) -> Result<()> {
    let context = zmq::Context::new();
    let logger = Logger::new("taskvent::monitor");
    tracing::info!(port = args.port, threshold = %args.failure_level, "Monitoring relayed logs");

    let mut processes: Vec<Unwatched> = Vec::new();
    monitor_and_relay(
        &logger,
        &context,
        &mut processes,
        args.port,
        args.failure_level,
    )?;
    Ok(())
}

/// Placeholder process type for a monitor that watches nothing.
struct Unwatched;

impl Liveness for Unwatched {
    fn is_alive(&mut self) -> bool {
        false
    }
}

fn timeout_millis(seconds: u64) -> i32 {
    Duration::from_secs(seconds)
        .as_millis()
        .try_into()
        .unwrap_or(i32::MAX)
}
