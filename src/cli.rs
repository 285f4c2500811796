//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use taskvent::logging::LogFormat;
use taskvent::relay::{DEFAULT_LOG_PORT, Severity};

/// Run divide-and-conquer pipelines over ZeroMQ.
#[derive(Parser, Debug)]
#[command(name = "taskvent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long, global = true, env = "TASKVENT_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sum the squares of 1..=N with a ventilator, workers and a sink in
    /// separate processes.
    Squares(SquaresArgs),

    /// Receive relayed log records and exit when one reaches a severity.
    Monitor(MonitorArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the squares command.
#[derive(Parser, Debug)]
pub struct SquaresArgs {
    /// Sum the squares of 1 through this number.
    #[arg(short = 'n', long, default_value_t = 50)]
    pub count: u64,

    /// Number of worker processes.
    #[arg(short, long, env = "TASKVENT_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Port the ventilator binds for workers.
    #[arg(long, env = "TASKVENT_VENTILATOR_PORT", default_value_t = 5557)]
    pub ventilator_port: u16,

    /// Port the sink binds for results.
    #[arg(long, env = "TASKVENT_SINK_PORT", default_value_t = 5558)]
    pub sink_port: u16,

    /// Port that receives relayed log records from the role processes.
    #[arg(long, env = "TASKVENT_LOG_PORT", default_value_t = DEFAULT_LOG_PORT)]
    pub log_port: u16,

    /// Port on which the sink reports the final sum.
    #[arg(long, env = "TASKVENT_RESULT_PORT", default_value_t = 5560)]
    pub result_port: u16,

    /// Use a request/acknowledge handshake on this port instead of the
    /// tolerant synchronization marker.
    #[arg(long, env = "TASKVENT_HANDSHAKE_PORT")]
    pub handshake_port: Option<u16>,

    /// High-water mark for the ventilator's outbound socket.
    #[arg(long, env = "TASKVENT_VENTILATOR_HWM")]
    pub ventilator_hwm: Option<i32>,

    /// High-water mark for each worker's inbound socket.
    #[arg(long, env = "TASKVENT_WORKER_RECEIVER_HWM")]
    pub worker_receiver_hwm: Option<i32>,

    /// High-water mark for each worker's outbound socket.
    #[arg(long, env = "TASKVENT_WORKER_SENDER_HWM")]
    pub worker_sender_hwm: Option<i32>,

    /// High-water mark for the sink's inbound socket.
    #[arg(long, env = "TASKVENT_SINK_HWM")]
    pub sink_hwm: Option<i32>,

    /// Abort the run when a role logs at or above this severity.
    #[arg(long, env = "TASKVENT_FAILURE_LEVEL", default_value_t = Severity::Error)]
    pub failure_level: Severity,

    /// Seconds to wait for the sink's report after it has exited.
    #[arg(long, default_value_t = 5)]
    pub result_timeout: u64,
}

/// Arguments for the monitor command.
#[derive(Parser, Debug)]
pub struct MonitorArgs {
    /// Port to receive log records on.
    #[arg(short, long, env = "TASKVENT_LOG_PORT", default_value_t = DEFAULT_LOG_PORT)]
    pub port: u16,

    /// Exit with an error when a record at or above this severity arrives.
    #[arg(long, env = "TASKVENT_FAILURE_LEVEL", default_value_t = Severity::Critical)]
    pub failure_level: Severity,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "taskvent",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_squares_defaults() {
        let args = Cli::try_parse_from(["taskvent", "squares"]).unwrap();
        match args.command {
            Commands::Squares(squares) => {
                assert_eq!(squares.count, 50);
                assert_eq!(squares.ventilator_port, 5557);
                assert_eq!(squares.sink_port, 5558);
                assert_eq!(squares.log_port, DEFAULT_LOG_PORT);
                assert!(squares.handshake_port.is_none());
                assert!(squares.sink_hwm.is_none());
                assert_eq!(squares.failure_level, Severity::Error);
            }
            _ => panic!("Expected Squares command"),
        }
    }

    #[test]
    fn test_squares_with_options() {
        let args = Cli::try_parse_from([
            "taskvent",
            "squares",
            "-n",
            "10",
            "--workers",
            "4",
            "--handshake-port",
            "6000",
            "--sink-hwm",
            "100",
            "--failure-level",
            "critical",
        ])
        .unwrap();
        match args.command {
            Commands::Squares(squares) => {
                assert_eq!(squares.count, 10);
                assert_eq!(squares.workers, 4);
                assert_eq!(squares.handshake_port, Some(6000));
                assert_eq!(squares.sink_hwm, Some(100));
                assert_eq!(squares.failure_level, Severity::Critical);
            }
            _ => panic!("Expected Squares command"),
        }
    }

    #[test]
    fn test_monitor_command() {
        let args = Cli::try_parse_from(["taskvent", "monitor", "--port", "7000"]).unwrap();
        match args.command {
            Commands::Monitor(monitor) => {
                assert_eq!(monitor.port, 7000);
                assert_eq!(monitor.failure_level, Severity::Critical);
            }
            _ => panic!("Expected Monitor command"),
        }
    }

    #[test]
    fn test_global_options() {
        let args =
            Cli::try_parse_from(["taskvent", "-vv", "--no-color", "squares", "--log-format", "json"])
                .unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.no_color);
        assert_eq!(args.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["taskvent", "-v", "-q", "squares"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_severity_rejected() {
        let result = Cli::try_parse_from(["taskvent", "monitor", "--failure-level", "loud"]);
        assert!(result.is_err());
    }
}
