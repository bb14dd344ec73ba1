use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::{path::PathBuf, time::Duration};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    Debug,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Collect and log battery events. Always begins with the hardware info, followed by
    /// basic info and cell voltage events in a loop until interrupted.
    Log {
        /// BLE address of the battery to connect to (e.g., A4:C1:37:00:11:22)
        #[arg(short, long)]
        mac: String,
        /// Output format of the logged events
        #[arg(long, value_enum, default_value_t = LogFormat::Debug)]
        format: LogFormat,
    },
    /// Poll one or more batteries and publish their telemetry as Prometheus metrics
    Publish {
        /// BLE addresses of the batteries to connect to. Note that your adapter may limit how
        /// many devices can be connected at once; usually that is 3.
        #[arg(short = 'm', long = "mac")]
        macs: Vec<String>,
        /// Host address to bind the metrics server to [default: 0.0.0.0]
        #[arg(short = 'H', long)]
        host: Option<String>,
        /// Port to publish /metrics on [default: 8080]
        #[arg(short, long)]
        port: Option<u16>,
    },
}

const fn about_text() -> &'static str {
    "jbd bms bluetooth polling tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// YAML configuration file; command line values take precedence
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Silence after which a response is considered complete (e.g., "100ms") [default: 100ms]
    #[arg(value_parser = humantime::parse_duration, long)]
    pub notification_timeout: Option<Duration>,

    /// Pause after every command/response exchange (e.g., "1s", "2s 500ms") [default: 1s]
    #[arg(value_parser = humantime::parse_duration, long)]
    pub settle: Option<Duration>,

    /// How long to scan for a battery before giving up
    #[arg(value_parser = humantime::parse_duration, long, default_value = "30s")]
    pub scan_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_publish_with_several_devices() {
        let args = CliArgs::parse_from([
            "jbdbms",
            "--settle",
            "2s",
            "publish",
            "-m",
            "A4:C1:37:00:11:22",
            "-m",
            "A4:C1:37:00:33:44",
            "-H",
            "127.0.0.1",
        ]);
        assert_eq!(args.settle, Some(Duration::from_secs(2)));
        assert_eq!(args.notification_timeout, None);
        assert_eq!(
            args.command,
            CliCommands::Publish {
                macs: vec!["A4:C1:37:00:11:22".into(), "A4:C1:37:00:33:44".into()],
                host: Some("127.0.0.1".into()),
                port: None,
            }
        );
    }

    #[test]
    fn parse_log() {
        let args = CliArgs::parse_from(["jbdbms", "log", "-m", "A4:C1:37:00:11:22", "--format", "json"]);
        assert_eq!(
            args.command,
            CliCommands::Log {
                mac: "A4:C1:37:00:11:22".into(),
                format: LogFormat::Json,
            }
        );
    }
}
