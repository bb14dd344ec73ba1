use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use jbdbms_lib::ble::BleConnector;
use jbdbms_lib::config::Config;
use log::*;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod metrics;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config file {path:?}"))?,
        None => Config::default(),
    };
    if let Some(notification_timeout) = args.notification_timeout {
        config.notification_timeout = notification_timeout;
    }
    if let Some(settle) = args.settle {
        config.settle_interval = settle;
    }
    if let CliCommands::Publish { macs, host, port } = &args.command {
        if !macs.is_empty() {
            config.devices = macs.clone();
        }
        if let Some(host) = host {
            config.host = host.clone();
        }
        if let Some(port) = port {
            config.port = *port;
        }
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = load_config(&args)?;
    debug!("Effective configuration: {config:?}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .with_context(|| "Cannot start async runtime")?;

    let cancelled = Arc::new(AtomicBool::new(false));
    daemon::install_shutdown_handler(&runtime, cancelled.clone());

    let connector = BleConnector::new().with_scan_timeout(args.scan_timeout);

    match &args.command {
        CliCommands::Log { mac, format } => daemon::run_log(
            connector,
            mac,
            config.poller_config(),
            *format,
            &cancelled,
        ),
        CliCommands::Publish { .. } => {
            let addr: SocketAddr = format!("{}:{}", config.host, config.port)
                .parse()
                .with_context(|| {
                    format!("Invalid metrics bind address {}:{}", config.host, config.port)
                })?;
            daemon::run_publish(
                &runtime,
                connector,
                &config.devices,
                addr,
                config.poller_config(),
                &cancelled,
            )
        }
    }
}
