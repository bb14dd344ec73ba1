use anyhow::{bail, Context, Result};
use jbdbms_lib::poller::{poll_device, PollerConfig, SessionEnd};
use jbdbms_lib::protocol::Event;
use jbdbms_lib::transport::Connector;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{commandline::LogFormat, metrics};

/// Wait for Ctrl+C, or SIGTERM on Unix.
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}. Only Ctrl+C will stop polling");
                None
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Set `cancelled` once a shutdown signal arrives.
pub fn install_shutdown_handler(runtime: &tokio::runtime::Runtime, cancelled: Arc<AtomicBool>) {
    runtime.spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown requested, finishing current poll cycle");
        cancelled.store(true, Ordering::Relaxed);
    });
}

fn log_event(format: LogFormat, device_id: &str, event: &Event) {
    match format {
        LogFormat::Debug => info!("{device_id}: {event:?}"),
        LogFormat::Json => match serde_json::to_string(event) {
            Ok(json) => info!("{device_id}: {json}"),
            Err(e) => error!("Failed to serialize event from '{device_id}': {e}"),
        },
    }
}

/// Poll a single battery on the current thread and log every event.
pub fn run_log<C: Connector>(
    connector: C,
    mac: &str,
    poller_config: PollerConfig,
    format: LogFormat,
    cancelled: &AtomicBool,
) -> Result<()> {
    let mut sink = |device_id: &str, event: Event| log_event(format, device_id, &event);
    match poll_device(connector, mac, poller_config, &mut sink, || {
        cancelled.load(Ordering::Relaxed)
    }) {
        SessionEnd::Cancelled => Ok(()),
        SessionEnd::ConnectFailed => bail!("Cannot connect to battery '{mac}'"),
        SessionEnd::LinkLost => bail!("Lost connection to battery '{mac}'"),
    }
}

/// Poll every battery on its own worker thread and export the telemetry on `/metrics`.
pub fn run_publish<C: Connector + Sync>(
    runtime: &tokio::runtime::Runtime,
    connector: C,
    macs: &[String],
    addr: SocketAddr,
    poller_config: PollerConfig,
    cancelled: &AtomicBool,
) -> Result<()> {
    if macs.is_empty() {
        bail!("No battery to poll, pass at least one '-m <MAC>' or list devices in the config file");
    }
    info!("Starting daemon mode: devices={macs:?}, poller={poller_config:?}");

    let server = {
        let _guard = runtime.enter();
        metrics::bind(&addr).with_context(|| format!("Cannot bind metrics server to {addr}"))?
    };
    runtime.spawn(metrics::serve(server));
    info!("Starting server at http://{addr}/metrics");

    let connector = &connector;
    let poller_config = &poller_config;
    std::thread::scope(|scope| -> Result<()> {
        let mut workers = Vec::with_capacity(macs.len());
        for mac in macs {
            let worker = std::thread::Builder::new()
                .name(format!("poller-{mac}"))
                .spawn_scoped(scope, move || {
                    let mut sink = metrics::MetricsSink::new();
                    let end = poll_device(connector, mac, poller_config.clone(), &mut sink, || {
                        cancelled.load(Ordering::Relaxed)
                    });
                    info!("Polling of '{mac}' ended: {end:?}");
                    end
                })
                .with_context(|| format!("Cannot spawn poller for '{mac}'"))?;
            workers.push((mac, worker));
        }

        for (mac, worker) in workers {
            match worker.join() {
                Ok(SessionEnd::Cancelled) => {}
                Ok(end) => warn!("Battery '{mac}' stopped reporting ({end:?})"),
                Err(_) => error!("Poller thread for '{mac}' panicked"),
            }
        }
        Ok(())
    })
}
