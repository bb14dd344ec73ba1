//! Bluetooth LE transport using the `bluest` crate.
//!
//! `bluest` is async and delivers notifications on a stream, while the poller
//! works with plain blocking calls. Every [`BleLink`] therefore owns a small
//! worker thread running a current-thread Tokio runtime. The worker forwards
//! notification fragments into a bounded channel and performs writes on behalf
//! of the poller, so the poller's own thread stays the only one touching its
//! frame buffer.
//!
//! # Example
//!
//! ```no_run
//! use jbdbms_lib::ble::BleConnector;
//! use jbdbms_lib::poller::{poll_device, PollerConfig};
//! use jbdbms_lib::protocol::Event;
//!
//! let mut sink = |device_id: &str, event: Event| println!("{device_id}: {event:?}");
//! poll_device(
//!     BleConnector::default(),
//!     "A4:C1:37:00:11:22",
//!     PollerConfig::default(),
//!     &mut sink,
//!     || false,
//! );
//! ```

use crate::protocol::{NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID};
use crate::transport::{Connector, Link};
use crate::Error;
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc as async_mpsc;

const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Errors raised while establishing a BLE link.
#[derive(Debug, thiserror::Error)]
enum BleError {
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluest::Error),
    #[error("Default adapter not found")]
    NoAdapter,
    #[error("Device not found")]
    NotFound,
    #[error("The device does not support the BMS service {0:#06x}")]
    MissingService(u16),
    #[error("The device does not support the BMS characteristic {0:#06x}")]
    MissingCharacteristic(u16),
    #[error("Cannot start BLE worker: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Expand a 16 bit assigned number into a full Bluetooth base UUID.
fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | (u128::from(short) << 96))
}

/// Whether an advertised device is the one asked for.
///
/// Accepts the address in any letter case, the BlueZ path form
/// (`dev_AA_BB_...`) or the advertised local name.
fn is_target(id_repr: &str, local_name: Option<&str>, wanted: &str) -> bool {
    let wanted = wanted.to_ascii_uppercase();
    let id_repr = id_repr.to_ascii_uppercase();
    id_repr.contains(&wanted)
        || id_repr.contains(&wanted.replace(':', "_"))
        || local_name.is_some_and(|name| name.eq_ignore_ascii_case(&wanted))
}

enum LinkCommand {
    Write(Vec<u8>, mpsc::SyncSender<Result<(), String>>),
    Close,
}

struct BleSession {
    adapter: Adapter,
    device: Device,
    write: Characteristic,
    notify: Characteristic,
}

/// Opens [`BleLink`]s by BLE address (or advertised name).
#[derive(Debug, Clone)]
pub struct BleConnector {
    scan_timeout: Duration,
    queue_depth: usize,
}

impl Default for BleConnector {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl BleConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long to scan for the device before giving up.
    pub fn with_scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    /// Number of fragments buffered between the BLE worker and the poller.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.max(1);
        self
    }
}

impl Connector for BleConnector {
    type Link = BleLink;

    fn open(&self, device_id: &str) -> Result<BleLink, Error> {
        let connect_error = |reason: String| Error::Connect {
            device_id: device_id.to_string(),
            reason,
        };

        let (notification_tx, notification_rx) = mpsc::sync_channel(self.queue_depth);
        let (command_tx, command_rx) = async_mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let worker_device_id = device_id.to_string();
        let scan_timeout = self.scan_timeout;
        let worker = std::thread::Builder::new()
            .name(format!("ble-{device_id}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(BleError::from(err)));
                        return;
                    }
                };
                runtime.block_on(run_link(
                    worker_device_id,
                    scan_timeout,
                    command_rx,
                    notification_tx,
                    ready_tx,
                ));
            })
            .map_err(|err| connect_error(err.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(BleLink {
                device_id: device_id.to_string(),
                commands: command_tx,
                notifications: notification_rx,
                worker: Some(worker),
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(connect_error(err.to_string()))
            }
            Err(_) => {
                let _ = worker.join();
                Err(connect_error("BLE worker stopped unexpectedly".to_string()))
            }
        }
    }
}

/// An open BLE link to one BMS.
#[derive(Debug)]
pub struct BleLink {
    device_id: String,
    commands: async_mpsc::UnboundedSender<LinkCommand>,
    notifications: mpsc::Receiver<Vec<u8>>,
    worker: Option<JoinHandle<()>>,
}

impl Link for BleLink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.commands
            .send(LinkCommand::Write(bytes.to_vec(), reply_tx))
            .map_err(|_| Error::Transport(format!("link to '{}' is closed", self.device_id)))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Transport(format!("link to '{}' is closed", self.device_id)))?
            .map_err(Error::Transport)
    }

    fn poll_notification(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        self.notifications.recv_timeout(timeout).ok()
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(LinkCommand::Close);
            if worker.join().is_err() {
                log::error!("BLE worker for '{}' panicked", self.device_id);
            }
        }
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LinkCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkCommand::Write(bytes, _) => write!(f, "Write({})", hex::encode(bytes)),
            LinkCommand::Close => write!(f, "Close"),
        }
    }
}

async fn connect(device_id: &str, scan_timeout: Duration) -> Result<BleSession, BleError> {
    let adapter = Adapter::default().await.ok_or(BleError::NoAdapter)?;
    adapter.wait_available().await?;

    let device = {
        let mut scan = adapter.scan(&[]).await?;
        tokio::time::timeout(scan_timeout, async {
            while let Some(candidate) = scan.next().await {
                let id_repr = format!("{:?}", candidate.device.id());
                let local_name = candidate.adv_data.local_name.as_deref();
                log::trace!("Discovered {id_repr} ({local_name:?})");
                if is_target(&id_repr, local_name, device_id) {
                    return Some(candidate.device);
                }
            }
            None
        })
        .await
        .map_err(|_| BleError::NotFound)?
        .ok_or(BleError::NotFound)?
    };

    adapter.connect_device(&device).await?;

    let service = device
        .discover_services_with_uuid(bluetooth_uuid(SERVICE_UUID))
        .await?
        .first()
        .ok_or(BleError::MissingService(SERVICE_UUID))?
        .clone();
    let write = service
        .discover_characteristics_with_uuid(bluetooth_uuid(WRITE_CHARACTERISTIC_UUID))
        .await?
        .first()
        .ok_or(BleError::MissingCharacteristic(WRITE_CHARACTERISTIC_UUID))?
        .clone();
    let notify = service
        .discover_characteristics_with_uuid(bluetooth_uuid(NOTIFY_CHARACTERISTIC_UUID))
        .await?
        .first()
        .ok_or(BleError::MissingCharacteristic(NOTIFY_CHARACTERISTIC_UUID))?
        .clone();

    Ok(BleSession {
        adapter,
        device,
        write,
        notify,
    })
}

async fn run_link(
    device_id: String,
    scan_timeout: Duration,
    mut commands: async_mpsc::UnboundedReceiver<LinkCommand>,
    notifications: mpsc::SyncSender<Vec<u8>>,
    ready: mpsc::SyncSender<Result<(), BleError>>,
) {
    let session = match connect(&device_id, scan_timeout).await {
        Ok(session) => session,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    let stream = match session.notify.notify().await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = session.adapter.disconnect_device(&session.device).await;
            let _ = ready.send(Err(err.into()));
            return;
        }
    };
    futures_util::pin_mut!(stream);
    let _ = ready.send(Ok(()));

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Write(bytes, reply)) => {
                    log::trace!("TX to '{device_id}': {}", hex::encode(&bytes));
                    let result = session.write.write(&bytes).await.map_err(|err| err.to_string());
                    let failed = result.is_err();
                    let _ = reply.send(result);
                    if failed {
                        break;
                    }
                }
                Some(LinkCommand::Close) | None => break,
            },
            fragment = stream.next() => match fragment {
                Some(Ok(data)) => match notifications.try_send(data) {
                    Ok(()) => {}
                    Err(mpsc::TrySendError::Full(data)) => {
                        log::warn!(
                            "Notification queue of '{device_id}' is full, dropping {}",
                            hex::encode(data)
                        );
                    }
                    Err(mpsc::TrySendError::Disconnected(_)) => break,
                },
                Some(Err(err)) => {
                    log::warn!("Notification error from '{device_id}': {err}");
                    break;
                }
                None => {
                    log::info!("Notification stream of '{device_id}' ended");
                    break;
                }
            },
        }
    }

    if let Err(err) = session.adapter.disconnect_device(&session.device).await {
        log::warn!("Failed to disconnect from '{device_id}': {err}");
    }
}
