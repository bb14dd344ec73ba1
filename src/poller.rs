//! Per-device polling state machine.
//!
//! A [`DevicePoller`] opens one link, asks for the device identity once and then
//! alternates basic info and cell voltage requests until cancelled:
//!
//! ```text
//! Connecting -> Identifying -> Cycling -> Disconnecting -> Terminated
//!     |
//!     +-> Failed
//! ```
//!
//! A response is considered complete once the link stays silent for
//! [`PollerConfig::notification_timeout`]. Everything received up to then is
//! decoded as one frame. Decode failures are logged and dropped, they never end
//! the session.

use crate::accumulator::FrameAccumulator;
use crate::protocol::{self, Command, Event};
use crate::transport::{Connector, Link};
use crate::{DecodeOutcome, Error};
use log::{debug, error, info, warn};
use std::time::Duration;

/// Silence after which a response is considered complete.
pub const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_millis(100);
/// Pause after every command/response exchange.
pub const DEFAULT_SETTLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    pub notification_timeout: Duration,
    pub settle_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            notification_timeout: DEFAULT_NOTIFICATION_TIMEOUT,
            settle_interval: DEFAULT_SETTLE_INTERVAL,
        }
    }
}

/// Receives decoded events, always on the poller's own thread.
///
/// Per device the first event is a [`Event::HardwareInfo`]; telemetry never
/// precedes it. Sinks shared between pollers must handle concurrent calls themselves.
pub trait EventSink {
    fn on_event(&mut self, device_id: &str, event: Event);
}

impl<F: FnMut(&str, Event)> EventSink for F {
    fn on_event(&mut self, device_id: &str, event: Event) {
        self(device_id, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Connecting,
    Identifying,
    Cycling,
    Disconnecting,
    Terminated,
    Failed,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The cancellation flag tripped and the link was closed.
    Cancelled,
    /// The link could not be opened; no event was emitted.
    ConnectFailed,
    /// A command could not be written; the link was closed.
    LinkLost,
}

#[derive(Debug)]
pub struct DevicePoller<C: Connector> {
    connector: C,
    device_id: String,
    config: PollerConfig,
    state: PollState,
    accumulator: FrameAccumulator,
    identified: bool,
}

impl<C: Connector> DevicePoller<C> {
    pub fn new(connector: C, device_id: impl Into<String>, config: PollerConfig) -> Self {
        Self {
            connector,
            device_id: device_id.into(),
            config,
            state: PollState::Connecting,
            accumulator: FrameAccumulator::new(),
            identified: false,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Run one session until `cancelled` returns true or the link fails.
    ///
    /// `cancelled` is checked once per full basic info + cell voltages cycle.
    pub fn run<S, F>(&mut self, sink: &mut S, cancelled: F) -> SessionEnd
    where
        S: EventSink + ?Sized,
        F: Fn() -> bool,
    {
        self.state = PollState::Connecting;
        self.identified = false;
        self.accumulator.drain();

        let mut link = match self.connector.open(&self.device_id) {
            Ok(link) => link,
            Err(err) => {
                error!("Failed to connect to device '{}': {err}", self.device_id);
                self.state = PollState::Failed;
                return SessionEnd::ConnectFailed;
            }
        };
        info!("Connected to '{}', polling", self.device_id);

        let end = match self.poll(&mut link, sink, &cancelled) {
            Ok(()) => SessionEnd::Cancelled,
            Err(err) => {
                error!("Lost link to device '{}': {err}", self.device_id);
                SessionEnd::LinkLost
            }
        };

        self.state = PollState::Disconnecting;
        link.close();
        self.state = PollState::Terminated;
        info!("Disconnected from '{}' ({end:?})", self.device_id);
        end
    }

    fn poll<S, F>(&mut self, link: &mut C::Link, sink: &mut S, cancelled: &F) -> Result<(), Error>
    where
        S: EventSink + ?Sized,
        F: Fn() -> bool,
    {
        self.state = PollState::Identifying;
        self.exchange(link, Command::HardwareInfo, sink)?;
        std::thread::sleep(self.config.settle_interval);

        self.state = PollState::Cycling;
        while !cancelled() {
            self.exchange(link, Command::BasicInfo, sink)?;
            std::thread::sleep(self.config.settle_interval);

            self.exchange(link, Command::CellVoltages, sink)?;
            std::thread::sleep(self.config.settle_interval);
        }
        Ok(())
    }

    fn exchange<S>(&mut self, link: &mut C::Link, command: Command, sink: &mut S) -> Result<(), Error>
    where
        S: EventSink + ?Sized,
    {
        debug!("Requesting {} from '{}'", command.name(), self.device_id);
        link.write(&command.request())?;

        while let Some(fragment) = link.poll_notification(self.config.notification_timeout) {
            self.accumulator.on_fragment(&fragment);
        }
        let frame = self.accumulator.drain();
        self.dispatch(&frame, sink);
        Ok(())
    }

    fn dispatch<S>(&mut self, frame: &[u8], sink: &mut S)
    where
        S: EventSink + ?Sized,
    {
        match protocol::decode(frame, &self.device_id) {
            Ok(event) => {
                if !protocol::frame_checksum_matches(frame) {
                    warn!(
                        "Checksum mismatch from '{}', using frame anyway: {}",
                        self.device_id,
                        hex::encode(frame)
                    );
                }
                debug!("Got event from '{}': {event:?}", self.device_id);
                self.deliver(event, sink);
            }
            Err(DecodeOutcome::Empty) => {
                debug!("No response from '{}'", self.device_id);
            }
            Err(DecodeOutcome::UnknownPrefix(_)) => {
                error!(
                    "Received garbage data from '{}': {}",
                    self.device_id,
                    hex::encode(frame)
                );
            }
            Err(err @ DecodeOutcome::Malformed { .. }) => {
                info!(
                    "Failed to parse response from '{}': {err} data={}",
                    self.device_id,
                    hex::encode(frame)
                );
            }
        }
    }

    fn deliver<S>(&mut self, event: Event, sink: &mut S)
    where
        S: EventSink + ?Sized,
    {
        match &event {
            Event::HardwareInfo(_) if self.identified => {
                debug!("Ignoring repeated hardware info from '{}'", self.device_id);
                return;
            }
            Event::HardwareInfo(_) => self.identified = true,
            _ if !self.identified => {
                warn!(
                    "Dropping telemetry from '{}', device not identified yet",
                    self.device_id
                );
                return;
            }
            _ => {}
        }
        sink.on_event(&self.device_id, event);
    }
}

/// Run a single session for `device_id` with a fresh [`DevicePoller`].
pub fn poll_device<C, S, F>(
    connector: C,
    device_id: &str,
    config: PollerConfig,
    sink: &mut S,
    cancelled: F,
) -> SessionEnd
where
    C: Connector,
    S: EventSink + ?Sized,
    F: Fn() -> bool,
{
    DevicePoller::new(connector, device_id, config).run(sink, cancelled)
}
