//! The seam between the poller and a concrete link (BLE or a test double).

use crate::Error;
use std::time::Duration;

/// Opens links to devices by their transport level identity.
pub trait Connector {
    type Link: Link;

    /// Establish the link and locate the BMS characteristics.
    ///
    /// Failures are reported as [`Error::Connect`] and end the session.
    fn open(&self, device_id: &str) -> Result<Self::Link, Error>;
}

/// An open command/notification channel to one device.
pub trait Link {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Wait up to `timeout` for the next notification fragment.
    fn poll_notification(&mut self, timeout: Duration) -> Option<Vec<u8>>;

    fn close(&mut self);
}

impl<C: Connector + ?Sized> Connector for &C {
    type Link = C::Link;

    fn open(&self, device_id: &str) -> Result<Self::Link, Error> {
        (**self).open(device_id)
    }
}
