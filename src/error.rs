/// Reasons a candidate frame did not turn into an [`Event`](crate::protocol::Event).
///
/// None of these are fatal; the poller logs them and moves on to its next step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeOutcome {
    /// Nothing was accumulated, the device did not answer.
    #[error("Empty frame")]
    Empty,
    /// The two leading bytes match none of the known response shapes.
    #[error("Unknown response prefix {0:02X?}")]
    UnknownPrefix([u8; 2]),
    /// The prefix was recognized but the layout does not fit the bytes received.
    #[error("Malformed {what} frame: {detail}")]
    Malformed { what: &'static str, detail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Link could not be established, the session ends without retry.
    #[error("Cannot connect to '{device_id}': {reason}")]
    Connect { device_id: String, reason: String },
    /// An established link stopped accepting commands.
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeOutcome),
}
