/// Collects notification fragments of one device until the poller decides the
/// response is complete.
///
/// The accumulator is owned by a single poller and is only touched from that
/// poller's thread, so it needs no locking.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: Vec<u8>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fragment(&mut self, fragment: &[u8]) {
        log::trace!("Got fragment {}", hex::encode(fragment));
        self.buffer.extend_from_slice(fragment);
    }

    /// Take everything accumulated since the last drain as one candidate frame.
    pub fn drain(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_fragments_in_order_and_resets() {
        let mut accumulator = FrameAccumulator::new();
        accumulator.on_fragment(&[0xdd, 0x03]);
        accumulator.on_fragment(&[]);
        accumulator.on_fragment(&[0x00, 0x1b]);
        assert_eq!(accumulator.len(), 4);

        assert_eq!(accumulator.drain(), vec![0xdd, 0x03, 0x00, 0x1b]);
        assert!(accumulator.is_empty());
        assert!(accumulator.drain().is_empty());
    }
}
