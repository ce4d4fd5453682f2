use std::collections::VecDeque;
use std::io;

/// Byte transport between host and engine.
///
/// All calls are non-blocking: the engine polls, and a transport that has
/// nothing to offer (or no room) says so instead of waiting.
pub trait Transport {
    /// Next byte from the host, if one is buffered.
    fn try_read(&mut self) -> io::Result<Option<u8>>;
    /// Queue one byte for the host. `false` means no room right now.
    fn try_write(&mut self, byte: u8) -> io::Result<bool>;
    /// Push queued output towards the host.
    fn flush(&mut self) -> io::Result<()>;
    /// Discard everything buffered in both directions.
    fn reset(&mut self) -> io::Result<()>;
    /// The control-channel (baud) value, when it changed since the last call.
    fn control_signal(&mut self) -> io::Result<Option<u32>>;
}

/// In-memory transport. The test or embedding program plays the host.
#[derive(Debug, Default)]
pub struct Loopback {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    tx_limit: Option<usize>,
    control: Option<u32>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host → device bytes.
    pub fn host_send(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    /// Drain device → host bytes.
    pub fn host_take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    pub fn pending_rx(&self) -> usize {
        self.rx.len()
    }

    /// Cap undrained output, modelling a host that stops reading.
    pub fn set_tx_limit(&mut self, limit: Option<usize>) {
        self.tx_limit = limit;
    }

    /// Change the line-coding baud value as the host would.
    pub fn set_baud(&mut self, baud: u32) {
        self.control = Some(baud);
    }
}

impl Transport for Loopback {
    fn try_read(&mut self) -> io::Result<Option<u8>> {
        Ok(self.rx.pop_front())
    }

    fn try_write(&mut self, byte: u8) -> io::Result<bool> {
        if self.tx_limit.is_some_and(|l| self.tx.len() >= l) {
            return Ok(false);
        }
        self.tx.push(byte);
        Ok(true)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        self.rx.clear();
        self.tx.clear();
        Ok(())
    }

    fn control_signal(&mut self) -> io::Result<Option<u32>> {
        Ok(self.control.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_directions() {
        let mut t = Loopback::new();
        t.host_send(&[1, 2]);
        assert_eq!(t.try_read().unwrap(), Some(1));
        assert!(t.try_write(9).unwrap());
        assert_eq!(t.host_take(), vec![9]);
        assert_eq!(t.pending_rx(), 1);
        t.reset().unwrap();
        assert_eq!(t.try_read().unwrap(), None);
    }

    #[test]
    fn tx_limit_applies_backpressure() {
        let mut t = Loopback::new();
        t.set_tx_limit(Some(2));
        assert!(t.try_write(1).unwrap());
        assert!(t.try_write(2).unwrap());
        assert!(!t.try_write(3).unwrap());
        t.host_take();
        assert!(t.try_write(3).unwrap());
    }

    #[test]
    fn control_value_reported_once() {
        let mut t = Loopback::new();
        assert_eq!(t.control_signal().unwrap(), None);
        t.set_baud(10_000);
        assert_eq!(t.control_signal().unwrap(), Some(10_000));
        assert_eq!(t.control_signal().unwrap(), None);
    }
}
