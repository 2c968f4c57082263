//! The raw bidirectional byte stream to one printer.
//!
//! A [`Transport`] is a scoped resource: something opens it, hands it to a
//! [`crate::control::ControlBackend`], and it is dropped when that backend's
//! scope ends. The only implementation shipped here is [`LoopbackTransport`],
//! an in-memory duplex pipe used by this crate's own tests and by the CLI's
//! `--fake` mode. The real Win32 USBPRINT transport is platform-specific and
//! stays out of scope; its contract is documented below so a caller can
//! implement it externally.

use std::collections::VecDeque;

use crate::error::{Error, TransportError};

/// Raw byte-stream access to one printer.
///
/// `read` blocks until `n` bytes are available. `drain` discards only
/// currently-buffered inbound bytes and never blocks. `identify` returns the
/// device's raw IEEE 1284 ID string (semicolon-separated `KEY:VALUE;…`).
pub trait Transport {
    fn read(&mut self, n: usize) -> Result<Vec<u8>, Error>;
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;
    fn drain(&mut self) -> Result<(), Error>;
    fn identify(&mut self) -> Result<String, Error>;
    fn is_closed(&self) -> bool;
}

/// An in-memory duplex byte pipe standing in for a real device.
///
/// Bytes written via [`Transport::write`] are appended to `inbox` (what a
/// peer reading from the other end would see); bytes handed back via
/// [`Transport::read`] are drained from `outbox` (pre-scripted replies, or
/// whatever a test harness pushed in). This lets tests drive both sides of
/// the protocol without any real I/O.
pub struct LoopbackTransport {
    outbox: VecDeque<u8>,
    inbox: Vec<u8>,
    identity: String,
    closed: bool,
    /// Caps the number of empty reads `read()` will tolerate before giving
    /// up with a `TransportError::Closed`, instead of spinning forever.
    /// Test-only machinery; `None` means unbounded (the default).
    max_starved_reads: Option<u32>,
}

impl LoopbackTransport {
    pub fn new(identity: impl Into<String>) -> Self {
        LoopbackTransport {
            outbox: VecDeque::new(),
            inbox: Vec::new(),
            identity: identity.into(),
            closed: false,
            max_starved_reads: None,
        }
    }

    /// Queue bytes to be returned by future `read()` calls.
    pub fn push_reply(&mut self, bytes: &[u8]) {
        self.outbox.extend(bytes.iter().copied());
    }

    /// Everything written to this transport so far, for test assertions.
    pub fn written(&self) -> &[u8] {
        &self.inbox
    }

    pub fn clear_written(&mut self) {
        self.inbox.clear();
    }

    pub fn set_max_starved_reads(&mut self, n: u32) {
        self.max_starved_reads = Some(n);
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl Transport for LoopbackTransport {
    fn read(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        if self.closed {
            return Err(TransportError::Closed.into());
        }
        let mut out = Vec::with_capacity(n);
        let mut starved = 0u32;
        while out.len() < n {
            match self.outbox.pop_front() {
                Some(b) => out.push(b),
                None => {
                    starved += 1;
                    if let Some(max) = self.max_starved_reads {
                        if starved > max {
                            return Err(TransportError::Closed.into());
                        }
                    }
                    if self.max_starved_reads.is_none() {
                        return Err(TransportError::Closed.into());
                    }
                }
            }
        }
        Ok(out)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.closed {
            return Err(TransportError::Closed.into());
        }
        self.inbox.extend_from_slice(data);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), Error> {
        self.outbox.clear();
        Ok(())
    }

    fn identify(&mut self) -> Result<String, Error> {
        if self.closed {
            return Err(TransportError::Closed.into());
        }
        Ok(self.identity.clone())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let mut t = LoopbackTransport::new("MFG:EPSON;MDL:XP-900;");
        t.push_reply(&[1, 2, 3, 4]);
        assert_eq!(t.read(2).unwrap(), vec![1, 2]);
        assert_eq!(t.read(2).unwrap(), vec![3, 4]);
        t.write(b"hello").unwrap();
        assert_eq!(t.written(), b"hello");
    }

    #[test]
    fn drain_discards_only_buffered_bytes() {
        let mut t = LoopbackTransport::new("id");
        t.push_reply(&[9, 9, 9]);
        t.drain().unwrap();
        t.set_max_starved_reads(0);
        assert!(t.read(1).is_err());
    }

    #[test]
    fn closed_transport_errors_on_every_op() {
        let mut t = LoopbackTransport::new("id");
        t.close();
        assert!(t.is_closed());
        assert!(t.read(1).is_err());
        assert!(t.write(b"x").is_err());
        assert!(t.identify().is_err());
    }

    #[test]
    fn identify_returns_configured_string() {
        let mut t = LoopbackTransport::new("MFG:EPSON;CMD:ESCPL2;MDL:XP-900;");
        assert_eq!(t.identify().unwrap(), "MFG:EPSON;CMD:ESCPL2;MDL:XP-900;");
    }
}
