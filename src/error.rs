//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own small error enum; [`Error`] composes them so
//! callers higher up the stack (the facade, the CLI) can match on one type
//! without losing which layer actually failed.

use std::fmt;

/// Top-level error type returned by every public operation in this crate.
#[derive(Debug)]
pub enum Error {
    Transport(TransportError),
    Protocol(ProtocolError),
    Format(FormatError),
    UnknownModel(String),
    Backend(BackendError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Protocol(e) => write!(f, "protocol error: {e}"),
            Error::Format(e) => write!(f, "format error: {e}"),
            Error::UnknownModel(model) => write!(f, "unknown printer model: {model}"),
            Error::Backend(e) => write!(f, "backend error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Format(e) => Some(e),
            Error::UnknownModel(_) => None,
            Error::Backend(e) => Some(e),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<FormatError> for Error {
    fn from(e: FormatError) -> Self {
        Error::Format(e)
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::Backend(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(TransportError::Io(e))
    }
}

/// Failures reading from or writing to the underlying byte stream.
#[derive(Debug)]
pub enum TransportError {
    /// The underlying channel returned an I/O error.
    Io(std::io::Error),
    /// The transport was already closed when an operation was attempted.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "I/O failure: {e}"),
            TransportError::Closed => write!(f, "transport is closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Closed => None,
        }
    }
}

/// Failures in D4 framing or command/response dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// `read_next_packet` demultiplexed a packet for a psid with no open channel.
    UnknownSocket(u8),
    /// The response's opcode byte didn't echo `request_opcode | 0x80`.
    OpcodeMismatch { expected: u8, got: u8 },
    /// The response's second byte wasn't zero.
    MalformedResponsePrefix(u8),
    /// The device replied with a D4 error frame (first byte `0x7F`).
    DeviceError(D4ErrorCode),
    /// A reply carried fewer bytes than the command requires.
    ShortResponse { expected_at_least: usize, got: usize },
    /// No psid is free to allocate to a new channel (every 0..=255 in use).
    NoFreePsid,
    /// A command requiring channel-0 credit was attempted with none held.
    InsufficientCredit,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownSocket(psid) => {
                write!(f, "received packet for unknown socket id {psid}")
            }
            ProtocolError::OpcodeMismatch { expected, got } => write!(
                f,
                "response opcode mismatch: expected 0x{expected:02x}, got 0x{got:02x}"
            ),
            ProtocolError::MalformedResponsePrefix(byte) => {
                write!(f, "malformed response prefix: expected 0x00, got 0x{byte:02x}")
            }
            ProtocolError::DeviceError(code) => write!(f, "device reported error: {code}"),
            ProtocolError::ShortResponse { expected_at_least, got } => write!(
                f,
                "response too short: expected at least {expected_at_least} bytes, got {got}"
            ),
            ProtocolError::NoFreePsid => write!(f, "no free psid to allocate to a new channel"),
            ProtocolError::InsufficientCredit => write!(f, "channel 0 has no credit to send a command"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The device-side error codes D4 command replies carry in their fourth byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct D4ErrorCode(pub u8);

impl fmt::Display for D4ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0x80 => "malformed packet",
            0x81 => "no credit",
            0x82 => "reply without command",
            0x83 => "packet too big",
            0x84 => "channel not open",
            0x85 => "unknown result",
            0x86 => "credit overflow",
            0x87 => "bad command/reply",
            _ => "unrecognized error code",
        };
        write!(f, "{name} (0x{:02x})", self.0)
    }
}

/// Failures decoding a status TLV blob or an EEPROM reply body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The status payload's declared length didn't match its actual size.
    StatusLengthMismatch { declared: usize, actual: usize },
    /// An EEPROM reply didn't start with the prefix the operation expects.
    UnexpectedPrefix { expected: &'static str, got: Vec<u8> },
    /// The ASCII hex digits in an EEPROM reply didn't parse.
    InvalidHex(String),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::StatusLengthMismatch { declared, actual } => write!(
                f,
                "status payload length invalid: header declared {declared}, buffer holds {actual}"
            ),
            FormatError::UnexpectedPrefix { expected, got } => write!(
                f,
                "unexpected response prefix: expected {expected:?}, got {:?}",
                String::from_utf8_lossy(got)
            ),
            FormatError::InvalidHex(s) => write!(f, "invalid ASCII hex: {s:?}"),
        }
    }
}

impl std::error::Error for FormatError {}

/// END4-specific framing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The device's 1284 ID string lacked a `DDS` field, or it wasn't valid hex.
    MissingOrInvalidDds,
    /// The transport was already closed when the backend tried to enter.
    DeviceClosed,
    /// A reply's declared length didn't match the number of bytes actually read.
    IncompletePacket { expected: usize, got: usize },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::MissingOrInvalidDds => {
                write!(f, "device identifier is missing a valid DDS field")
            }
            BackendError::DeviceClosed => write!(f, "bidirectional device is closed"),
            BackendError::IncompletePacket { expected, got } => {
                write!(f, "received incomplete packet: expected {expected} bytes, got {got}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn d4_error_code_display_known() {
        assert_eq!(format!("{}", D4ErrorCode(0x81)), "no credit (0x81)");
    }

    #[test]
    fn d4_error_code_display_unknown() {
        let s = format!("{}", D4ErrorCode(0x01));
        assert!(s.contains("unrecognized"));
    }

    #[test]
    fn error_wraps_and_displays_subsystem() {
        let e: Error = ProtocolError::NoFreePsid.into();
        assert!(format!("{e}").contains("no free psid"));
    }

    #[test]
    fn unknown_model_display() {
        let e = Error::UnknownModel("XP-9999".to_string());
        assert_eq!(format!("{e}"), "unknown printer model: XP-9999");
    }
}
