//! `epsctl`: an IEEE 1284.4 ("D4") / END4 control-channel client for Epson
//! inkjet printers. Vendor status, EEPROM read/write, and waste-ink
//! counter reset.

mod control;
mod d4;
mod devices;
mod error;
mod printer;
mod status;
mod transport;

pub use control::{ControlBackend, D4ControlBackend, End4ControlBackend};
pub use d4::{D4Channel, D4Command, D4Engine, D4Packet};
pub use devices::{Counter, Device, Registry};
pub use error::{BackendError, D4ErrorCode, Error, FormatError, ProtocolError, TransportError};
pub use printer::Printer;
pub use status::{
    ConsumableLevel, ConsumableStatus, InkColor, InkLevel, PaperPath, PrinterError, PrinterState, Status,
};
pub use transport::{LoopbackTransport, Transport};
