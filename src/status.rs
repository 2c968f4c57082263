//! Decodes the tag-length-value status payload returned by `get_status`.
//!
//! Values extracted here mirror the public epson-inkjet-escpr driver's
//! status constants; the list of known codes is not exhaustive.

use std::collections::BTreeMap;

use crate::error::{Error, FormatError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterState {
    Error,
    SelfPrinting,
    Busy,
    Waiting,
    Idle,
    Pause,
    InkDrying,
    Cleaning,
    FactoryShipment,
    MotorDriveOff,
    Shutdown,
    WaitPaperInit,
    InitPaper,
}

impl PrinterState {
    pub fn from_raw(v: u8) -> Self {
        match v {
            0x00 => PrinterState::Error,
            0x01 => PrinterState::SelfPrinting,
            0x02 => PrinterState::Busy,
            0x03 => PrinterState::Waiting,
            0x04 => PrinterState::Idle,
            0x05 => PrinterState::Pause,
            0x06 => PrinterState::InkDrying,
            0x07 => PrinterState::Cleaning,
            0x08 => PrinterState::FactoryShipment,
            0x09 => PrinterState::MotorDriveOff,
            0x0A => PrinterState::Shutdown,
            0x0B => PrinterState::WaitPaperInit,
            0x0C => PrinterState::InitPaper,
            _ => PrinterState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterError {
    None,
    Fatal,
    Interface,
    PaperJam,
    InkOut,
    PaperOut,
    PaperSize,
    PaperFeedPath,
    ServiceRequired,
    DoubleFeed,
    InkCoverOpen,
    NoMaintenanceBox,
    CoverOpen,
    NoTray,
    CardLoading,
    CdDvdConfig,
    CartridgeOverflow,
    BatteryVoltage,
    BatteryTemperature,
    BatteryEmpty,
    ShutOff,
    NotInitialFill,
    PrintPackEnd,
    MaintenanceBoxCoverOpen,
    ScannerOpen,
    CdrGuideOpen,
    CdrExist,
    CdrExistMaintenance,
    TrayClose,
}

impl PrinterError {
    pub fn from_raw(v: u8) -> Self {
        match v {
            0x00 => PrinterError::Fatal,
            0x01 => PrinterError::Interface,
            0x04 => PrinterError::PaperJam,
            0x05 => PrinterError::InkOut,
            0x06 => PrinterError::PaperOut,
            0x0A => PrinterError::PaperSize,
            0x0C => PrinterError::PaperFeedPath,
            0x10 => PrinterError::ServiceRequired,
            0x12 => PrinterError::DoubleFeed,
            0x1A => PrinterError::InkCoverOpen,
            0x22 => PrinterError::NoMaintenanceBox,
            0x25 => PrinterError::CoverOpen,
            0x29 => PrinterError::NoTray,
            0x2A => PrinterError::CardLoading,
            0x2B => PrinterError::CdDvdConfig,
            0x2C => PrinterError::CartridgeOverflow,
            0x2F => PrinterError::BatteryVoltage,
            0x30 => PrinterError::BatteryTemperature,
            0x31 => PrinterError::BatteryEmpty,
            0x32 => PrinterError::ShutOff,
            0x33 => PrinterError::NotInitialFill,
            0x34 => PrinterError::PrintPackEnd,
            0x36 => PrinterError::MaintenanceBoxCoverOpen,
            0x37 => PrinterError::ScannerOpen,
            0x38 => PrinterError::CdrGuideOpen,
            0x44 => PrinterError::CdrExist,
            0x45 => PrinterError::CdrExistMaintenance,
            0x46 => PrinterError::TrayClose,
            _ => PrinterError::Fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperPath {
    Unknown,
    Roll,
    Fanfold,
    RollBack,
}

impl PaperPath {
    /// `source` entries are decoded from `3 - data[0]`, so this takes the
    /// already-subtracted signed value.
    pub fn from_raw_signed(v: i32) -> Self {
        match v {
            0 => PaperPath::Roll,
            1 => PaperPath::Fanfold,
            2 => PaperPath::RollBack,
            _ => PaperPath::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumableStatus {
    Okay,
    Empty,
    Missing,
    Fail,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumableLevel {
    pub level: i32,
    pub status: ConsumableStatus,
}

impl ConsumableLevel {
    pub fn from_int(level: i32) -> Self {
        if level == 110 {
            return ConsumableLevel { level: -1, status: ConsumableStatus::Missing };
        }
        if level == 105 {
            return ConsumableLevel { level: -1, status: ConsumableStatus::Unknown };
        }
        if !(0..=100).contains(&level) {
            return ConsumableLevel { level: -1, status: ConsumableStatus::Fail };
        }
        if level == 0 {
            return ConsumableLevel { level: 0, status: ConsumableStatus::Empty };
        }
        ConsumableLevel { level, status: ConsumableStatus::Okay }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InkColor {
    Black,
    Cyan,
    Magenta,
    Yellow,
    LightCyan,
    LightMagenta,
    DarkYellow,
    Gray,
    LightBlack,
    Red,
    Blue,
    GlossOptimizer,
    LightGray,
    Orange,
    Unknown,
}

impl InkColor {
    pub fn from_raw(v: u8) -> Self {
        match v {
            0 => InkColor::Black,
            1 => InkColor::Cyan,
            2 => InkColor::Magenta,
            3 => InkColor::Yellow,
            4 => InkColor::LightCyan,
            5 => InkColor::LightMagenta,
            6 => InkColor::DarkYellow,
            7 => InkColor::Gray,
            8 => InkColor::LightBlack,
            9 => InkColor::Red,
            10 => InkColor::Blue,
            11 => InkColor::GlossOptimizer,
            12 => InkColor::LightGray,
            13 => InkColor::Orange,
            _ => InkColor::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InkLevel {
    pub level: ConsumableLevel,
    pub color: InkColor,
}

impl InkLevel {
    fn from_entry(entry: &[u8]) -> Option<Self> {
        if entry.len() < 3 {
            return None;
        }
        Some(InkLevel { color: InkColor::from_raw(entry[1]), level: ConsumableLevel::from_int(entry[2] as i32) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: PrinterState,
    pub error: PrinterError,
    pub source: PaperPath,
    pub levels: Vec<InkLevel>,
    pub maintenance_box: ConsumableLevel,
    pub serial: String,
    pub other: BTreeMap<u8, Vec<u8>>,
}

impl Status {
    /// `length:u16 LE | entries`, each entry `tag:u8 len:u8 data[len]`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 2 {
            return Err(FormatError::StatusLengthMismatch { declared: 0, actual: data.len() }.into());
        }
        let declared = u16::from_le_bytes([data[0], data[1]]) as usize;
        if data.len() != declared + 2 {
            return Err(FormatError::StatusLengthMismatch { declared: declared + 2, actual: data.len() }.into());
        }

        let mut status = Status {
            state: PrinterState::Idle,
            error: PrinterError::None,
            source: PaperPath::Unknown,
            levels: Vec::new(),
            maintenance_box: ConsumableLevel { level: -1, status: ConsumableStatus::Unknown },
            serial: String::new(),
            other: BTreeMap::new(),
        };

        let mut offset = 2;
        while offset + 2 <= data.len() {
            let tag = data[offset];
            let len = data[offset + 1] as usize;
            let entry_start = offset + 2;
            let entry_end = entry_start + len;
            if entry_end > data.len() {
                return Err(FormatError::StatusLengthMismatch { declared: entry_end, actual: data.len() }.into());
            }
            let entry = &data[entry_start..entry_end];

            match tag {
                0x01 if !entry.is_empty() => status.state = PrinterState::from_raw(entry[0]),
                0x02 if !entry.is_empty() => status.error = PrinterError::from_raw(entry[0]),
                0x06 if !entry.is_empty() => status.source = PaperPath::from_raw_signed(3 - entry[0] as i32),
                0x0D if !entry.is_empty() => status.maintenance_box = ConsumableLevel::from_int(entry[0] as i32),
                0x0F if !entry.is_empty() => {
                    let entry_size = entry[0] as usize;
                    let mut levels = Vec::new();
                    if entry_size > 0 {
                        let mut i = 1;
                        while i < entry.len() {
                            let window_end = (i + entry_size).min(entry.len());
                            if let Some(level) = InkLevel::from_entry(&entry[i..window_end]) {
                                levels.push(level);
                            }
                            i += entry_size;
                        }
                    }
                    status.levels = levels;
                }
                0x40 => status.serial = String::from_utf8_lossy(entry).into_owned(),
                _ => {
                    status.other.insert(tag, entry.to_vec());
                }
            }

            offset = entry_end;
        }

        Ok(status)
    }
}
