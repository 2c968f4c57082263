//! The printer facade: builds vendor commands, parses EEPROM replies, and
//! exposes the high-level operations (status, waste, clean, restart).

use std::collections::BTreeMap;

use crate::control::ControlBackend;
use crate::devices::Device;
use crate::error::{Error, FormatError};
use crate::status::Status;

const FACTORY_OPCODE: &[u8; 2] = b"||";
const GET_STATUS_OPCODE: &[u8; 2] = b"st";
const STATUS_PREFIX: &[u8] = b"@BDC ST2\r\n";
const EEPROM_PREFIX: &[u8] = b"@BDC PS\r\n";

/// Wraps a control backend and a resolved device profile, exposing the
/// high-level vendor operations described in the device's model.
pub struct Printer {
    control: Box<dyn ControlBackend>,
    device: Device,
}

impl Printer {
    pub fn new(control: Box<dyn ControlBackend>, device: Device) -> Self {
        Printer { control, device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Frame `opcode | len(payload):u16 LE | payload` and send it.
    pub fn send_command(&mut self, opcode: &[u8], payload: &[u8]) -> Result<Vec<u8>, Error> {
        let mut command = Vec::with_capacity(opcode.len() + 2 + payload.len());
        command.extend_from_slice(opcode);
        command.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        command.extend_from_slice(payload);
        self.control.send(&command)
    }

    /// Build the `"||"` factory command: `model | action_code(3) | extra`,
    /// where the action-code triplet is an integrity check the device
    /// validates (action, its complement, and a rotated copy).
    pub fn send_factory_command(&mut self, action: u8, extra: &[u8]) -> Result<Vec<u8>, Error> {
        let action_code = [action, action ^ 0xFF, ((action >> 1) & 0x7F) | ((action << 7) & 0x80)];
        let mut payload = Vec::with_capacity(self.device.model.len() + 3 + extra.len());
        payload.extend_from_slice(&self.device.model);
        payload.extend_from_slice(&action_code);
        payload.extend_from_slice(extra);
        self.send_command(FACTORY_OPCODE, &payload)
    }

    pub fn get_status(&mut self) -> Result<Status, Error> {
        let response = self.send_command(GET_STATUS_OPCODE, &[0x01])?;
        let body = strip_prefix(&response, STATUS_PREFIX)?;
        Status::from_bytes(body)
    }

    pub fn get_serial(&mut self) -> Result<String, Error> {
        Ok(self.get_status()?.serial)
    }

    pub fn read_eeprom(&mut self, address: u16) -> Result<u8, Error> {
        let response = self.send_factory_command(0x41, &address.to_le_bytes())?;
        let body = strip_prefix(&response, EEPROM_PREFIX)?;
        // Hex digits start at offset 16 of the *full* response, not the
        // prefix-stripped body, hence the subtraction here.
        parse_ascii_hex_byte(body, 16 - EEPROM_PREFIX.len())
    }

    pub fn read_eeprom_range(&mut self, address: u16, size: u8) -> Result<Vec<u8>, Error> {
        let mut payload = address.to_le_bytes().to_vec();
        payload.push(size);
        let response = self.send_factory_command(0x51, &payload)?;
        let body = strip_prefix(&response, EEPROM_PREFIX)?;
        let hex_start = 16 - EEPROM_PREFIX.len();
        let hex_end = hex_start + (size as usize) * 2;
        let hex_digits = body
            .get(hex_start..hex_end)
            .ok_or_else(|| FormatError::InvalidHex(format!("reply too short for {size} bytes")))?;
        decode_ascii_hex(hex_digits)
    }

    pub fn read_eeprom_multiple(&mut self, addresses: &[u16]) -> Result<Vec<u8>, Error> {
        addresses.iter().map(|&addr| self.read_eeprom(addr)).collect()
    }

    pub fn write_eeprom(&mut self, address: u16, value: u8) -> Result<Vec<u8>, Error> {
        let mut payload = address.to_le_bytes().to_vec();
        payload.push(value);
        payload.extend_from_slice(&self.device.key);
        self.send_factory_command(0x42, &payload)
    }

    /// Write every `(address, value)` pair from the device profile's reset
    /// map. A failure mid-sequence propagates and the remaining writes do
    /// not execute.
    pub fn reset_waste(&mut self) -> Result<(), Error> {
        let entries: Vec<(u16, u8)> = self.device.reset.iter().map(|(&a, &v)| (a, v)).collect();
        for (address, value) in entries {
            self.write_eeprom(address, value)?;
        }
        Ok(())
    }

    /// For each counter, read all its addresses and interpret the result
    /// as a little-endian unsigned integer, paired with its maximum.
    pub fn get_waste(&mut self) -> Result<Vec<(u32, u32)>, Error> {
        let counters = self.device.counters.clone();
        counters
            .iter()
            .map(|counter| {
                let bytes = self.read_eeprom_multiple(&counter.addresses)?;
                let value = bytes.iter().rev().fold(0u32, |acc, &b| (acc << 8) | b as u32);
                Ok((value, counter.max))
            })
            .collect()
    }

    pub fn clean(&mut self, level: u8) -> Result<(), Error> {
        self.send_factory_command(0x84, &[level])?;
        Ok(())
    }

    pub fn power_off(&mut self) -> Result<(), Error> {
        self.send_factory_command(0x20, &[])?;
        Ok(())
    }

    pub fn restart(&mut self) -> Result<(), Error> {
        self.send_factory_command(0x21, &[])?;
        Ok(())
    }

    /// Parse the control backend's semicolon-separated 1284 ID string into
    /// a `KEY -> VALUE` map.
    pub fn identify(&mut self) -> Result<BTreeMap<String, String>, Error> {
        let id = self.control.identify()?;
        Ok(id
            .split(';')
            .filter(|field| !field.is_empty())
            .filter_map(|field| field.split_once(':'))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect())
    }
}

fn strip_prefix<'a>(response: &'a [u8], prefix: &[u8]) -> Result<&'a [u8], Error> {
    response
        .strip_prefix(prefix)
        .ok_or_else(|| FormatError::UnexpectedPrefix { expected: prefix_label(prefix), got: response.to_vec() }.into())
}

fn prefix_label(prefix: &[u8]) -> &'static str {
    if prefix == STATUS_PREFIX {
        "@BDC ST2\\r\\n"
    } else {
        "@BDC PS\\r\\n"
    }
}

fn parse_ascii_hex_byte(body: &[u8], offset: usize) -> Result<u8, Error> {
    let digits = body
        .get(offset..offset + 2)
        .ok_or_else(|| FormatError::InvalidHex("reply too short for a hex byte".to_string()))?;
    Ok(decode_ascii_hex(digits)?[0])
}

fn decode_ascii_hex(digits: &[u8]) -> Result<Vec<u8>, Error> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| FormatError::InvalidHex(String::from_utf8_lossy(digits).into_owned()))?;
    if text.len() % 2 != 0 {
        return Err(FormatError::InvalidHex(text.to_string()).into());
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| Error::Format(FormatError::InvalidHex(text.to_string())))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Counter;
    use std::collections::BTreeMap as Map;

    struct ScriptedBackend {
        replies: std::collections::VecDeque<Vec<u8>>,
        id: String,
        sent_log: std::rc::Rc<std::cell::RefCell<Vec<Vec<u8>>>>,
    }

    impl ControlBackend for ScriptedBackend {
        fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, Error> {
            self.sent_log.borrow_mut().push(command.to_vec());
            self.replies.pop_front().ok_or_else(|| FormatError::InvalidHex("no scripted reply".to_string()).into())
        }

        fn identify(&mut self) -> Result<String, Error> {
            Ok(self.id.clone())
        }

        fn close(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn backend_with_replies(
        replies: Vec<Vec<u8>>,
    ) -> (ScriptedBackend, std::rc::Rc<std::cell::RefCell<Vec<Vec<u8>>>>) {
        let sent_log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        (ScriptedBackend { replies: replies.into(), id: String::new(), sent_log: sent_log.clone() }, sent_log)
    }

    fn device() -> Device {
        Device {
            model: b"XP900".to_vec(),
            key: vec![0xAB],
            counters: vec![Counter { addresses: vec![0x10, 0x11], max: 84400 }],
            reset: Map::from([(0x10u16, 0x00u8), (0x11u16, 0x00u8)]),
        }
    }

    #[test]
    fn action_code_triplet_for_known_actions() {
        let (backend, sent) = backend_with_replies(vec![vec![0xAA]]);
        let mut printer = Printer::new(Box::new(backend), device());
        printer.send_factory_command(0x41, &[]).unwrap();
        let log = sent.borrow();
        let command = &log[0];
        // opcode(2) + len(2) + model(5) + action_code(3)
        let action_code = &command[command.len() - 3..];
        assert_eq!(action_code, &[0x41, 0xBE, 0xA0]);
    }

    #[test]
    fn action_code_triplet_for_write_eeprom() {
        let (backend, sent) = backend_with_replies(vec![vec![0xAA]]);
        let mut printer = Printer::new(Box::new(backend), device());
        printer.write_eeprom(0x10, 0x00).unwrap();
        let log = sent.borrow();
        let model_len = 5;
        let action_code_start = 2 + 2 + model_len;
        assert_eq!(&log[0][action_code_start..action_code_start + 3], &[0x42, 0xBD, 0x21]);
    }

    #[test]
    fn get_status_strips_prefix_and_decodes_tlv() {
        let mut response = STATUS_PREFIX.to_vec();
        response.extend_from_slice(&[0x00, 0x00]); // length = 0 -> no entries
        let (backend, _sent) = backend_with_replies(vec![response]);
        let mut printer = Printer::new(Box::new(backend), device());
        let status = printer.get_status().unwrap();
        assert_eq!(status.serial, "");
    }

    #[test]
    fn get_status_rejects_unexpected_prefix() {
        let (backend, _sent) = backend_with_replies(vec![b"nope".to_vec()]);
        let mut printer = Printer::new(Box::new(backend), device());
        assert!(printer.get_status().is_err());
    }

    #[test]
    fn read_eeprom_parses_ascii_hex_at_offset_16() {
        // Full response layout: 9-byte prefix, then padding out to byte 16,
        // then the two hex digits.
        let mut response = EEPROM_PREFIX.to_vec();
        response.resize(16, 0);
        response.extend_from_slice(b"7F");
        let (backend, _sent) = backend_with_replies(vec![response]);
        let mut printer = Printer::new(Box::new(backend), device());
        assert_eq!(printer.read_eeprom(0x10).unwrap(), 127);
    }

    #[test]
    fn reset_waste_writes_every_pair_and_stops_on_error() {
        let (backend, sent) = backend_with_replies(vec![vec![0xAA]]);
        let mut printer = Printer::new(Box::new(backend), device());
        let result = printer.reset_waste();
        assert!(result.is_err()); // second write has no scripted reply left
        assert_eq!(sent.borrow().len(), 2);
    }

    #[test]
    fn identify_parses_semicolon_fields() {
        let (mut backend, _sent) = backend_with_replies(vec![]);
        backend.id = "MFG:EPSON;MDL:XP-900;".to_string();
        let mut printer = Printer::new(Box::new(backend), device());
        let fields = printer.identify().unwrap();
        assert_eq!(fields.get("MFG"), Some(&"EPSON".to_string()));
        assert_eq!(fields.get("MDL"), Some(&"XP-900".to_string()));
    }
}
