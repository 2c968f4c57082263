//! The device profile registry: loads the bundled model→EEPROM descriptor
//! and answers `by_model`.

use std::collections::BTreeMap;

use roxmltree::Document;

use crate::error::Error;

const DEVICES_XML: &str = include_str!("devices.xml");

/// One waste-ink counter: the EEPROM cell addresses that together encode
/// its current value (little-endian across cells), and its maximum.
#[derive(Debug, Clone)]
pub struct Counter {
    pub addresses: Vec<u16>,
    pub max: u32,
}

/// A resolved printer model profile.
#[derive(Debug, Clone)]
pub struct Device {
    pub model: Vec<u8>,
    pub key: Vec<u8>,
    pub counters: Vec<Counter>,
    pub reset: BTreeMap<u16, u8>,
}

/// Loads the bundled XML descriptor once and answers repeated model
/// lookups against it.
pub struct Registry {
    doc: Document<'static>,
}

impl Registry {
    pub fn load() -> Result<Self, Error> {
        let doc = Document::parse(DEVICES_XML)
            .map_err(|e| Error::Format(crate::error::FormatError::InvalidHex(e.to_string())))?;
        Ok(Registry { doc })
    }

    /// Every `<printer model="...">` the registry knows about.
    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.doc
            .descendants()
            .filter(|n| n.has_tag_name("printer"))
            .filter_map(|n| n.attribute("model"))
    }

    pub fn by_model(&self, model: &str) -> Result<Device, Error> {
        let printer = self
            .doc
            .descendants()
            .find(|n| n.has_tag_name("printer") && n.attribute("model") == Some(model))
            .ok_or_else(|| Error::UnknownModel(model.to_string()))?;

        let spec_ids: Vec<&str> = printer
            .attribute("specs")
            .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let mut device = Device { model: Vec::new(), key: Vec::new(), counters: Vec::new(), reset: BTreeMap::new() };

        for spec_id in spec_ids {
            let spec = self
                .doc
                .descendants()
                .find(|n| n.has_tag_name("spec") && n.attribute("id") == Some(spec_id));
            let Some(spec) = spec else { continue };

            if let Some(service) = spec.children().find(|n| n.has_tag_name("service")) {
                if let Some(factory) = service.children().find(|n| n.has_tag_name("factory")) {
                    device.model.extend(parse_byte_tokens(factory.text().unwrap_or(""))?);
                }
                if let Some(keyword) = service.children().find(|n| n.has_tag_name("keyword")) {
                    device.key.extend(parse_byte_tokens(keyword.text().unwrap_or(""))?);
                }
            }

            if let Some(waste) = spec.children().find(|n| n.has_tag_name("waste")) {
                if let Some(query) = waste.children().find(|n| n.has_tag_name("query")) {
                    for counter_node in query.children().filter(|n| n.has_tag_name("counter")) {
                        let entry = counter_node
                            .children()
                            .find(|n| n.has_tag_name("entry"))
                            .and_then(|n| n.text())
                            .unwrap_or("");
                        let max = counter_node
                            .children()
                            .find(|n| n.has_tag_name("max"))
                            .and_then(|n| n.text())
                            .unwrap_or("0");
                        let addresses = parse_int_tokens(entry)?.into_iter().map(|v| v as u16).collect();
                        let max = parse_int_token(max.trim())
                            .ok_or_else(|| Error::Format(crate::error::FormatError::InvalidHex(max.to_string())))?
                            as u32;
                        device.counters.push(Counter { addresses, max });
                    }
                }
                if let Some(reset_node) = waste.children().find(|n| n.has_tag_name("reset")) {
                    let tokens = parse_int_tokens(reset_node.text().unwrap_or(""))?;
                    for pair in tokens.chunks(2) {
                        if let [addr, value] = pair {
                            device.reset.insert(*addr as u16, *value as u8);
                        }
                    }
                }
            }
        }

        Ok(device)
    }
}

/// Parse Python-`int(x, 0)`-style integer literals: `0x`/`0o`/`0b` prefixes
/// or plain decimal.
fn parse_int_token(token: &str) -> Option<i64> {
    let (negative, token) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let value = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(oct) = token.strip_prefix("0o").or_else(|| token.strip_prefix("0O")) {
        i64::from_str_radix(oct, 8).ok()?
    } else if let Some(bin) = token.strip_prefix("0b").or_else(|| token.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2).ok()?
    } else {
        token.parse().ok()?
    };
    Some(if negative { -value } else { value })
}

fn parse_int_tokens(text: &str) -> Result<Vec<i64>, Error> {
    text.split_whitespace()
        .map(|tok| parse_int_token(tok).ok_or_else(|| Error::Format(crate::error::FormatError::InvalidHex(tok.to_string()))))
        .collect()
}

fn parse_byte_tokens(text: &str) -> Result<Vec<u8>, Error> {
    parse_int_tokens(text).map(|values| values.into_iter().map(|v| v as u8).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_octal_binary_and_decimal() {
        assert_eq!(parse_int_token("0x1A"), Some(26));
        assert_eq!(parse_int_token("0o32"), Some(26));
        assert_eq!(parse_int_token("0b11010"), Some(26));
        assert_eq!(parse_int_token("26"), Some(26));
    }

    #[test]
    fn unknown_model_is_a_typed_error() {
        let registry = Registry::load().unwrap();
        let err = registry.by_model("does-not-exist").unwrap_err();
        assert!(matches!(err, Error::UnknownModel(_)));
    }

    #[test]
    fn known_model_resolves_factory_key_and_counters() {
        let registry = Registry::load().unwrap();
        let device = registry.by_model("XP-900").unwrap();
        assert_eq!(device.model, b"XP900");
        assert!(!device.key.is_empty());
        assert!(!device.counters.is_empty());
        assert!(!device.reset.is_empty());
    }

    #[test]
    fn model_ids_enumerates_bundled_printers() {
        let registry = Registry::load().unwrap();
        let ids: Vec<&str> = registry.model_ids().collect();
        assert!(ids.contains(&"XP-900"));
        assert!(ids.contains(&"WF-2630"));
    }

    #[test]
    fn reset_map_pairs_addresses_with_values() {
        let registry = Registry::load().unwrap();
        let device = registry.by_model("XP-900").unwrap();
        assert_eq!(device.reset.get(&0x1A), Some(&0x00));
        assert_eq!(device.reset.get(&0x22), Some(&0x00));
    }
}
