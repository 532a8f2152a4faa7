//! Offline history captures
//!
//! A capture is a text dump of a download, one record per line:
//! `<kind> <device-index> <hex bytes>`. Blank lines and `#` comments are
//! ignored, and the hex may be split by whitespace.

use crate::decode::{is_blank, RecordDecoder};
use crate::records::{DomainRecord, RecordKind};
use crate::types::{PumpError, Result};
use log::debug;

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

/// Decode every record in a capture, in file order
pub fn parse_capture(text: &str, decoder: &RecordDecoder) -> Result<Vec<DomainRecord>> {
    let mut records = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bad_line = |reason: &str| PumpError::Decode(format!("capture line {}: {}", number + 1, reason));

        let mut fields = line.splitn(3, char::is_whitespace);
        let kind = fields
            .next()
            .and_then(RecordKind::from_name)
            .ok_or_else(|| bad_line("unknown record kind"))?;
        let index: u32 = fields
            .next()
            .and_then(|field| field.parse().ok())
            .ok_or_else(|| bad_line("bad device index"))?;
        let bytes = fields
            .next()
            .and_then(parse_hex)
            .ok_or_else(|| bad_line("bad record bytes"))?;

        if is_blank(&bytes) {
            debug!("Skipping blank {} record {}", kind, index);
            continue;
        }
        let record = decoder
            .decode(kind, index, &bytes)
            .map_err(|e| bad_line(&e.to_string()))?;
        records.push(record);
    }

    Ok(records)
}
