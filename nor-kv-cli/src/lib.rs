//! Tooling around flash image files holding a nor-kv store.

pub mod error;
mod image;

pub use image::{FileFlash, FileFlashError};

use crate::error::Error;
use core::fmt::Write;
use nor_kv::{Config, Kv, KvStatistics};

/// Opens the store covering the whole image.
pub fn open_store(flash: &mut FileFlash, config: Config) -> Result<Kv<&mut FileFlash>, Error> {
    let size = flash.len();
    Ok(Kv::new(0, size, flash, config)?)
}

/// Parses a value given on the command line, either literally or hex encoded.
pub fn parse_value(value: &str, is_hex: bool) -> Result<Vec<u8>, Error> {
    if is_hex {
        Ok(hex::decode(value)?)
    } else {
        Ok(value.as_bytes().to_vec())
    }
}

/// Hex dump, 16 bytes per line with the printable characters alongside.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in bytes.chunks(16).enumerate() {
        let hex = chunk
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        let text = chunk
            .iter()
            .map(|&byte| {
                if byte.is_ascii_graphic() || byte == b' ' {
                    byte as char
                } else {
                    '.'
                }
            })
            .collect::<String>();
        let _ = writeln!(out, "{:04x}  {hex:<47}  |{text}|", line * 16);
    }
    out
}

/// Printable form of a key or value: the text itself if it is UTF-8 without control
/// characters, hex otherwise.
pub fn display_bytes(bytes: &[u8]) -> String {
    match core::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => format!("0x{}", hex::encode(bytes)),
    }
}

pub fn format_statistics(statistics: &KvStatistics) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "blocks: {} clean, {} used, {} dirty",
        statistics.blocks.clean, statistics.blocks.used, statistics.blocks.dirty
    );
    for (index, usage) in statistics.per_block.iter().enumerate() {
        let _ = writeln!(
            out,
            "  block {index:2}: {:<5} free {:4} items {}",
            usage.state.to_string(),
            usage.free,
            usage.live_items
        );
    }
    let _ = writeln!(out, "live items: {}", statistics.live_items);
    let _ = writeln!(out, "write position: {:#06x}", statistics.write_position);
    if let Some(entries) = statistics.mapping_entries {
        let _ = writeln!(out, "mapping entries: {entries}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hexdump_layout() {
        assert_eq!(
            hexdump(b"hello\x00world, this is long"),
            "0000  68 65 6c 6c 6f 00 77 6f 72 6c 64 2c 20 74 68 69  |hello.world, thi|\n\
             0010  73 20 69 73 20 6c 6f 6e 67                       |s is long|\n"
        );
    }

    #[test]
    fn displayable_bytes() {
        assert_eq!(display_bytes(b"plain"), "plain");
        assert_eq!(display_bytes(&[0x01, 0xFF]), "0x01ff");
    }

    #[test]
    fn values_from_arguments() {
        assert_eq!(parse_value("abc", false).unwrap(), b"abc");
        assert_eq!(parse_value("00ff10", true).unwrap(), vec![0x00, 0xFF, 0x10]);
        assert!(matches!(parse_value("0g", true), Err(Error::HexError(_))));
    }
}
