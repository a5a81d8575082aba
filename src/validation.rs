//! # Validation Module
//!
//! Centralizes the input validation rules the rest of the runtime relies on:
//! node id parsing/formatting, chat key parsing, coordinate bounds, and the
//! text-length limits enforced on outbound messages. Kept dependency-free
//! (no I/O) so it can be unit tested in isolation.

use anyhow::{anyhow, Result};

/// Broadcast sentinel node number. Meshtastic reserves this as "everyone".
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

/// Format a node number as the canonical `!xxxxxxxx` string form.
///
/// `0` is special-cased to the literal `"unknown"` per the wire protocol's
/// convention that a zero node number means "not yet known".
pub fn format_node_id(num: u32) -> String {
    if num == 0 {
        "unknown".to_string()
    } else {
        format!("!{:08x}", num)
    }
}

/// Parse a node id accepting `!xxxxxxxx` (hex), `0x...` (hex), or decimal.
///
/// Rejects the broadcast sentinel as a target, per the glossary definition
/// of node id in spec.md.
pub fn parse_node_id(input: &str) -> Result<u32> {
    let trimmed = input.trim();
    let num = if let Some(hex) = trimmed.strip_prefix('!') {
        u32::from_str_radix(hex, 16).map_err(|e| anyhow!("invalid node id '{}': {}", input, e))?
    } else if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| anyhow!("invalid node id '{}': {}", input, e))?
    } else {
        trimmed
            .parse::<u32>()
            .map_err(|e| anyhow!("invalid node id '{}': {}", input, e))?
    };
    if num == BROADCAST_NUM {
        return Err(anyhow!("broadcast address !ffffffff is not a valid target"));
    }
    Ok(num)
}

/// A parsed chat key: either a broadcast channel or a direct-message thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTarget {
    Channel(u32),
    Dm(u32),
}

/// Parse a chat key of the form `channel:<index>` or `dm:!<nodeid>`.
pub fn parse_chat_key(key: &str) -> Result<ChatTarget> {
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("chat key must not be empty"));
    }
    if let Some(rest) = key.strip_prefix("channel:") {
        let idx: u32 = rest
            .parse()
            .map_err(|e| anyhow!("invalid channel index in chat key '{}': {}", key, e))?;
        return Ok(ChatTarget::Channel(idx));
    }
    if let Some(rest) = key.strip_prefix("dm:") {
        let num = parse_node_id(rest)?;
        return Ok(ChatTarget::Dm(num));
    }
    Err(anyhow!("chat key '{}' must start with 'channel:' or 'dm:'", key))
}

/// Build the canonical chat key for a broadcast channel.
pub fn channel_chat_key(index: u32) -> String {
    format!("channel:{}", index)
}

/// Build the canonical chat key for a direct-message thread.
pub fn dm_chat_key(num: u32) -> String {
    format!("dm:{}", format_node_id(num))
}

/// Validate outbound message text: non-empty by rune count, <= 200 bytes.
pub fn validate_text(text: &str) -> Result<()> {
    if text.chars().count() == 0 {
        return Err(anyhow!("message text must not be empty"));
    }
    if text.as_bytes().len() > 200 {
        return Err(anyhow!(
            "message text too long: {} bytes (limit 200)",
            text.as_bytes().len()
        ));
    }
    Ok(())
}

/// Validate a chat key is trimmed and non-empty, then fully parse it.
pub fn validate_chat_key(key: &str) -> Result<ChatTarget> {
    if key.trim().is_empty() {
        return Err(anyhow!("chat key must not be empty"));
    }
    parse_chat_key(key)
}

/// Validate a WGS84 coordinate pair.
pub fn validate_coordinates(lat: f64, lon: f64) -> Result<()> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(anyhow!("latitude {} out of range [-90, 90]", lat));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(anyhow!("longitude {} out of range [-180, 180]", lon));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_zero_as_unknown() {
        assert_eq!(format_node_id(0), "unknown");
    }

    #[test]
    fn formats_node_id_lowercase_hex() {
        assert_eq!(format_node_id(0x2a), "!0000002a");
    }

    #[test]
    fn parses_bang_hex_dec_forms() {
        assert_eq!(parse_node_id("!0000002a").unwrap(), 0x2a);
        assert_eq!(parse_node_id("0x2a").unwrap(), 0x2a);
        assert_eq!(parse_node_id("42").unwrap(), 42);
    }

    #[test]
    fn rejects_broadcast_target() {
        assert!(parse_node_id("!ffffffff").is_err());
        assert!(parse_chat_key("dm:!ffffffff").is_err());
    }

    #[test]
    fn parses_channel_and_dm_keys() {
        assert_eq!(parse_chat_key("channel:0").unwrap(), ChatTarget::Channel(0));
        assert_eq!(parse_chat_key("dm:!0000cafe").unwrap(), ChatTarget::Dm(0xcafe));
    }

    #[test]
    fn text_limits_enforced() {
        assert!(validate_text("").is_err());
        assert!(validate_text(&"a".repeat(200)).is_ok());
        assert!(validate_text(&"a".repeat(201)).is_err());
    }

    #[test]
    fn coordinate_bounds() {
        assert!(validate_coordinates(90.0, 180.0).is_ok());
        assert!(validate_coordinates(-90.0, -180.0).is_ok());
        assert!(validate_coordinates(90.1, 0.0).is_err());
        assert!(validate_coordinates(0.0, 180.1).is_err());
    }
}
