//! Record Decoding
//!
//! Keys and values coming off derived streams are not guaranteed to be
//! clean. Decoding here never fails hard: keys fall back to a sentinel,
//! values fall back through progressively looser interpretations.

use serde_json::Value;

/// Key used when a record key is missing or has no printable content
pub const UNKNOWN_KEY: &str = "unknown";

/// Decode a record key into printable text.
///
/// Embedded NULs and other control characters are stripped. Keys that are
/// absent or empty after stripping decode to [`UNKNOWN_KEY`].
pub fn decode_key(raw: Option<&[u8]>) -> String {
    let Some(raw) = raw else {
        return UNKNOWN_KEY.to_string();
    };

    let text = String::from_utf8_lossy(raw);
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() && *c != char::REPLACEMENT_CHARACTER)
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        UNKNOWN_KEY.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Decode a record value as JSON.
///
/// Tried in order: strict UTF-8 JSON, JSON after replacing invalid UTF-8
/// sequences, JSON after reading the bytes as Latin-1, and finally the raw
/// text as a JSON string. Returns `None` only for empty payloads.
pub fn decode_value(raw: &[u8]) -> Option<Value> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }

    if let Ok(value) = serde_json::from_slice::<Value>(raw) {
        return Some(value);
    }

    let lossy = String::from_utf8_lossy(raw);
    if let Ok(value) = serde_json::from_str::<Value>(&lossy) {
        tracing::debug!("Decoded record value after replacing invalid UTF-8");
        return Some(value);
    }

    let latin1: String = raw.iter().map(|&b| b as char).collect();
    if let Ok(value) = serde_json::from_str::<Value>(&latin1) {
        tracing::debug!("Decoded record value as Latin-1");
        return Some(value);
    }

    tracing::debug!("Record value is not JSON, forwarding raw text");
    let text: String = lossy.chars().filter(|c| *c != '\0').collect();
    Some(Value::String(text.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_key_plain() {
        assert_eq!(decode_key(Some(b"IVAC")), "IVAC");
    }

    #[test]
    fn test_decode_key_strips_nul_and_control() {
        assert_eq!(decode_key(Some(b"\0\0IVAC\x01\n")), "IVAC");
        assert_eq!(decode_key(Some(b"DUST\0TRAK")), "DUSTTRAK");
    }

    #[test]
    fn test_decode_key_fallback() {
        assert_eq!(decode_key(None), UNKNOWN_KEY);
        assert_eq!(decode_key(Some(b"\0\x02")), UNKNOWN_KEY);
        assert_eq!(decode_key(Some(&[0xff, 0xfe])), UNKNOWN_KEY);
    }

    #[test]
    fn test_decode_value_strict_json() {
        let value = decode_value(br#"{"ID":"Tool1","VALUE":"ON"}"#).unwrap();
        assert_eq!(value, json!({"ID": "Tool1", "VALUE": "ON"}));
    }

    #[test]
    fn test_decode_value_invalid_utf8_inside_string() {
        let mut raw = br#"{"ID":"Tool"#.to_vec();
        raw.push(0xe9);
        raw.extend_from_slice(br#"","VALUE":"ON"}"#);

        let value = decode_value(&raw).unwrap();
        assert_eq!(value["VALUE"], "ON");
        assert!(value["ID"].as_str().unwrap().starts_with("Tool"));
    }

    #[test]
    fn test_decode_value_raw_text_fallback() {
        let value = decode_value(b"not json at all").unwrap();
        assert_eq!(value, Value::String("not json at all".to_string()));
    }

    #[test]
    fn test_decode_value_empty_payload() {
        assert!(decode_value(b"").is_none());
        assert!(decode_value(b"   \n").is_none());
    }
}
