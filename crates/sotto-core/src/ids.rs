//! Identifiers and timestamps stamped onto relayed frames.

use chrono::{SecondsFormat, Utc};

/// Generate a random message ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn message_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Current UTC time as an RFC 3339 string with millisecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_hex_and_unique() {
        let a = message_id();
        let b = message_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn timestamps_parse_back() {
        let ts = timestamp_now();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(ts.ends_with('Z'));
    }
}
