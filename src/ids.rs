//! Identifier generation and time helpers.
//!
//! Room codes are `HIVE-XXXXXX` drawn from a 31-character alphabet with the
//! ambiguous glyphs (I, L, O, 0, 1) removed. Device ids are 16-character
//! URL-safe strings minted fresh per agent session.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use std::time::{SystemTime, UNIX_EPOCH};

/// Ambiguity-free alphabet for room codes.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

const ROOM_CODE_PREFIX: &str = "HIVE-";
const ROOM_CODE_SUFFIX_LEN: usize = 6;

/// Generate a fresh room code, e.g. `HIVE-K7QMX4`.
pub fn generate_room_code() -> String {
    let mut code = String::with_capacity(ROOM_CODE_PREFIX.len() + ROOM_CODE_SUFFIX_LEN);
    code.push_str(ROOM_CODE_PREFIX);
    for _ in 0..ROOM_CODE_SUFFIX_LEN {
        let idx = OsRng.gen_range(0..ROOM_CODE_ALPHABET.len());
        code.push(ROOM_CODE_ALPHABET[idx] as char);
    }
    code
}

/// Strict validation: exactly `HIVE-` followed by six alphabet characters.
pub fn is_valid_room_code(code: &str) -> bool {
    let Some(suffix) = code.strip_prefix(ROOM_CODE_PREFIX) else {
        return false;
    };
    suffix.len() == ROOM_CODE_SUFFIX_LEN
        && suffix.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b))
}

/// Generate a 16-character URL-safe device id (12 random bytes, base64url).
pub fn generate_device_id() -> String {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Current wall-clock time in integer milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Render a past timestamp as a coarse relative age, e.g. `3m ago`.
pub fn format_relative(ts_ms: u64) -> String {
    let now = now_ms();
    let delta_s = now.saturating_sub(ts_ms) / 1000;
    match delta_s {
        0..=4 => "just now".to_string(),
        5..=59 => format!("{delta_s}s ago"),
        60..=3599 => format!("{}m ago", delta_s / 60),
        3600..=86_399 => format!("{}h ago", delta_s / 3600),
        _ => format!("{}d ago", delta_s / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_room_code_shape() {
        for _ in 0..100 {
            let code = generate_room_code();
            assert_eq!(code.len(), 11);
            assert!(code.starts_with("HIVE-"));
            assert!(is_valid_room_code(&code), "generated code invalid: {code}");
        }
    }

    #[test]
    fn test_room_code_rejects_ambiguous_glyphs() {
        assert!(!is_valid_room_code("HIVE-ABC0DE")); // zero
        assert!(!is_valid_room_code("HIVE-ABC1DE")); // one
        assert!(!is_valid_room_code("HIVE-ABCIDE")); // I
        assert!(!is_valid_room_code("HIVE-ABCLDE")); // L
        assert!(!is_valid_room_code("HIVE-ABCODE")); // O
    }

    #[test]
    fn test_room_code_rejects_malformed() {
        assert!(!is_valid_room_code(""));
        assert!(!is_valid_room_code("HIVE-"));
        assert!(!is_valid_room_code("HIVE-ABCDE"));
        assert!(!is_valid_room_code("HIVE-ABCDEFG"));
        assert!(!is_valid_room_code("hive-ABCDEF")); // case-sensitive
        assert!(!is_valid_room_code("HIVE-abcdef"));
        assert!(!is_valid_room_code("WASP-ABCDEF"));
        assert!(!is_valid_room_code("XHIVE-ABCDEF"));
    }

    #[test]
    fn test_room_code_accepts_valid() {
        assert!(is_valid_room_code("HIVE-ABCDEF"));
        assert!(is_valid_room_code("HIVE-234567"));
        assert!(is_valid_room_code("HIVE-Z9Z9Z9"));
    }

    #[test]
    fn test_room_codes_are_distinct() {
        let codes: HashSet<String> = (0..50).map(|_| generate_room_code()).collect();
        // 31^6 ≈ 887M combinations; 50 draws colliding would be astronomically unlikely.
        assert_eq!(codes.len(), 50);
    }

    #[test]
    fn test_device_id_shape() {
        let id = generate_device_id();
        assert_eq!(id.len(), 16);
        assert!(id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
    }

    #[test]
    fn test_device_ids_are_distinct() {
        let ids: HashSet<String> = (0..50).map(|_| generate_device_id()).collect();
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn test_now_ms_advances() {
        let a = now_ms();
        assert!(a > 1_600_000_000_000); // after Sep 2020
    }

    #[test]
    fn test_format_relative() {
        let now = now_ms();
        assert_eq!(format_relative(now), "just now");
        assert_eq!(format_relative(now - 30_000), "30s ago");
        assert_eq!(format_relative(now - 120_000), "2m ago");
        assert_eq!(format_relative(now - 7_200_000), "2h ago");
        assert_eq!(format_relative(now - 172_800_000), "2d ago");
    }
}
