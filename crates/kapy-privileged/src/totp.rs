//! RFC 6238 TOTP with base32 secrets (Google Authenticator compatible).

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const B32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Generate a new base32 secret (20 random bytes, unpadded).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    b32_encode(&bytes)
}

fn b32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(B32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(B32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Decode a base32 secret, tolerating whitespace, lowercase, and padding.
pub fn b32_decode(secret: &str) -> Option<Vec<u8>> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let trimmed = normalized.trim_end_matches('=');
    if trimmed.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(trimmed.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for c in trimmed.bytes() {
        let value = B32_ALPHABET.iter().position(|&a| a == c)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    Some(out)
}

/// HOTP value for one counter.
fn hotp(key: &[u8], counter: u64, digits: u32) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let code = ((u32::from(digest[offset]) & 0x7f) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]))
        % 10u32.pow(digits);
    format!("{code:0width$}", width = digits as usize)
}

/// TOTP code for a base32 secret at `at_time` (Unix seconds).
pub fn totp_code(secret: &str, at_time: u64, period: u64, digits: u32) -> Option<String> {
    let key = b32_decode(secret)?;
    let counter = at_time / period.max(1);
    Some(hotp(&key, counter, digits))
}

/// Constant-time verification across ±`valid_window` periods of drift.
pub fn verify_totp(
    secret: &str,
    code: &str,
    now: u64,
    period: u64,
    digits: u32,
    valid_window: i64,
) -> bool {
    let value = code.trim();
    if value.len() != digits as usize || !value.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    for delta in -valid_window..=valid_window {
        let at = now as i64 + delta * period as i64;
        if at < 0 {
            continue;
        }
        if let Some(expected) = totp_code(secret, at as u64, period, digits) {
            if constant_time_eq(value.as_bytes(), expected.as_bytes()) {
                return true;
            }
        }
    }
    false
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// otpauth provisioning URI for authenticator apps.
pub fn otpauth_uri(secret: &str, issuer: &str, account: &str, period: u64, digits: u32) -> String {
    let label = format!("{}:{}", uri_escape(issuer), uri_escape(account));
    format!(
        "otpauth://totp/{label}?secret={secret}&issuer={}&period={period}&digits={digits}",
        uri_escape(issuer)
    )
}

fn uri_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B test secret ("12345678901234567890" in base32).
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn rfc6238_vectors_match() {
        // 8-digit reference values from RFC 6238, truncated usage is 6 digits.
        assert_eq!(totp_code(RFC_SECRET, 59, 30, 8).unwrap(), "94287082");
        assert_eq!(totp_code(RFC_SECRET, 1111111109, 30, 8).unwrap(), "07081804");
        assert_eq!(totp_code(RFC_SECRET, 1234567890, 30, 8).unwrap(), "89005924");
    }

    #[test]
    fn base32_round_trips() {
        let data = b"12345678901234567890";
        let encoded = b32_encode(data);
        assert_eq!(encoded, RFC_SECRET);
        assert_eq!(b32_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn decode_tolerates_lowercase_whitespace_and_padding() {
        let spaced = "gezd gnbv gy3t qojq gezd gnbv gy3t qojq====";
        assert_eq!(b32_decode(spaced).unwrap(), b"12345678901234567890");
        assert!(b32_decode("").is_none());
        assert!(b32_decode("!@#$").is_none());
    }

    #[test]
    fn verify_accepts_adjacent_window() {
        let now = 1_700_000_000u64;
        let prev = totp_code(RFC_SECRET, now - 30, 30, 6).unwrap();
        let curr = totp_code(RFC_SECRET, now, 30, 6).unwrap();
        assert!(verify_totp(RFC_SECRET, &curr, now, 30, 6, 1));
        assert!(verify_totp(RFC_SECRET, &prev, now, 30, 6, 1));
        assert!(!verify_totp(RFC_SECRET, "000000", now, 30, 6, 1) || curr == "000000");
    }

    #[test]
    fn verify_rejects_malformed_codes() {
        let now = 1_700_000_000u64;
        assert!(!verify_totp(RFC_SECRET, "12345", now, 30, 6, 1));
        assert!(!verify_totp(RFC_SECRET, "12345a", now, 30, 6, 1));
        assert!(!verify_totp(RFC_SECRET, "", now, 30, 6, 1));
    }

    #[test]
    fn generated_secret_is_decodable() {
        let secret = generate_secret();
        assert_eq!(b32_decode(&secret).unwrap().len(), 20);
    }

    #[test]
    fn otpauth_uri_escapes_label() {
        let uri = otpauth_uri("ABCD", "CLI Gateway", "ops-a:123", 30, 6);
        assert!(uri.starts_with("otpauth://totp/CLI%20Gateway:ops-a%3A123?"));
        assert!(uri.contains("secret=ABCD"));
        assert!(uri.contains("issuer=CLI%20Gateway"));
    }
}
