//! Session-id generation and validation.

use std::sync::OnceLock;

use rand::RngCore;
use regex::Regex;

fn session_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-f0-9]{8}$").unwrap())
}

/// Generate an 8-hex-char session id.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Validate a session id before it touches any path-adjacent code.
pub fn is_valid_session_id(id: &str) -> bool {
    session_id_re().is_match(id)
}
