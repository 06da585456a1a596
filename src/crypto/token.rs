use base64::{Engine as _, engine::general_purpose};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// The size of a role token in bytes.
const ROLE_TOKEN_SIZE: usize = 32;

/// Alphabet for the short pairing code. No `0`, `1`, `O` or `I`.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of the short pairing code.
pub const CODE_LEN: usize = 4;

/// Generates a new session identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generates a new random role token.
///
/// # Returns
///
/// A URL-safe base64-encoded token carrying 256 bits from the OS RNG.
pub fn new_token() -> String {
    let mut token = [0u8; ROLE_TOKEN_SIZE];
    OsRng.fill_bytes(&mut token);

    general_purpose::URL_SAFE_NO_PAD.encode(token)
}

/// Generates a short pairing code.
///
/// Uniqueness is not guaranteed here; the session store checks its code index
/// and draws again on collision.
pub fn new_code() -> String {
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[OsRng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Normalises user-entered codes (`" ab3k "` → `"AB3K"`).
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Compares a presented token against the expected one in constant time.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}
