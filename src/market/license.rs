//! License key generation and normalisation.
//!
//! Keys are 25 characters drawn from an alphabet without look-alike glyphs
//! (no `0/O`, `1/I`), shown as five dash-separated groups of five.

use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const GROUPS: usize = 5;
const GROUP_LEN: usize = 5;

/// Number of attempts the store makes before giving up on a unique key.
pub const MAX_KEY_ATTEMPTS: usize = 5;

/// Generate a fresh license key such as `7KQ2M-XH9TR-...`.
pub fn generate_key() -> String {
    generate_key_with(&mut rand::rng())
}

pub fn generate_key_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut key = String::with_capacity(GROUPS * GROUP_LEN + GROUPS - 1);
    for group in 0..GROUPS {
        if group > 0 {
            key.push('-');
        }
        for _ in 0..GROUP_LEN {
            let idx = rng.random_range(0..ALPHABET.len());
            key.push(ALPHABET[idx] as char);
        }
    }
    key
}

/// Canonical form of a user-supplied key: upper-case, grouped with dashes.
///
/// Returns `None` when the input cannot be a key (wrong length or
/// characters outside the alphabet).
pub fn normalize_key(input: &str) -> Option<String> {
    let raw: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b'-')
        .map(|b| b.to_ascii_uppercase())
        .collect();
    if raw.len() != GROUPS * GROUP_LEN || !raw.iter().all(|b| ALPHABET.contains(b)) {
        return None;
    }
    let groups: Vec<&str> = raw
        .chunks(GROUP_LEN)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect();
    Some(groups.join("-"))
}
