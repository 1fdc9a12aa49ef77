//! Random identifier and secret generation.
//!
//! All identifiers share the same recipe: a fixed prefix followed by N
//! characters drawn uniformly from a low-ambiguity alphabet. The prefixes
//! make values greppable and detectable by secret scanners; the alphabet
//! excludes visually confusable characters (`0`/`O`/`o`, `1`/`l`/`I`).
//!
//! Randomness comes from the operating system CSPRNG. A failing random
//! source is propagated, never papered over — a partial string is never
//! returned.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::Result;

/// Characters usable in generated identifiers. No `0 O o 1 l I`.
const ALPHABET: &[u8] = b"23456789abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

const CLIENT_ID_PREFIX: &str = "client-";
const CLIENT_SECRET_PREFIX: &str = "secret-";
const CODE_PREFIX: &str = "code-";

const CLIENT_ID_LENGTH: usize = 10;
const CLIENT_SECRET_LENGTH: usize = 56;
const CODE_LENGTH: usize = 56;

/// Generate an opaque OAuth2 client identifier (`client-` + 10 chars).
pub fn generate_client_id() -> Result<String> {
    random_string(CLIENT_ID_PREFIX, CLIENT_ID_LENGTH)
}

/// Generate a client secret value (`secret-` + 56 chars).
pub fn generate_client_secret() -> Result<String> {
    random_string(CLIENT_SECRET_PREFIX, CLIENT_SECRET_LENGTH)
}

/// Generate an authorization code (`code-` + 56 chars).
pub fn generate_code() -> Result<String> {
    random_string(CODE_PREFIX, CODE_LENGTH)
}

/// Build `prefix` + `len` uniform characters from [`ALPHABET`].
///
/// Uses rejection sampling so the modulo step introduces no bias: bytes at
/// or above the largest multiple of the alphabet size are discarded.
fn random_string(prefix: &str, len: usize) -> Result<String> {
    let mut out = String::with_capacity(prefix.len() + len);
    out.push_str(prefix);

    let limit = 256 - (256 % ALPHABET.len());
    let mut buf = [0u8; 64];
    let mut remaining = len;
    while remaining > 0 {
        OsRng.try_fill_bytes(&mut buf)?;
        for &b in &buf {
            if (b as usize) < limit {
                out.push(ALPHABET[b as usize % ALPHABET.len()] as char);
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }
    }

    Ok(out)
}
