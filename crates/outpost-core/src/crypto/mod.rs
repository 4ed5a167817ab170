//! Crypto primitives facade.
//!
//! A thin surface over the `boring` SSL bindings covering exactly what the
//! transport needs: digests, HMAC-SHA1, RSA, X.509 certificates, CSRs,
//! AES-128-CBC, and the CSPRNG. Decode/verify/decrypt failures are reported
//! through [`CryptoError`] without exposing partial state.

mod aes;
mod cert;
mod digest;
mod hmac;
mod rand;
mod rsa;

use std::sync::Once;

pub use aes::{decrypt as aes_decrypt, encrypt as aes_encrypt, AES_BLOCK_SIZE, AES_KEY_SIZE};
pub use cert::{Certificate, CsrBuilder};
pub use digest::{hash, Digest, DigestAlgorithm};
pub use hmac::HmacSha1;
pub use rand::{fill_random, rand_bytes, rand_u64};
pub use rsa::{RsaKey, RSA_KEY_BITS};

/// Errors from the crypto facade.
///
/// Callers treat any error as "the operation failed"; the variants exist
/// for logging only.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Failure reported by the underlying SSL library.
    #[error("crypto backend error: {0}")]
    Backend(#[from] boring::error::ErrorStack),

    /// A caller-supplied value had the wrong shape.
    #[error("{0}")]
    InvalidInput(&'static str),
}

/// Result alias for facade operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Process-wide crypto initialisation.
///
/// Must be called once before any thread is spawned. Subsequent calls are
/// no-ops. The probe draw forces the backend's lazy library setup and
/// verifies the CSPRNG is functional.
pub fn init() -> CryptoResult<()> {
    static INIT: Once = Once::new();
    let mut result = Ok(());
    INIT.call_once(|| {
        let mut probe = [0u8; 16];
        result = rand::fill_random(&mut probe);
    });
    result
}

/// Constant-time equality for MACs and digests.
///
/// Length is not secret; contents are compared without early exit.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Lowercase hex rendering of a byte string.
#[must_use]
pub fn hex_lower(data: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        // Writing to a String cannot fail.
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Parses a hex string produced by [`hex_lower`]. Returns `None` on odd
/// length or non-hex characters.
#[must_use]
pub fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push((hi * 16 + lo) as u8);
    }
    Some(out)
}
