//! CSPRNG access.

use super::CryptoResult;

/// Fills the buffer with cryptographically secure random bytes.
///
/// # Errors
///
/// Returns an error if the backend CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> CryptoResult<()> {
    boring::rand::rand_bytes(buf)?;
    Ok(())
}

/// Returns `n` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns an error if the backend CSPRNG fails.
pub fn rand_bytes(n: usize) -> CryptoResult<Vec<u8>> {
    let mut buf = vec![0u8; n];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Returns a uniformly random `u64`.
///
/// # Errors
///
/// Returns an error if the backend CSPRNG fails.
pub fn rand_u64() -> CryptoResult<u64> {
    let mut buf = [0u8; 8];
    fill_random(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}
