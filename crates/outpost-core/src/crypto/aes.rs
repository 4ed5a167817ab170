//! AES-128-CBC with PKCS#7 padding.

use boring::symm::{Cipher, Crypter, Mode};

use super::{CryptoError, CryptoResult};

/// AES-128 key size in bytes.
pub const AES_KEY_SIZE: usize = 16;

/// AES block (and CBC IV) size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

fn run(mode: Mode, key: &[u8], iv: &[u8], data: &[u8]) -> CryptoResult<Vec<u8>> {
    if key.len() != AES_KEY_SIZE {
        return Err(CryptoError::InvalidInput("AES-128 key must be 16 bytes"));
    }
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::InvalidInput("AES-128-CBC IV must be 16 bytes"));
    }

    let cipher = Cipher::aes_128_cbc();
    let mut crypter = Crypter::new(cipher, mode, key, Some(iv))?;
    crypter.pad(true);

    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut written = crypter.update(data, &mut out)?;
    written += crypter.finalize(&mut out[written..])?;
    out.truncate(written);
    Ok(out)
}

/// Encrypts `plaintext` under `(key, iv)`.
///
/// # Errors
///
/// Returns an error on bad key/IV sizes or backend failure.
pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    run(Mode::Encrypt, key, iv, plaintext)
}

/// Decrypts `ciphertext` under `(key, iv)`.
///
/// # Errors
///
/// Returns an error on bad key/IV sizes, bad padding, or backend failure.
pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    run(Mode::Decrypt, key, iv, ciphertext)
}
