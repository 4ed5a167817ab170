//! RSA keys: generation, PEM round-trip, signing, and OAEP decryption.

use boring::hash::MessageDigest;
use boring::pkey::{PKey, Private};
use boring::rsa::{Padding, Rsa};
use boring::sign::Signer;

use super::{CryptoError, CryptoResult};

/// Key length for generated keys.
pub const RSA_KEY_BITS: u32 = 2048;

/// An RSA private key (with its public half).
#[derive(Clone)]
pub struct RsaKey {
    pkey: PKey<Private>,
}

impl RsaKey {
    /// Generates a fresh 2048-bit key with public exponent 65537.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn generate() -> CryptoResult<Self> {
        let rsa = Rsa::generate(RSA_KEY_BITS)?;
        Ok(Self {
            pkey: PKey::from_rsa(rsa)?,
        })
    }

    /// Parses a PEM-encoded private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM does not contain a usable RSA key.
    pub fn from_pem(pem: &[u8]) -> CryptoResult<Self> {
        let rsa = Rsa::private_key_from_pem(pem)?;
        Ok(Self {
            pkey: PKey::from_rsa(rsa)?,
        })
    }

    /// Serialises the private key as PEM.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_pem(&self) -> CryptoResult<String> {
        let pem = self.pkey.rsa()?.private_key_to_pem()?;
        String::from_utf8(pem).map_err(|_| CryptoError::InvalidInput("key PEM is not UTF-8"))
    }

    /// Returns the public modulus in big-endian MPI form.
    ///
    /// The MPI form is a 4-byte big-endian length followed by the magnitude,
    /// with one leading zero byte when the most significant bit is set. Used
    /// only for client-id derivation, where the exact byte layout matters.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to expose the modulus.
    pub fn public_key_n_mpi(&self) -> CryptoResult<Vec<u8>> {
        let rsa = self.pkey.rsa()?;
        Ok(mpi_encode(&rsa.n().to_vec()))
    }

    /// Signs `data` with RSA-PKCS#1 v1.5 over SHA-256.
    ///
    /// # Errors
    ///
    /// Returns an error if the signing operation fails.
    pub fn sign_sha256(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }

    /// Decrypts an RSA-OAEP ciphertext with the private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the ciphertext is not a valid OAEP block for
    /// this key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let rsa = self.pkey.rsa()?;
        let mut out = vec![0u8; rsa.size() as usize];
        let written = rsa.private_decrypt(ciphertext, &mut out, Padding::PKCS1_OAEP)?;
        out.truncate(written);
        Ok(out)
    }

    pub(crate) fn pkey(&self) -> &PKey<Private> {
        &self.pkey
    }
}

impl std::fmt::Debug for RsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("RsaKey(..)")
    }
}

/// Encodes a big-endian magnitude in OpenSSL MPI form.
fn mpi_encode(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let mag = &magnitude[start..];
    let pad = mag.first().is_some_and(|&b| b & 0x80 != 0);

    let len = mag.len() + usize::from(pad);
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&u32::try_from(len).unwrap_or(u32::MAX).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(mag);
    out
}
