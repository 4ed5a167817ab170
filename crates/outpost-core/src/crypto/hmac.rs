//! Keyed HMAC-SHA1 as used by the envelope integrity check.

use boring::hash::MessageDigest;
use boring::pkey::{PKey, Private};
use boring::sign::Signer;

use super::CryptoResult;

/// Incremental HMAC-SHA1 computation.
///
/// Input is buffered and signed on [`finish`](Self::finish); envelope-sized
/// inputs make the buffer cheap and keep the signer free of self-borrows.
pub struct HmacSha1 {
    key: PKey<Private>,
    data: Vec<u8>,
}

impl HmacSha1 {
    /// Creates an HMAC instance over the given key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the key.
    pub fn new(key: &[u8]) -> CryptoResult<Self> {
        Ok(Self {
            key: PKey::hmac(key)?,
            data: Vec::new(),
        })
    }

    /// Feeds more data into the MAC.
    pub fn update(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Finalises and returns the 20-byte MAC.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend signing operation fails.
    pub fn finish(&self) -> CryptoResult<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha1(), &self.key)?;
        signer.update(&self.data)?;
        Ok(signer.sign_to_vec()?)
    }
}
