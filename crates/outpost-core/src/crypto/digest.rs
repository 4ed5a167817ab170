//! Incremental and one-shot message digests.

use boring::hash::{Hasher, MessageDigest};

use super::CryptoResult;

/// Digest algorithms exposed by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// MD5 (legacy fingerprint field only).
    Md5,
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
}

impl DigestAlgorithm {
    fn backend(self) -> MessageDigest {
        match self {
            Self::Md5 => MessageDigest::md5(),
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha256 => MessageDigest::sha256(),
        }
    }
}

/// An incremental digest computation.
pub struct Digest {
    hasher: Hasher,
}

impl Digest {
    /// Starts a new digest of the given algorithm.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot allocate a hasher.
    pub fn new(algorithm: DigestAlgorithm) -> CryptoResult<Self> {
        Ok(Self {
            hasher: Hasher::new(algorithm.backend())?,
        })
    }

    /// Feeds more data into the digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the update.
    pub fn update(&mut self, data: &[u8]) -> CryptoResult<()> {
        self.hasher.update(data)?;
        Ok(())
    }

    /// Finalises the digest and returns the raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to finalise.
    pub fn finish(mut self) -> CryptoResult<Vec<u8>> {
        Ok(self.hasher.finish()?.to_vec())
    }
}

/// One-shot digest of a byte string.
///
/// # Errors
///
/// Returns an error if the backend fails.
pub fn hash(algorithm: DigestAlgorithm, data: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut digest = Digest::new(algorithm)?;
    digest.update(data)?;
    digest.finish()
}
