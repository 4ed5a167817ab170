//! X.509 certificates and certificate signing requests.

use boring::hash::MessageDigest;
use boring::rsa::Padding;
use boring::sign::Verifier;
use boring::x509::{X509, X509NameBuilder, X509ReqBuilder};

use super::{CryptoError, CryptoResult, RsaKey};

/// OAEP overhead: usable plaintext is bounded by `keysize - 41` bytes.
const OAEP_OVERHEAD: usize = 41;

/// An X.509 certificate carrying an RSA public key.
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
}

impl Certificate {
    /// Parses a PEM-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM does not contain a certificate.
    pub fn from_pem(pem: &[u8]) -> CryptoResult<Self> {
        Ok(Self {
            x509: X509::from_pem(pem)?,
        })
    }

    /// Serialises the certificate as PEM.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_pem(&self) -> CryptoResult<String> {
        let pem = self.x509.to_pem()?;
        String::from_utf8(pem).map_err(|_| CryptoError::InvalidInput("certificate PEM is not UTF-8"))
    }

    /// Checks that `candidate` is signed by this certificate's key.
    ///
    /// # Errors
    ///
    /// Returns an error if the public key cannot be extracted or the
    /// verification primitive fails outright.
    pub fn verify(&self, candidate: &Certificate) -> CryptoResult<bool> {
        let key = self.x509.public_key()?;
        Ok(candidate.x509.verify(&key)?)
    }

    /// RSA-OAEP-encrypts `data` to this certificate's public key.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` exceeds `keysize - 41` bytes or the
    /// backend fails.
    pub fn encrypt(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let rsa = self.x509.public_key()?.rsa()?;
        let size = rsa.size() as usize;
        if data.len() + OAEP_OVERHEAD >= size {
            return Err(CryptoError::InvalidInput(
                "plaintext too large for RSA-OAEP block",
            ));
        }
        let mut out = vec![0u8; size];
        let written = rsa.public_encrypt(data, &mut out, Padding::PKCS1_OAEP)?;
        out.truncate(written);
        Ok(out)
    }

    /// Returns the certificate serial number as a decimal integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the serial does not fit in a `u64`.
    pub fn serial_number(&self) -> CryptoResult<u64> {
        let bn = self.x509.serial_number().to_bn()?;
        let dec = bn.to_dec_str()?;
        dec.parse::<u64>()
            .map_err(|_| CryptoError::InvalidInput("certificate serial does not fit in u64"))
    }

    /// Verifies an RSA-PKCS#1 SHA-256 signature with this certificate's key.
    ///
    /// # Errors
    ///
    /// Returns an error if the public key cannot be used; a well-formed but
    /// wrong signature yields `Ok(false)`.
    pub fn verify_sha256(&self, data: &[u8], signature: &[u8]) -> CryptoResult<bool> {
        let key = self.x509.public_key()?;
        let mut verifier = Verifier::new(MessageDigest::sha256(), &key)?;
        verifier.update(data)?;
        Ok(verifier.verify(signature).unwrap_or(false))
    }

    /// Returns the subject common name, if one is present.
    #[must_use]
    pub fn subject_common_name(&self) -> Option<String> {
        self.x509
            .subject_name()
            .entries_by_nid(boring::nid::Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|name| name.to_string())
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("subject_cn", &self.subject_common_name())
            .finish()
    }
}

/// Builder for a certificate signing request.
///
/// The enrolment CSR sets the client id as subject CN and is signed with
/// the client key over SHA-1, matching the server's expectations.
pub struct CsrBuilder {
    inner: X509ReqBuilder,
}

impl CsrBuilder {
    /// Starts an empty request.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot allocate a request.
    pub fn new() -> CryptoResult<Self> {
        Ok(Self {
            inner: X509ReqBuilder::new()?,
        })
    }

    /// Sets the public key being certified.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be attached.
    pub fn set_public_key(&mut self, key: &RsaKey) -> CryptoResult<()> {
        self.inner.set_pubkey(key.pkey())?;
        Ok(())
    }

    /// Sets the subject to a single common name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name cannot be built.
    pub fn set_subject(&mut self, common_name: &str) -> CryptoResult<()> {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", common_name)?;
        self.inner.set_subject_name(&name.build())?;
        Ok(())
    }

    /// Signs the request with the given key (SHA-1 digest).
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn sign(&mut self, key: &RsaKey) -> CryptoResult<()> {
        self.inner.sign(key.pkey(), MessageDigest::sha1())?;
        Ok(())
    }

    /// Finalises the request and returns it as PEM.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_pem(self) -> CryptoResult<String> {
        let pem = self.inner.build().to_pem()?;
        String::from_utf8(pem).map_err(|_| CryptoError::InvalidInput("CSR PEM is not UTF-8"))
    }
}
