//! Secure session layer.
//!
//! A session binds this client to one pinned server certificate: fresh
//! symmetric keys are drawn at construction, RSA-wrapped towards the server,
//! signed by the client key, and the two resulting blobs ride along with
//! every envelope for the life of the session. Payloads are AES-128-CBC
//! under a per-packet IV, integrity-protected by an HMAC-SHA1 over all
//! envelope fields, and freshness-checked through the echoed nonce.

mod nonce;

pub use nonce::NonceGenerator;

use prost::Message as _;
use tracing::debug;

use crate::compress;
use crate::crypto::{
    self, aes_decrypt, aes_encrypt, constant_time_eq, Certificate, CryptoError, HmacSha1, RsaKey,
};
use crate::wire::{
    CipherMetadata, CipherProperties, CompressionType, Envelope, HmacType, Message, MessageList,
    SignedMessageList, API_VERSION,
};

/// Cipher name pinned by the protocol.
const CIPHER_NAME: &str = "aes_128_cbc";

/// Session key, IV, and HMAC key length.
const KEY_SIZE: usize = 16;

/// Why an envelope failed to decode.
///
/// Callers treat every variant as "decode failed" and discard the
/// response; the distinctions exist for logging.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Structural decode failure.
    #[error("envelope decode failed: {0}")]
    Malformed(&'static str),

    /// The envelope MAC did not verify.
    #[error("envelope HMAC mismatch")]
    HmacMismatch,

    /// The inner nonce did not match the nonce that was sent.
    #[error("envelope nonce mismatch")]
    NonceMismatch,

    /// The cipher-properties signature did not verify.
    #[error("cipher signature rejected")]
    BadSignature,

    /// A crypto primitive failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Compression or decompression failed.
    #[error("compression failure: {0}")]
    Compression(#[from] std::io::Error),
}

/// Client-side state for talking to one server certificate.
pub struct SecureSession {
    cipher: CipherProperties,
    encrypted_cipher: Vec<u8>,
    encrypted_cipher_metadata: Vec<u8>,
    private_key: RsaKey,
    peer_certificate: Certificate,
}

impl SecureSession {
    /// Negotiates fresh session state towards `server_certificate`.
    ///
    /// Draws random session key, metadata IV, and HMAC key; RSA-OAEP-wraps
    /// the serialized cipher properties under the server's public key; signs
    /// them with the client key; and AES-wraps `{signature, client_id}`
    /// under the session key. Both blobs are cached and attached verbatim
    /// to every envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if any crypto primitive fails.
    pub fn new(
        client_id: &str,
        private_key: &RsaKey,
        server_certificate: &Certificate,
    ) -> Result<Self, SessionError> {
        let cipher = CipherProperties {
            name: CIPHER_NAME.to_string(),
            key: crypto::rand_bytes(KEY_SIZE)?,
            metadata_iv: crypto::rand_bytes(KEY_SIZE)?,
            hmac_key: crypto::rand_bytes(KEY_SIZE)?,
            hmac_type: HmacType::FullHmac as i32,
        };
        let serialized_cipher = cipher.encode_to_vec();

        let encrypted_cipher = server_certificate.encrypt(&serialized_cipher)?;

        let metadata = CipherMetadata {
            source: client_id.to_string(),
            signature: private_key.sign_sha256(&serialized_cipher)?,
        };
        let encrypted_cipher_metadata = aes_encrypt(
            &cipher.key,
            &cipher.metadata_iv,
            &metadata.encode_to_vec(),
        )?;

        Ok(Self {
            cipher,
            encrypted_cipher,
            encrypted_cipher_metadata,
            private_key: private_key.clone(),
            peer_certificate: server_certificate.clone(),
        })
    }

    /// Encodes a batch of messages into an envelope.
    ///
    /// The serialized message list ships deflated only when that is
    /// actually smaller. `queue_size` advertises the inbox depth to the
    /// server.
    ///
    /// # Errors
    ///
    /// Returns an error if a crypto primitive or the compressor fails.
    pub fn encode(
        &self,
        messages: &[Message],
        nonce: u64,
        queue_size: u64,
    ) -> Result<Vec<u8>, SessionError> {
        let list = MessageList {
            job: messages.to_vec(),
        };
        let raw = list.encode_to_vec();
        let deflated = compress::deflate(&raw)?;

        let (compression, body) = if deflated.len() < raw.len() {
            (CompressionType::ZCompression, deflated)
        } else {
            (CompressionType::Uncompressed, raw)
        };

        let signed = SignedMessageList {
            timestamp: nonce,
            compression: compression as i32,
            message_list: body,
        };

        let packet_iv = crypto::rand_bytes(KEY_SIZE)?;
        let encrypted = aes_encrypt(&self.cipher.key, &packet_iv, &signed.encode_to_vec())?;

        let full_hmac = full_hmac(
            &self.cipher.hmac_key,
            &encrypted,
            &self.encrypted_cipher,
            &self.encrypted_cipher_metadata,
            &packet_iv,
        )?;

        let envelope = Envelope {
            encrypted_cipher: self.encrypted_cipher.clone(),
            encrypted_cipher_metadata: self.encrypted_cipher_metadata.clone(),
            packet_iv,
            encrypted,
            full_hmac,
            api_version: API_VERSION,
            queue_size,
        };
        Ok(envelope.encode_to_vec())
    }

    /// Decodes an envelope addressed to this client.
    ///
    /// The response is accepted only if its inner nonce equals the nonce
    /// this client sent, and the cipher signature verifies against the
    /// pinned server certificate.
    ///
    /// # Errors
    ///
    /// Any verification or parse failure; the caller discards the response
    /// and treats the transport attempt as failed.
    pub fn decode(&self, data: &[u8], expected_nonce: u64) -> Result<Vec<Message>, SessionError> {
        decode_envelope(
            &self.private_key,
            Some(&self.peer_certificate),
            data,
            expected_nonce,
        )
    }
}

/// Decodes and verifies an envelope with an explicit key and optional
/// pinned peer.
///
/// When `peer` is `None`, the cipher signature cannot be attributed and is
/// not checked; the server front-end operates this way before enrolment
/// completes.
///
/// # Errors
///
/// Any verification or parse failure fails the decode as a whole; no
/// partial messages are delivered.
pub fn decode_envelope(
    private_key: &RsaKey,
    peer: Option<&Certificate>,
    data: &[u8],
    expected_nonce: u64,
) -> Result<Vec<Message>, SessionError> {
    let envelope =
        Envelope::decode(data).map_err(|_| SessionError::Malformed("envelope parse"))?;
    if envelope.api_version != API_VERSION {
        return Err(SessionError::Malformed("unsupported api version"));
    }

    let serialized_cipher = private_key
        .decrypt(&envelope.encrypted_cipher)
        .map_err(|_| SessionError::Malformed("cipher unwrap"))?;
    let cipher = CipherProperties::decode(serialized_cipher.as_slice())
        .map_err(|_| SessionError::Malformed("cipher properties parse"))?;

    if cipher.key.len() != KEY_SIZE
        || cipher.metadata_iv.len() != KEY_SIZE
        || cipher.hmac_key.len() != KEY_SIZE
    {
        return Err(SessionError::Malformed("cipher key sizes"));
    }
    if cipher.hmac_type != HmacType::FullHmac as i32 {
        return Err(SessionError::Malformed("unsupported hmac type"));
    }

    let expected_hmac = full_hmac(
        &cipher.hmac_key,
        &envelope.encrypted,
        &envelope.encrypted_cipher,
        &envelope.encrypted_cipher_metadata,
        &envelope.packet_iv,
    )?;
    if !constant_time_eq(&expected_hmac, &envelope.full_hmac) {
        return Err(SessionError::HmacMismatch);
    }

    let metadata_plain = aes_decrypt(
        &cipher.key,
        &cipher.metadata_iv,
        &envelope.encrypted_cipher_metadata,
    )
    .map_err(|_| SessionError::Malformed("cipher metadata unwrap"))?;
    let metadata = CipherMetadata::decode(metadata_plain.as_slice())
        .map_err(|_| SessionError::Malformed("cipher metadata parse"))?;

    if let Some(peer) = peer {
        if metadata.signature.is_empty()
            || !peer.verify_sha256(&serialized_cipher, &metadata.signature)?
        {
            return Err(SessionError::BadSignature);
        }
    }

    let plain = aes_decrypt(&cipher.key, &envelope.packet_iv, &envelope.encrypted)
        .map_err(|_| SessionError::Malformed("payload decrypt"))?;
    let signed = SignedMessageList::decode(plain.as_slice())
        .map_err(|_| SessionError::Malformed("signed list parse"))?;

    if signed.timestamp != expected_nonce {
        debug!(
            got = signed.timestamp,
            expected = expected_nonce,
            "stale envelope rejected"
        );
        return Err(SessionError::NonceMismatch);
    }

    let raw = match CompressionType::try_from(signed.compression) {
        Ok(CompressionType::Uncompressed) => signed.message_list,
        Ok(CompressionType::ZCompression) => compress::inflate(&signed.message_list)?,
        Err(_) => return Err(SessionError::Malformed("unknown compression scheme")),
    };

    let list = MessageList::decode(raw.as_slice())
        .map_err(|_| SessionError::Malformed("message list parse"))?;
    Ok(list.job)
}

/// The full HMAC over every envelope field, in protocol order.
fn full_hmac(
    hmac_key: &[u8],
    encrypted: &[u8],
    encrypted_cipher: &[u8],
    encrypted_cipher_metadata: &[u8],
    packet_iv: &[u8],
) -> Result<Vec<u8>, SessionError> {
    let mut hmac = HmacSha1::new(hmac_key)?;
    hmac.update(encrypted);
    hmac.update(encrypted_cipher);
    hmac.update(encrypted_cipher_metadata);
    hmac.update(packet_iv);
    hmac.update(&API_VERSION.to_le_bytes());
    Ok(hmac.finish()?)
}
