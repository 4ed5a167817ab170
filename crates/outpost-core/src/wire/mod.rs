//! Wire records exchanged with the control server.
//!
//! Everything on the wire is protobuf: the outer [`Envelope`], the
//! encrypted [`SignedMessageList`] / [`MessageList`] it carries, the cipher
//! negotiation records, and the action payloads referenced by
//! `args_rdf_name`. Payload bytes inside a [`Message`] stay opaque to the
//! transport; the [`Payload`] trait ties type tags to concrete types at the
//! dispatch boundary.

/// Protocol version carried in every envelope.
pub const API_VERSION: u32 = 3;

/// Session id of the enrolment side-channel.
pub const ENROLMENT_SESSION_ID: &str = "aff4:/flows/CA:Enrol";

/// Session id for resource telemetry reports.
pub const STATS_SESSION_ID: &str = "F:Stats";

/// Session id for forwarded supervisor messages.
pub const NANNY_SESSION_ID: &str = "F:NannyMessage";

/// Session id of the periodic scheduled-work probe.
pub const FOREMAN_SESSION_ID: &str = "F:Foreman";

/// One request or response travelling between client and server.
///
/// Messages are value objects: cheap to copy and immutable once queued.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    /// Opaque name of the server-side flow this message belongs to.
    #[prost(string, tag = "1")]
    pub session_id: String,

    /// Request this message belongs to (server-assigned).
    #[prost(uint64, tag = "2")]
    pub request_id: u64,

    /// Response sequence within the request, starting at 1.
    #[prost(uint64, tag = "3")]
    pub response_id: u64,

    /// Scheduling handle the server uses to dequeue the request.
    #[prost(uint64, tag = "4")]
    pub task_id: u64,

    /// Action name, e.g. `"Grep"` or `"GetClientInfo"`.
    #[prost(string, tag = "5")]
    pub name: String,

    /// Type tag naming the payload carried in `args`.
    #[prost(string, tag = "6")]
    pub args_rdf_name: String,

    /// Serialized payload bytes.
    #[prost(bytes = "vec", tag = "7")]
    pub args: Vec<u8>,

    /// Message kind.
    #[prost(enumeration = "MessageType", tag = "8")]
    pub r#type: i32,

    /// Queue priority tag.
    #[prost(enumeration = "Priority", tag = "9")]
    pub priority: i32,
}

impl Message {
    /// Payload size used for queue accounting.
    #[must_use]
    pub fn args_size(&self) -> usize {
        self.args.len()
    }

    /// Returns the decoded message kind, defaulting unknown values to
    /// `MESSAGE`.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        MessageType::try_from(self.r#type).unwrap_or(MessageType::Message)
    }

    /// True for the empty sentinel used to unstick blocked queue readers.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.name.is_empty() && self.session_id.is_empty() && self.args.is_empty()
    }

    /// Builds a response inheriting the request's routing identifiers.
    #[must_use]
    pub fn reply(
        request: &Message,
        response_id: u64,
        kind: MessageType,
        args_rdf_name: &str,
        args: Vec<u8>,
    ) -> Self {
        Self {
            session_id: request.session_id.clone(),
            request_id: request.request_id,
            response_id,
            task_id: request.task_id,
            name: request.name.clone(),
            args_rdf_name: args_rdf_name.to_string(),
            args,
            r#type: kind as i32,
            priority: request.priority,
        }
    }
}

/// Message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    /// Ordinary data-bearing message.
    Message = 0,
    /// Terminal status reply resolving a request.
    Status = 1,
    /// Iterator state handed back to the server.
    Iterator = 2,
}

/// Queue priority tags. Priority messages jump to the head of the outbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Priority {
    /// Default FIFO ordering.
    Normal = 0,
    /// Head-of-queue insertion, exempt from bounds.
    Priority = 1,
}

/// Outcome of a processed request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    /// Status code.
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub status: i32,

    /// Human-readable error description; empty on success.
    #[prost(string, tag = "2")]
    pub error_message: String,
}

impl Status {
    /// A success status.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: StatusCode::Ok as i32,
            error_message: String::new(),
        }
    }

    /// A generic error status with a message.
    #[must_use]
    pub fn generic_error(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GenericError as i32,
            error_message: message.into(),
        }
    }

    /// Returns the decoded status code.
    #[must_use]
    pub fn code(&self) -> StatusCode {
        StatusCode::try_from(self.status).unwrap_or(StatusCode::GenericError)
    }
}

/// Status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    /// The request completed.
    Ok = 0,
    /// The request failed; `error_message` explains why.
    GenericError = 1,
}

/// A batch of messages as carried inside one envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageList {
    /// The messages, in order.
    #[prost(message, repeated, tag = "1")]
    pub job: Vec<Message>,
}

/// Compression applied to the serialized [`MessageList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CompressionType {
    /// Raw serialization.
    Uncompressed = 0,
    /// zlib-deflated serialization.
    ZCompression = 1,
}

/// The freshness-stamped wrapper around a message list.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedMessageList {
    /// Monotone microsecond nonce echoed back by the responder.
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,

    /// Compression applied to `message_list`.
    #[prost(enumeration = "CompressionType", tag = "2")]
    pub compression: i32,

    /// Raw or deflated serialization of a [`MessageList`].
    #[prost(bytes = "vec", tag = "3")]
    pub message_list: Vec<u8>,
}

/// HMAC coverage declared by the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HmacType {
    /// MAC over the encrypted payload only (legacy peers).
    SimpleHmac = 0,
    /// MAC over every envelope field.
    FullHmac = 1,
}

/// Symmetric session state negotiated per server certificate.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CipherProperties {
    /// Cipher name; always `aes_128_cbc`.
    #[prost(string, tag = "1")]
    pub name: String,

    /// 16-byte session key.
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,

    /// 16-byte IV protecting the cipher metadata.
    #[prost(bytes = "vec", tag = "3")]
    pub metadata_iv: Vec<u8>,

    /// 16-byte HMAC key.
    #[prost(bytes = "vec", tag = "4")]
    pub hmac_key: Vec<u8>,

    /// HMAC coverage.
    #[prost(enumeration = "HmacType", tag = "5")]
    pub hmac_type: i32,
}

/// Sender identity bound to the cipher properties.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CipherMetadata {
    /// Sender identifier (the client id, or the server CN).
    #[prost(string, tag = "1")]
    pub source: String,

    /// RSA-PKCS#1 signature over SHA-256 of the serialized cipher
    /// properties.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

/// The outer framing structure carried over one HTTP transaction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// RSA-OAEP-encrypted [`CipherProperties`].
    #[prost(bytes = "vec", tag = "1")]
    pub encrypted_cipher: Vec<u8>,

    /// AES-encrypted [`CipherMetadata`] under `(key, metadata_iv)`.
    #[prost(bytes = "vec", tag = "2")]
    pub encrypted_cipher_metadata: Vec<u8>,

    /// Random per-packet IV for the payload.
    #[prost(bytes = "vec", tag = "3")]
    pub packet_iv: Vec<u8>,

    /// AES-encrypted serialized [`SignedMessageList`].
    #[prost(bytes = "vec", tag = "4")]
    pub encrypted: Vec<u8>,

    /// HMAC-SHA1 over `encrypted || encrypted_cipher ||
    /// encrypted_cipher_metadata || packet_iv || api_version_le32`.
    #[prost(bytes = "vec", tag = "5")]
    pub full_hmac: Vec<u8>,

    /// Protocol version; always 3.
    #[prost(uint32, tag = "6")]
    pub api_version: u32,

    /// Sender's current inbox depth, used by the server to pace the
    /// client.
    #[prost(uint64, tag = "7")]
    pub queue_size: u64,
}

/// Certificate material exchanged during enrolment.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CertificateBlob {
    /// What the PEM contains.
    #[prost(enumeration = "CertificateType", tag = "1")]
    pub r#type: i32,

    /// PEM-encoded material.
    #[prost(string, tag = "2")]
    pub pem: String,
}

/// Kinds of certificate material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CertificateType {
    /// A certificate signing request.
    Csr = 0,
    /// A signed certificate.
    Crt = 1,
}

/// Periodic resource usage report.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientStats {
    /// User-mode CPU consumption over the sample window, in percent.
    #[prost(float, tag = "1")]
    pub user_cpu_percent: f32,

    /// Kernel-mode CPU consumption over the sample window, in percent.
    #[prost(float, tag = "2")]
    pub system_cpu_percent: f32,

    /// Resident set size in bytes.
    #[prost(uint64, tag = "3")]
    pub rss_bytes: u64,

    /// Sample time, microseconds since the epoch.
    #[prost(uint64, tag = "4")]
    pub timestamp_us: u64,
}

/// A free-form string payload (supervisor messages and alerts).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataBlob {
    /// The carried string.
    #[prost(string, tag = "1")]
    pub string: String,
}

/// Literal search request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GrepSpec {
    /// File to search.
    #[prost(string, tag = "1")]
    pub path: String,

    /// Literal byte sequence to find.
    #[prost(bytes = "vec", tag = "2")]
    pub literal: Vec<u8>,

    /// Context bytes to include before each hit.
    #[prost(uint32, tag = "3")]
    pub bytes_before: u32,

    /// Context bytes to include after each hit.
    #[prost(uint32, tag = "4")]
    pub bytes_after: u32,
}

/// A located region of a file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BufferReference {
    /// Offset of the region from the start of the file.
    #[prost(uint64, tag = "1")]
    pub offset: u64,

    /// Region length in bytes.
    #[prost(uint64, tag = "2")]
    pub length: u64,

    /// The region's bytes.
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

/// Fingerprinting request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FingerprintRequest {
    /// File to fingerprint.
    #[prost(string, tag = "1")]
    pub path: String,
}

/// File content digests, lowercase hex.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FingerprintResponse {
    #[prost(string, tag = "1")]
    pub md5: String,

    #[prost(string, tag = "2")]
    pub sha1: String,

    #[prost(string, tag = "3")]
    pub sha256: String,
}

/// Stat request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatRequest {
    /// Path to stat (symlinks are not followed).
    #[prost(string, tag = "1")]
    pub path: String,
}

/// File metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatEntry {
    #[prost(uint32, tag = "1")]
    pub st_mode: u32,

    #[prost(uint64, tag = "2")]
    pub st_size: u64,

    #[prost(int64, tag = "3")]
    pub st_mtime_s: i64,

    #[prost(int64, tag = "4")]
    pub st_atime_s: i64,

    #[prost(int64, tag = "5")]
    pub st_ctime_s: i64,

    #[prost(uint32, tag = "6")]
    pub st_uid: u32,

    #[prost(uint32, tag = "7")]
    pub st_gid: u32,
}

/// Static client description.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientInformation {
    #[prost(string, tag = "1")]
    pub client_name: String,

    #[prost(string, tag = "2")]
    pub client_version: String,

    #[prost(string, tag = "3")]
    pub build_time: String,
}

/// Binds a payload type to the type tag carried in `args_rdf_name`.
pub trait Payload: prost::Message + Default {
    /// The wire name of this payload type.
    const TYPE_NAME: &'static str;
}

macro_rules! impl_payload {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(impl Payload for $ty {
            const TYPE_NAME: &'static str = $name;
        })*
    };
}

impl_payload! {
    Status => "Status",
    CertificateBlob => "Certificate",
    ClientStats => "ClientStats",
    DataBlob => "DataBlob",
    GrepSpec => "GrepSpec",
    BufferReference => "BufferReference",
    FingerprintRequest => "FingerprintRequest",
    FingerprintResponse => "FingerprintResponse",
    StatRequest => "StatRequest",
    StatEntry => "StatEntry",
    ClientInformation => "ClientInformation",
}

#[cfg(test)]
mod tests {
    use prost::Message as _;

    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let message = Message {
            session_id: "aff4:/flows/W:1234".to_string(),
            request_id: 7,
            response_id: 1,
            task_id: 99,
            name: "Grep".to_string(),
            args_rdf_name: "GrepSpec".to_string(),
            args: vec![1, 2, 3],
            r#type: MessageType::Message as i32,
            priority: Priority::Normal as i32,
        };

        let bytes = message.encode_to_vec();
        let decoded = Message::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.message_type(), MessageType::Message);
    }

    #[test]
    fn test_reply_inherits_routing_ids() {
        let request = Message {
            session_id: "aff4:/flows/W:1".to_string(),
            request_id: 3,
            task_id: 17,
            name: "StatFile".to_string(),
            ..Default::default()
        };

        let reply = Message::reply(&request, 2, MessageType::Status, "Status", vec![]);
        assert_eq!(reply.session_id, request.session_id);
        assert_eq!(reply.request_id, 3);
        assert_eq!(reply.task_id, 17);
        assert_eq!(reply.response_id, 2);
        assert_eq!(reply.message_type(), MessageType::Status);
    }

    #[test]
    fn test_sentinel_detection() {
        assert!(Message::default().is_sentinel());
        let real = Message {
            name: "Grep".to_string(),
            ..Default::default()
        };
        assert!(!real.is_sentinel());
    }

    #[test]
    fn test_status_constructors() {
        assert_eq!(Status::ok().code(), StatusCode::Ok);
        let error = Status::generic_error("boom");
        assert_eq!(error.code(), StatusCode::GenericError);
        assert_eq!(error.error_message, "boom");
    }

    #[test]
    fn test_unknown_enum_value_defaults() {
        let message = Message {
            r#type: 42,
            ..Default::default()
        };
        assert_eq!(message.message_type(), MessageType::Message);
    }
}
