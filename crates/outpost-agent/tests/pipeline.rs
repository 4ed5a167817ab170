//! End-to-end pipeline tests: requests travel inbox → dispatcher →
//! action → outbox, and each request resolves with exactly one terminal
//! status.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use outpost_agent::actions::builtin_actions;
use outpost_agent::comms::build_enrolment_message;
use outpost_agent::dispatcher::Dispatcher;
use outpost_core::config::ClientConfig;
use outpost_core::queue::MessageQueue;
use outpost_core::wire::{
    BufferReference, CertificateBlob, CertificateType, FingerprintRequest, FingerprintResponse,
    GrepSpec, Message, MessageType, Payload, Status, StatusCode, ENROLMENT_SESSION_ID,
};
use prost::Message as _;

const TEST_CA_PEM: &str = include_str!("../testdata/ca.pem");

const SENTENCE: &[u8] = b"The quick sly fox jumped over the lazy dogs.\n";

fn write_config(dir: &std::path::Path, writeback: bool) -> std::path::PathBuf {
    let mut text = String::from("control_url: https://control.example.com/control\n");
    if writeback {
        text.push_str(&format!(
            "writeback_filename: {}\n",
            dir.join("writeback.conf").display()
        ));
    }
    text.push_str(&format!("ca_cert_pem: {TEST_CA_PEM}"));
    let path = dir.join("client.conf");
    fs::write(&path, text).unwrap();
    path
}

struct Pipeline {
    inbox: Arc<MessageQueue>,
    outbox: Arc<MessageQueue>,
    handle: std::thread::JoinHandle<()>,
}

fn start_pipeline(config: Arc<ClientConfig>) -> Pipeline {
    let inbox = Arc::new(MessageQueue::new(100, 1_000_000));
    let outbox = Arc::new(MessageQueue::new(1_000, 10_000_000));

    let mut dispatcher = Dispatcher::new(
        Arc::clone(&inbox),
        Arc::clone(&outbox),
        config,
    );
    for action in builtin_actions() {
        dispatcher.register(action);
    }
    let handle = dispatcher.spawn();

    Pipeline {
        inbox,
        outbox,
        handle,
    }
}

impl Pipeline {
    /// Submits one request and collects its replies (terminated by the
    /// STATUS message).
    fn round_trip(&self, request: Message) -> Vec<Message> {
        self.inbox.enqueue(request);
        let mut replies = Vec::new();
        loop {
            let batch = self.outbox.dequeue(100, 10_000_000, true);
            for message in batch {
                let is_status = message.message_type() == MessageType::Status;
                replies.push(message);
                if is_status {
                    return replies;
                }
            }
        }
    }

    fn finish(self) {
        self.inbox.close();
        let _ = self.handle.join();
    }
}

fn request(name: &str, args_rdf_name: &str, args: Vec<u8>) -> Message {
    Message {
        session_id: "aff4:/flows/W:100".to_string(),
        request_id: 1,
        task_id: 7,
        name: name.to_string(),
        args_rdf_name: args_rdf_name.to_string(),
        args,
        ..Default::default()
    }
}

#[test]
fn test_grep_literal_single_hit() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("quick.txt");
    fs::write(&target, SENTENCE).unwrap();

    let config = Arc::new(ClientConfig::load(write_config(dir.path(), false)).unwrap());
    let pipeline = start_pipeline(config);

    let spec = GrepSpec {
        path: target.display().to_string(),
        literal: b"fox".to_vec(),
        bytes_before: 0,
        bytes_after: 0,
    };
    let replies = pipeline.round_trip(request("Grep", GrepSpec::TYPE_NAME, spec.encode_to_vec()));

    assert_eq!(replies.len(), 2);
    let hit = BufferReference::decode(replies[0].args.as_slice()).unwrap();
    assert_eq!(hit.offset, 14);
    assert_eq!(hit.length, 3);
    assert_eq!(hit.data, b"fox");

    let status = Status::decode(replies[1].args.as_slice()).unwrap();
    assert_eq!(status.code(), StatusCode::Ok);
    assert_eq!(replies[1].response_id, 2);

    pipeline.finish();
}

#[test]
fn test_grep_literal_five_hits() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("five.txt");
    fs::write(&target, SENTENCE.repeat(5)).unwrap();

    let config = Arc::new(ClientConfig::load(write_config(dir.path(), false)).unwrap());
    let pipeline = start_pipeline(config);

    let spec = GrepSpec {
        path: target.display().to_string(),
        literal: b"fox".to_vec(),
        bytes_before: 0,
        bytes_after: 0,
    };
    let replies = pipeline.round_trip(request("Grep", GrepSpec::TYPE_NAME, spec.encode_to_vec()));

    assert_eq!(replies.len(), 6);
    let offsets: Vec<u64> = replies[..5]
        .iter()
        .map(|m| BufferReference::decode(m.args.as_slice()).unwrap().offset)
        .collect();
    assert_eq!(offsets, [14, 59, 104, 149, 194]);

    let status = Status::decode(replies[5].args.as_slice()).unwrap();
    assert_eq!(status.code(), StatusCode::Ok);

    pipeline.finish();
}

#[test]
fn test_fingerprint_file() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("pair.bin");
    let sentence = &SENTENCE[..SENTENCE.len() - 1];
    let mut contents = Vec::new();
    contents.extend_from_slice(sentence);
    contents.push(0);
    contents.extend_from_slice(sentence);
    fs::write(&target, &contents).unwrap();

    let config = Arc::new(ClientConfig::load(write_config(dir.path(), false)).unwrap());
    let pipeline = start_pipeline(config);

    let req = FingerprintRequest {
        path: target.display().to_string(),
    };
    let replies = pipeline.round_trip(request(
        "FingerprintFile",
        FingerprintRequest::TYPE_NAME,
        req.encode_to_vec(),
    ));

    assert_eq!(replies.len(), 2);
    let fingerprint = FingerprintResponse::decode(replies[0].args.as_slice()).unwrap();
    assert_eq!(fingerprint.md5, "e07b52e64e3427965d6a02a459167b69");
    assert_eq!(
        fingerprint.sha256,
        "01c7fb9a541a6c28ddb803d923d9add182b5c72dfdfa0dc1a757e4a62a65759e"
    );

    pipeline.finish();
}

#[test]
fn test_unknown_action_single_status() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(ClientConfig::load(write_config(dir.path(), false)).unwrap());
    let pipeline = start_pipeline(config);

    let replies = pipeline.round_trip(request("DoesNotExist", "", vec![]));
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message_type(), MessageType::Status);

    let status = Status::decode(replies[0].args.as_slice()).unwrap();
    assert_eq!(status.code(), StatusCode::GenericError);
    assert_eq!(status.error_message, "Unrecognized action: DoesNotExist");

    // The status routes back to the originating request.
    assert_eq!(replies[0].request_id, 1);
    assert_eq!(replies[0].session_id, "aff4:/flows/W:100");

    // Nothing else leaked into the outbox.
    std::thread::sleep(Duration::from_millis(50));
    assert!(pipeline.outbox.dequeue(10, 1_000_000, false).is_empty());

    pipeline.finish();
}

#[test]
fn test_enrolment_message_from_fresh_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(ClientConfig::load(write_config(dir.path(), true)).unwrap());
    assert!(config.client_id().is_none());

    let message = build_enrolment_message(&config).unwrap();
    assert_eq!(message.session_id, ENROLMENT_SESSION_ID);
    assert_eq!(message.args_rdf_name, "Certificate");

    let blob = CertificateBlob::decode(message.args.as_slice()).unwrap();
    assert_eq!(blob.r#type, CertificateType::Csr as i32);
    assert!(blob.pem.contains("BEGIN CERTIFICATE REQUEST"));

    // The config now owns a persistent key.
    let client_id = config.client_id().unwrap();
    assert!(client_id.starts_with("C."));
    let reloaded = ClientConfig::load(dir.path().join("client.conf")).unwrap();
    assert_eq!(reloaded.client_id().unwrap(), client_id);
}
