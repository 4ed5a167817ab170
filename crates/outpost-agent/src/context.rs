//! Per-request context handed to action handlers.

use std::sync::Arc;

use outpost_core::config::ClientConfig;
use outpost_core::queue::MessageQueue;
use outpost_core::wire::{Message, MessageType, Payload, Status};
use prost::Message as _;

/// First response id within a request.
const INITIAL_RESPONSE_ID: u64 = 1;

/// Mediates between one handler invocation and the outbox.
///
/// The context tracks the cumulative status of the request and the
/// response counter; the dispatcher turns it into exactly one terminal
/// `STATUS` message when the handler is done, whatever happened.
pub struct ActionContext {
    request: Message,
    outbox: Arc<MessageQueue>,
    config: Arc<ClientConfig>,
    next_response_id: u64,
    status: Status,
}

impl ActionContext {
    /// Wraps an incoming request.
    pub fn new(request: Message, outbox: Arc<MessageQueue>, config: Arc<ClientConfig>) -> Self {
        Self {
            request,
            outbox,
            config,
            next_response_id: INITIAL_RESPONSE_ID,
            status: Status::ok(),
        }
    }

    /// The incoming request.
    pub fn message(&self) -> &Message {
        &self.request
    }

    /// Read-only configuration handle.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current cumulative status of this request.
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Records a generic error without sending anything.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status = Status::generic_error(message);
    }

    /// Parses the request payload as `T`, enforcing the type tag.
    ///
    /// On failure the context status is set to the matching diagnostic and
    /// `None` is returned; the handler should simply return.
    pub fn populate_args<T: Payload>(&mut self) -> Option<T> {
        if self.request.args_rdf_name.is_empty() {
            self.set_error(format!(
                "Expected args of type: {}, but no args provided.",
                T::TYPE_NAME
            ));
            return None;
        }
        if self.request.args_rdf_name != T::TYPE_NAME {
            self.set_error(format!(
                "Expected args of type: {}, but received args of type: {}",
                T::TYPE_NAME,
                self.request.args_rdf_name
            ));
            return None;
        }
        match T::decode(self.request.args.as_slice()) {
            Ok(args) => Some(args),
            Err(_) => {
                self.set_error("Unable to parse args.");
                None
            }
        }
    }

    /// Serialises `payload` and emits it as the next response in
    /// sequence, inheriting the request's routing identifiers.
    ///
    /// Returns whether the response was emitted (serialisation of the
    /// supported payload types cannot fail).
    pub fn send_response<T: Payload>(&mut self, payload: &T, kind: MessageType) -> bool {
        let reply = Message::reply(
            &self.request,
            self.next_response_id,
            kind,
            T::TYPE_NAME,
            payload.encode_to_vec(),
        );
        self.next_response_id += 1;
        self.outbox.enqueue(reply);
        true
    }

    /// Pushes a verbatim message to the outbox (side-channel blobs).
    pub fn send_message(&self, message: Message) {
        self.outbox.enqueue(message);
    }

    /// Emits the terminal `STATUS` reply. Called by the dispatcher on
    /// every path; consumes the context so it cannot happen twice.
    pub(crate) fn finish(mut self) {
        let status = self.status.clone();
        self.send_response(&status, MessageType::Status);
    }

    /// Recovers the request for forwarding to the subprocess delegator.
    pub(crate) fn into_request(self) -> Message {
        self.request
    }
}
