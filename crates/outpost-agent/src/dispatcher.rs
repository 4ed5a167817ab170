//! Action dispatcher.
//!
//! A single worker thread drains the inbox in batches, routes each request
//! to its registered handler by name, and resolves every request with
//! exactly one terminal `STATUS` reply, whether the handler succeeded,
//! failed, or never existed. Requests for names nobody registered are
//! handed to the subprocess delegator when one is attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use outpost_core::config::ClientConfig;
use outpost_core::nanny::NannyStore;
use outpost_core::queue::MessageQueue;
use outpost_core::wire::{Message, MessageType, Payload, Status};
use prost::Message as _;
use tracing::{debug, info, warn};

use crate::context::ActionContext;

/// Batch bounds for one inbox drain.
const BATCH_MAX_COUNT: usize = 100;
const BATCH_MAX_BYTES: usize = 100_000;

/// A named, server-invokable operation on the host.
///
/// Handlers report failures by returning an error; the dispatcher folds it
/// into the request status. Panics are not part of the contract: a handler
/// that can fail returns `Err`.
pub trait ClientAction: Send + Sync {
    /// The wire name this handler is registered under.
    fn name(&self) -> &'static str;

    /// Processes one request through the context.
    ///
    /// # Errors
    ///
    /// Any error becomes `GENERIC_ERROR("Exception in ProcessRequest: ...")`
    /// in the terminal status.
    fn handle(&self, ctx: &mut ActionContext) -> anyhow::Result<()>;
}

/// Routes inbox messages to registered handlers.
pub struct Dispatcher {
    registry: HashMap<&'static str, Box<dyn ClientAction>>,
    inbox: Arc<MessageQueue>,
    outbox: Arc<MessageQueue>,
    config: Arc<ClientConfig>,
    delegate_inbox: Option<Arc<MessageQueue>>,
    nanny_store: Option<Arc<dyn NannyStore>>,
    shutting_down: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Creates a dispatcher over the queues. Handlers are registered
    /// before [`spawn`](Self::spawn); the registry is read-only afterwards.
    pub fn new(
        inbox: Arc<MessageQueue>,
        outbox: Arc<MessageQueue>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            registry: HashMap::new(),
            inbox,
            outbox,
            config,
            delegate_inbox: None,
            nanny_store: None,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a handler under its name.
    pub fn register(&mut self, action: Box<dyn ClientAction>) {
        let name = action.name();
        if self.registry.insert(name, action).is_some() {
            warn!(name, "action registered twice, keeping the last one");
        }
    }

    /// Attaches a delegate queue; unknown action names are forwarded there
    /// instead of being rejected.
    pub fn set_delegate_inbox(&mut self, queue: Arc<MessageQueue>) {
        self.delegate_inbox = Some(queue);
    }

    /// Attaches the supervisor store; in-flight requests are journalled
    /// there so a crash can be reported to the server on the next start.
    pub fn set_nanny_store(&mut self, store: Arc<dyn NannyStore>) {
        self.nanny_store = Some(store);
    }

    /// Flag the owner can raise to stop the worker; pair with a sentinel
    /// pushed through the inbox to unstick a blocked dequeue.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutting_down)
    }

    /// Starts the worker thread.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || self.run())
            .expect("spawning the dispatcher thread")
    }

    fn run(self) {
        info!(actions = self.registry.len(), "dispatcher running");
        self.report_interrupted_request();
        loop {
            let batch = self.inbox.dequeue(BATCH_MAX_COUNT, BATCH_MAX_BYTES, true);
            if batch.is_empty() && self.inbox.is_closed() {
                return;
            }
            for message in batch {
                if self.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                if message.is_sentinel() {
                    continue;
                }
                self.process(message);
            }
        }
    }

    /// Handles one request and resolves it with a terminal status.
    fn process(&self, request: Message) {
        debug!(
            name = %request.name,
            session_id = %request.session_id,
            request_id = request.request_id,
            "processing request"
        );

        let mut ctx = ActionContext::new(
            request,
            Arc::clone(&self.outbox),
            Arc::clone(&self.config),
        );

        match self.registry.get(ctx.message().name.as_str()) {
            Some(action) => {
                self.journal_request(ctx.message());
                if let Err(error) = action.handle(&mut ctx) {
                    ctx.set_error(format!("Exception in ProcessRequest: {error}"));
                }
            }
            None => {
                if let Some(delegate) = &self.delegate_inbox {
                    // The helper process owns the terminal status for
                    // requests it serves.
                    delegate.enqueue(ctx.into_request());
                    return;
                }
                let name = ctx.message().name.clone();
                ctx.set_error(format!("Unrecognized action: {name}"));
            }
        }

        ctx.finish();
        if let Some(store) = &self.nanny_store {
            if let Err(error) = store.clean_transaction_log() {
                debug!(%error, "failed to clean transaction log");
            }
        }
    }

    /// Journals the request about to run, so a crash mid-handler is
    /// visible on the next start.
    fn journal_request(&self, request: &Message) {
        let Some(store) = &self.nanny_store else {
            return;
        };
        if let Err(error) = store.write_transaction_log(&request.encode_to_vec()) {
            debug!(%error, "failed to write transaction log");
        }
    }

    /// Resolves a request left in the transaction log by a previous run:
    /// the client died mid-handler, and the server is still waiting.
    fn report_interrupted_request(&self) {
        let Some(store) = &self.nanny_store else {
            return;
        };
        let Some(raw) = store.transaction_log() else {
            return;
        };
        let Ok(request) = Message::decode(raw.as_slice()) else {
            let _ = store.clean_transaction_log();
            return;
        };

        let mut message = "Client killed during transaction".to_string();
        if let Some(reason) = store.nanny_status() {
            message.push_str("; supervisor reported: ");
            message.push_str(&reason);
            let _ = store.clear_nanny_status();
        }
        warn!(
            name = %request.name,
            session_id = %request.session_id,
            "reporting request interrupted by a previous crash"
        );

        let status = Status::generic_error(message);
        self.outbox.enqueue(Message::reply(
            &request,
            1,
            MessageType::Status,
            Status::TYPE_NAME,
            status.encode_to_vec(),
        ));
        let _ = store.clean_transaction_log();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use outpost_core::wire::{
        DataBlob, MessageType, Payload, Status, StatusCode, StatRequest,
    };
    use prost::Message as _;

    use super::*;

    /// A long-lived throwaway CA so the config loads; the dispatcher
    /// never touches it.
    const TEST_CA_PEM: &str = include_str!("../testdata/ca.pem");

    fn test_config() -> Arc<ClientConfig> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.conf");
        fs::write(
            &path,
            format!("control_url: https://c.example.com/control\nca_cert_pem: {TEST_CA_PEM}"),
        )
        .unwrap();
        let config = Arc::new(ClientConfig::load(&path).unwrap());
        std::mem::forget(dir);
        config
    }

    struct EchoAction;

    impl ClientAction for EchoAction {
        fn name(&self) -> &'static str {
            "Echo"
        }

        fn handle(&self, ctx: &mut ActionContext) -> anyhow::Result<()> {
            let Some(blob) = ctx.populate_args::<DataBlob>() else {
                return Ok(());
            };
            ctx.send_response(&blob, MessageType::Message);
            Ok(())
        }
    }

    struct FailingAction;

    impl ClientAction for FailingAction {
        fn name(&self) -> &'static str {
            "AlwaysFails"
        }

        fn handle(&self, _ctx: &mut ActionContext) -> anyhow::Result<()> {
            anyhow::bail!("disk on fire")
        }
    }

    fn queues() -> (Arc<MessageQueue>, Arc<MessageQueue>) {
        (
            Arc::new(MessageQueue::new(100, 1_000_000)),
            Arc::new(MessageQueue::new(100, 1_000_000)),
        )
    }

    fn request(name: &str, args_rdf_name: &str, args: Vec<u8>) -> Message {
        Message {
            session_id: "aff4:/flows/W:7".to_string(),
            request_id: 11,
            task_id: 23,
            name: name.to_string(),
            args_rdf_name: args_rdf_name.to_string(),
            args,
            ..Default::default()
        }
    }

    fn run_one(dispatcher: Dispatcher, inbox: &MessageQueue) -> JoinHandle<()> {
        let handle = dispatcher.spawn();
        // Give the worker a moment, then close the inbox so it exits.
        std::thread::sleep(std::time::Duration::from_millis(100));
        inbox.close();
        handle
    }

    fn drain_status(outbox: &MessageQueue) -> Vec<Message> {
        outbox.dequeue(100, 1_000_000, false)
    }

    #[test]
    fn test_unknown_action_yields_single_error_status() {
        let (inbox, outbox) = queues();
        let dispatcher = Dispatcher::new(
            Arc::clone(&inbox),
            Arc::clone(&outbox),
            test_config(),
        );

        inbox.enqueue(request("DoesNotExist", "", vec![]));
        run_one(dispatcher, &inbox).join().unwrap();

        let replies = drain_status(&outbox);
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(reply.message_type(), MessageType::Status);
        assert_eq!(reply.request_id, 11);
        assert_eq!(reply.session_id, "aff4:/flows/W:7");
        assert_eq!(reply.response_id, 1);

        let status = Status::decode(reply.args.as_slice()).unwrap();
        assert_eq!(status.code(), StatusCode::GenericError);
        assert_eq!(status.error_message, "Unrecognized action: DoesNotExist");
    }

    #[test]
    fn test_handler_success_emits_data_then_status() {
        let (inbox, outbox) = queues();
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&inbox),
            Arc::clone(&outbox),
            test_config(),
        );
        dispatcher.register(Box::new(EchoAction));

        let blob = DataBlob {
            string: "ping".to_string(),
        };
        inbox.enqueue(request("Echo", DataBlob::TYPE_NAME, blob.encode_to_vec()));
        run_one(dispatcher, &inbox).join().unwrap();

        let replies = drain_status(&outbox);
        assert_eq!(replies.len(), 2);

        assert_eq!(replies[0].message_type(), MessageType::Message);
        assert_eq!(replies[0].response_id, 1);
        let echoed = DataBlob::decode(replies[0].args.as_slice()).unwrap();
        assert_eq!(echoed.string, "ping");

        assert_eq!(replies[1].message_type(), MessageType::Status);
        assert_eq!(replies[1].response_id, 2);
        let status = Status::decode(replies[1].args.as_slice()).unwrap();
        assert_eq!(status.code(), StatusCode::Ok);
    }

    #[test]
    fn test_handler_error_becomes_status() {
        let (inbox, outbox) = queues();
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&inbox),
            Arc::clone(&outbox),
            test_config(),
        );
        dispatcher.register(Box::new(FailingAction));

        inbox.enqueue(request("AlwaysFails", "", vec![]));
        run_one(dispatcher, &inbox).join().unwrap();

        let replies = drain_status(&outbox);
        assert_eq!(replies.len(), 1);
        let status = Status::decode(replies[0].args.as_slice()).unwrap();
        assert_eq!(status.code(), StatusCode::GenericError);
        assert_eq!(
            status.error_message,
            "Exception in ProcessRequest: disk on fire"
        );
    }

    #[test]
    fn test_missing_args_diagnostic() {
        let (inbox, outbox) = queues();
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&inbox),
            Arc::clone(&outbox),
            test_config(),
        );
        dispatcher.register(Box::new(EchoAction));

        inbox.enqueue(request("Echo", "", vec![]));
        run_one(dispatcher, &inbox).join().unwrap();

        let replies = drain_status(&outbox);
        assert_eq!(replies.len(), 1);
        let status = Status::decode(replies[0].args.as_slice()).unwrap();
        assert_eq!(
            status.error_message,
            "Expected args of type: DataBlob, but no args provided."
        );
    }

    #[test]
    fn test_wrong_args_type_diagnostic() {
        let (inbox, outbox) = queues();
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&inbox),
            Arc::clone(&outbox),
            test_config(),
        );
        dispatcher.register(Box::new(EchoAction));

        inbox.enqueue(request(
            "Echo",
            StatRequest::TYPE_NAME,
            StatRequest::default().encode_to_vec(),
        ));
        run_one(dispatcher, &inbox).join().unwrap();

        let replies = drain_status(&outbox);
        let status = Status::decode(replies[0].args.as_slice()).unwrap();
        assert_eq!(
            status.error_message,
            "Expected args of type: DataBlob, but received args of type: StatRequest"
        );
    }

    #[test]
    fn test_unknown_action_forwarded_to_delegate() {
        let (inbox, outbox) = queues();
        let delegate = Arc::new(MessageQueue::new(100, 1_000_000));
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&inbox),
            Arc::clone(&outbox),
            test_config(),
        );
        dispatcher.set_delegate_inbox(Arc::clone(&delegate));

        inbox.enqueue(request("HelperOnlyAction", "", vec![]));
        run_one(dispatcher, &inbox).join().unwrap();

        // No local status; the request travelled to the delegate intact.
        assert!(drain_status(&outbox).is_empty());
        let forwarded = delegate.dequeue(10, 1_000_000, false);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].name, "HelperOnlyAction");
    }

    #[test]
    fn test_interrupted_request_reported_on_startup() {
        use outpost_core::nanny::{FileNannyStore, NannyStore as _};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileNannyStore::new(dir.path().join("nanny.state")));

        // A previous run died while handling this request.
        let killed = request("Grep", "", vec![]);
        store.write_transaction_log(&killed.encode_to_vec()).unwrap();
        store.set_nanny_status("No heartbeat received.").unwrap();

        let (inbox, outbox) = queues();
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&inbox),
            Arc::clone(&outbox),
            test_config(),
        );
        dispatcher.set_nanny_store(Arc::clone(&store) as Arc<dyn NannyStore>);
        run_one(dispatcher, &inbox).join().unwrap();

        let replies = drain_status(&outbox);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type(), MessageType::Status);
        assert_eq!(replies[0].request_id, killed.request_id);
        assert_eq!(replies[0].response_id, 1);

        let status = Status::decode(replies[0].args.as_slice()).unwrap();
        assert_eq!(status.code(), StatusCode::GenericError);
        assert_eq!(
            status.error_message,
            "Client killed during transaction; supervisor reported: No heartbeat received."
        );

        // One-shot: the journal and the status are consumed.
        assert_eq!(store.transaction_log(), None);
        assert_eq!(store.nanny_status(), None);
    }

    #[test]
    fn test_completed_request_clears_transaction_log() {
        use outpost_core::nanny::{FileNannyStore, NannyStore as _};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileNannyStore::new(dir.path().join("nanny.state")));

        let (inbox, outbox) = queues();
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&inbox),
            Arc::clone(&outbox),
            test_config(),
        );
        dispatcher.register(Box::new(EchoAction));
        dispatcher.set_nanny_store(Arc::clone(&store) as Arc<dyn NannyStore>);

        let blob = DataBlob {
            string: "ping".to_string(),
        };
        inbox.enqueue(request("Echo", DataBlob::TYPE_NAME, blob.encode_to_vec()));
        run_one(dispatcher, &inbox).join().unwrap();

        // The request resolved normally, so no journal entry survives.
        assert_eq!(store.transaction_log(), None);
        assert_eq!(drain_status(&outbox).len(), 2);
    }

    #[test]
    fn test_each_request_resolved_in_order() {
        let (inbox, outbox) = queues();
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&inbox),
            Arc::clone(&outbox),
            test_config(),
        );
        dispatcher.register(Box::new(EchoAction));

        for i in 0..5 {
            let mut r = request("DoesNotExist", "", vec![]);
            r.request_id = i;
            inbox.enqueue(r);
        }
        run_one(dispatcher, &inbox).join().unwrap();

        let replies = drain_status(&outbox);
        assert_eq!(replies.len(), 5);
        let ids: Vec<_> = replies.iter().map(|m| m.request_id).collect();
        assert_eq!(ids, [0, 1, 2, 3, 4]);
    }
}
