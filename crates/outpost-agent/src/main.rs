//! outpost endpoint agent.
//!
//! A long-running process on a managed host: it pins a control server
//! certificate, exchanges encrypted message batches over HTTPS, executes
//! bounded introspection actions, and reports results back. A supervisor
//! process watches its heartbeat and restarts it when it goes quiet.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use outpost_core::config::ClientConfig;
use outpost_core::nanny::{FileNannyStore, Heartbeat, NannyStore, NullHeartbeat, StoreHeartbeat};
use outpost_core::queue::MessageQueue;
use tracing::info;
use tracing_subscriber::EnvFilter;

use outpost_agent::actions;
use outpost_agent::comms::ConnectionLoop;
use outpost_agent::dispatcher::Dispatcher;
use outpost_agent::stats;
use outpost_agent::subprocess::SubprocessDelegator;

/// Inbox bounds: the server paces inbound work, so these are generous.
const INBOX_MAX_COUNT: usize = 1_024;
const INBOX_MAX_BYTES: usize = 10_000_000;

/// Outbox bounds: actions block here when the server is slow to drain.
const OUTBOX_MAX_COUNT: usize = 10_000;
const OUTBOX_MAX_BYTES: usize = 10_000_000;

/// Delegate queue bounds for the helper subprocess.
const DELEGATE_MAX_COUNT: usize = 256;
const DELEGATE_MAX_BYTES: usize = 4_000_000;

#[derive(Parser, Debug)]
#[command(name = "outpost-agent", version, about)]
struct Cli {
    /// Path to the client configuration file.
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    outpost_core::crypto::init().context("crypto initialisation failed")?;

    let config = Arc::new(
        ClientConfig::load(&cli.config)
            .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?,
    );

    let inbox = Arc::new(MessageQueue::new(INBOX_MAX_COUNT, INBOX_MAX_BYTES));
    let outbox = Arc::new(MessageQueue::new(OUTBOX_MAX_COUNT, OUTBOX_MAX_BYTES));

    // The supervisor store doubles as the heartbeat target; without a
    // temporary directory there is nowhere durable to put it and the
    // agent runs unsupervised.
    let nanny_store: Option<Arc<dyn NannyStore>> = config
        .temporary_directory()
        .map(|dir| Arc::new(FileNannyStore::new(dir.join("nanny.state"))) as Arc<dyn NannyStore>);
    let heartbeat: Arc<dyn Heartbeat> = match &config.temporary_directory() {
        Some(dir) => Arc::new(StoreHeartbeat::new(FileNannyStore::new(
            dir.join("nanny.state"),
        ))),
        None => Arc::new(NullHeartbeat),
    };

    let mut dispatcher = Dispatcher::new(
        Arc::clone(&inbox),
        Arc::clone(&outbox),
        Arc::clone(&config),
    );
    for action in actions::builtin_actions() {
        dispatcher.register(action);
    }
    if let Some(store) = &nanny_store {
        dispatcher.set_nanny_store(Arc::clone(store));
    }

    // Requests the built-in set cannot serve go to the helper process
    // when one is configured.
    let _delegator = config.subprocess().map(|spec| {
        let delegate_inbox = Arc::new(MessageQueue::new(DELEGATE_MAX_COUNT, DELEGATE_MAX_BYTES));
        dispatcher.set_delegate_inbox(Arc::clone(&delegate_inbox));
        info!(helper = %spec.filename.display(), "subprocess delegator attached");
        SubprocessDelegator::spawn(spec, delegate_inbox, Arc::clone(&outbox))
    });

    let _dispatcher_handle = dispatcher.spawn();

    let enrolled = Arc::new(AtomicBool::new(false));
    let _stats_handle = stats::spawn(Arc::clone(&outbox), Arc::clone(&enrolled));

    // The connection loop owns the calling thread and never returns in a
    // normal run; any return is an abnormal exit.
    let mut connection_loop =
        ConnectionLoop::new(config, outbox, inbox, heartbeat, nanny_store, enrolled);
    connection_loop.run()
}
