//! outpost supervisor.
//!
//! Launches and watches the agent: spawns it, kills it when the heartbeat
//! goes quiet or memory runs away, and respawns it after a hold-off. State
//! shared with the agent lives in a small key/value file.

use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use clap::Parser;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use outpost_core::nanny::{
    ChildController, FileNannyStore, Nanny, NannyError, NannyPolicy, NannyStore,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "outpost-nanny", version, about)]
struct Cli {
    /// Path to the shared supervisor state file.
    store: PathBuf,

    /// Child executable to supervise; recorded in the state file, so it
    /// only needs to be given once per install.
    #[arg(long)]
    child: Option<PathBuf>,

    /// Arguments passed to the child.
    #[arg(long = "child-arg")]
    child_args: Vec<String>,

    /// Seconds a dead child stays down before resurrection.
    #[arg(long, default_value_t = 60)]
    resurrection_period: u64,

    /// Seconds of heartbeat silence before the child is killed.
    #[arg(long, default_value_t = 120)]
    unresponsive_kill_period: u64,

    /// Seconds of boot slack for a freshly spawned child.
    #[arg(long, default_value_t = 30)]
    unresponsive_grace_period: u64,

    /// Minimum seconds between identical log lines.
    #[arg(long, default_value_t = 60)]
    event_log_message_suppression: u64,

    /// Child memory limit in bytes.
    #[arg(long, default_value_t = 1_073_741_824)]
    client_memory_limit: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let policy = NannyPolicy {
        resurrection_period: Duration::from_secs(cli.resurrection_period),
        unresponsive_kill_period: Duration::from_secs(cli.unresponsive_kill_period),
        unresponsive_grace_period: Duration::from_secs(cli.unresponsive_grace_period),
        event_log_message_suppression: Duration::from_secs(cli.event_log_message_suppression),
        client_memory_limit: cli.client_memory_limit,
    };

    let store = FileNannyStore::new(&cli.store);
    if let Some(child) = &cli.child {
        store
            .set_child_command(&child.display().to_string(), &cli.child_args)
            .context("recording child command in the state file")?;
    }
    let (binary, args) = store
        .child_command()
        .context("no child command installed in the state file; pass --child once")?;

    let controller = PosixChild::new(PathBuf::from(&binary), args);
    let mut nanny = Nanny::new(store, controller, policy);

    info!(child = %binary, "supervisor starting");
    loop {
        let next_tick_s = nanny.tick(now_s());
        std::thread::sleep(Duration::from_secs(next_tick_s.clamp(1, 60)));
    }
}

fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Child lifecycle over POSIX process primitives.
struct PosixChild {
    binary: PathBuf,
    args: Vec<String>,
    child: Option<Child>,
}

impl PosixChild {
    fn new(binary: PathBuf, args: Vec<String>) -> Self {
        Self {
            binary,
            args,
            child: None,
        }
    }

    fn pid(&self) -> Option<i32> {
        self.child
            .as_ref()
            .and_then(|child| i32::try_from(child.id()).ok())
    }
}

impl ChildController for PosixChild {
    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    info!(%status, "child exited");
                    self.child = None;
                    false
                }
                Err(error) => {
                    warn!(%error, "child status probe failed");
                    self.child = None;
                    false
                }
            },
            None => false,
        }
    }

    fn memory_bytes(&mut self) -> u64 {
        let Some(pid) = self.pid() else {
            return 0;
        };
        resident_bytes(pid).unwrap_or(0)
    }

    fn spawn(&mut self) -> Result<(), NannyError> {
        let child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|error| NannyError::SpawnFailed(error.to_string()))?;
        info!(pid = child.id(), "child spawned");
        self.child = Some(child);
        Ok(())
    }

    fn kill(&mut self, message: &str) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        warn!(pid = child.id(), message, "killing child");

        if let Ok(pid) = i32::try_from(child.id()) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
        // Grace, then the hammer, then reap.
        let deadline = Instant::now() + Duration::from_secs(4);
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Resident set size of an arbitrary pid from `/proc/<pid>/statm`.
fn resident_bytes(pid: i32) -> Option<u64> {
    let statm = fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = u64::try_from(page_size_bytes()).ok()?;
    Some(resident_pages * page_size)
}

fn page_size_bytes() -> i64 {
    // SAFETY: sysconf reads static system configuration and is
    // thread-safe.
    unsafe { nix::libc::sysconf(nix::libc::_SC_PAGESIZE) }
}
