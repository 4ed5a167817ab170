//! Supervisor ("nanny") contract.
//!
//! The supervisor and the client share a handful of state elements in a
//! persistent store: the client heartbeat, a one-shot supervisor message,
//! the reason for the last abnormal termination, the child command line,
//! and a transaction log journalling the request the client is working
//! on. The control loop in [`Nanny::tick`] kills an unresponsive or
//! oversized child and resurrects a dead one after a hold-off; the client
//! side stamps the heartbeat from every long sleep.

mod event_log;

pub use event_log::EventLog;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum NannyError {
    /// The persistent store could not be read or written.
    #[error("nanny store error at {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The child process could not be spawned.
    #[error("failed to spawn child: {0}")]
    SpawnFailed(String),
}

/// The state elements shared between supervisor and client.
pub trait NannyStore: Send + Sync {
    /// Latest client heartbeat, Unix epoch seconds.
    fn heartbeat(&self) -> Option<u64>;

    /// Records a client heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn set_heartbeat(&self, epoch_s: u64) -> Result<(), NannyError>;

    /// One-shot message for the server, set by the supervisor.
    fn nanny_message(&self) -> Option<String>;

    /// Sets the one-shot message.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn set_nanny_message(&self, message: &str) -> Result<(), NannyError>;

    /// Clears the one-shot message after forwarding.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn clear_nanny_message(&self) -> Result<(), NannyError>;

    /// Reason for the last abnormal termination.
    fn nanny_status(&self) -> Option<String>;

    /// Records the reason for an abnormal termination.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn set_nanny_status(&self, status: &str) -> Result<(), NannyError>;

    /// Clears the termination reason after forwarding.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn clear_nanny_status(&self) -> Result<(), NannyError>;

    /// Child binary and arguments the supervisor should (re)spawn, as
    /// installed by the operator.
    fn child_command(&self) -> Option<(String, Vec<String>)>;

    /// Records the child command line.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn set_child_command(&self, binary: &str, args: &[String]) -> Result<(), NannyError>;

    /// The request the client was processing when it last wrote the
    /// transaction log. A leftover entry at startup means the client died
    /// mid-request.
    fn transaction_log(&self) -> Option<Vec<u8>>;

    /// Records the serialized request about to be processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn write_transaction_log(&self, request: &[u8]) -> Result<(), NannyError>;

    /// Clears the transaction log after the request completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn clean_transaction_log(&self) -> Result<(), NannyError>;
}

/// Policy scalars steering the control loop.
#[derive(Debug, Clone)]
pub struct NannyPolicy {
    /// Hold-off between a child death and its resurrection.
    pub resurrection_period: Duration,

    /// Maximum heartbeat silence before the child is killed.
    pub unresponsive_kill_period: Duration,

    /// Boot slack: a freshly spawned child is not killed for silence
    /// within this period.
    pub unresponsive_grace_period: Duration,

    /// Minimum interval between identical log lines.
    pub event_log_message_suppression: Duration,

    /// Kill the child when its resident set exceeds this many bytes.
    pub client_memory_limit: u64,
}

impl Default for NannyPolicy {
    fn default() -> Self {
        Self {
            resurrection_period: Duration::from_secs(60),
            unresponsive_kill_period: Duration::from_secs(120),
            unresponsive_grace_period: Duration::from_secs(30),
            event_log_message_suppression: Duration::from_secs(60),
            client_memory_limit: 1024 * 1024 * 1024,
        }
    }
}

/// Extra slack granted once when the kill deadline first passes, so a
/// machine waking from suspend gets a chance to heartbeat.
const SUSPEND_GRACE: Duration = Duration::from_secs(2);

/// What the supervisor can do to its child.
pub trait ChildController {
    /// Whether the child process is currently alive.
    fn is_alive(&mut self) -> bool;

    /// The child's resident set size in bytes (0 when unknown).
    fn memory_bytes(&mut self) -> u64;

    /// Spawns a fresh child.
    ///
    /// # Errors
    ///
    /// Returns an error if the spawn fails.
    fn spawn(&mut self) -> Result<(), NannyError>;

    /// Kills the child, recording `message` as the reason.
    fn kill(&mut self, message: &str);
}

/// The supervisor control loop.
pub struct Nanny<S, C> {
    store: S,
    controller: C,
    policy: NannyPolicy,
    event_log: EventLog,
    last_observed_heartbeat: u64,
    child_started_at: Option<u64>,
    suspend_grace_armed: bool,
}

impl<S: NannyStore, C: ChildController> Nanny<S, C> {
    /// Creates a supervisor over a store and a child controller.
    pub fn new(store: S, controller: C, policy: NannyPolicy) -> Self {
        let event_log = EventLog::new(policy.event_log_message_suppression);
        Self {
            store,
            controller,
            policy,
            event_log,
            last_observed_heartbeat: 0,
            child_started_at: None,
            suspend_grace_armed: false,
        }
    }

    /// Runs one supervision step at `now` (epoch seconds) and returns the
    /// recommended seconds until the next tick.
    pub fn tick(&mut self, now: u64) -> u64 {
        // Heartbeats only ever move forward.
        let stored = self.store.heartbeat().unwrap_or(0);
        self.last_observed_heartbeat = self.last_observed_heartbeat.max(stored);

        if self.controller.is_alive() {
            self.tick_alive(now)
        } else {
            self.tick_dead(now)
        }
    }

    fn tick_alive(&mut self, now: u64) -> u64 {
        let memory = self.controller.memory_bytes();
        if memory > self.policy.client_memory_limit {
            self.kill_child(now, "Child process exceeded memory limit.");
            return self.policy.resurrection_period.as_secs().max(1);
        }

        // Boot slack for a fresh child.
        if let Some(started) = self.child_started_at {
            if now.saturating_sub(started) < self.policy.unresponsive_grace_period.as_secs() {
                return self
                    .policy
                    .unresponsive_grace_period
                    .as_secs()
                    .saturating_sub(now - started)
                    .max(1);
            }
        }

        let silence = now.saturating_sub(self.last_observed_heartbeat);
        let kill_after = self.policy.unresponsive_kill_period.as_secs();
        if silence > kill_after {
            if !self.suspend_grace_armed {
                // One extra chance to survive a system suspend.
                self.suspend_grace_armed = true;
                return SUSPEND_GRACE.as_secs();
            }
            self.kill_child(now, "No heartbeat received.");
            return self.policy.resurrection_period.as_secs().max(1);
        }

        self.suspend_grace_armed = false;
        (self.last_observed_heartbeat + kill_after)
            .saturating_sub(now)
            .max(1)
    }

    fn tick_dead(&mut self, now: u64) -> u64 {
        self.child_started_at = None;
        let resurrect_at = self.last_observed_heartbeat
            + self.policy.unresponsive_kill_period.as_secs()
            + self.policy.resurrection_period.as_secs();

        if now < resurrect_at {
            return (resurrect_at - now).max(1);
        }

        match self.controller.spawn() {
            Ok(()) => {
                info!(target: "nanny", "child spawned");
                self.last_observed_heartbeat = now;
                let _ = self.store.set_heartbeat(now);
                self.child_started_at = Some(now);
                self.suspend_grace_armed = false;
                self.policy.unresponsive_grace_period.as_secs().max(1)
            }
            Err(error) => {
                self.event_log.log(&format!("failed to spawn child: {error}"), now);
                self.policy.resurrection_period.as_secs().max(1)
            }
        }
    }

    fn kill_child(&mut self, now: u64, message: &str) {
        self.event_log.log(message, now);
        self.controller.kill(message);
        if let Err(error) = self.store.set_nanny_status(message) {
            warn!(target: "nanny", %error, "failed to record nanny status");
        }
        self.child_started_at = None;
        self.suspend_grace_armed = false;
        // The resurrection hold-off keys off the last heartbeat, not the
        // kill time, so the observed value is left untouched.
    }

    /// Access to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

/// File-backed [`NannyStore`] for POSIX hosts: one `key: value` file.
pub struct FileNannyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileNannyStore {
    /// Opens (or later creates) the store at `path`.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Vec<(String, String)> {
        let Ok(text) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        text.lines()
            .filter_map(|line| {
                line.split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap();
        self.read_all()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .filter(|v| !v.is_empty())
    }

    fn set(&self, key: &str, value: Option<&str>) -> Result<(), NannyError> {
        let _guard = self.lock.lock().unwrap();
        let mut entries = self.read_all();
        entries.retain(|(k, _)| k != key);
        if let Some(value) = value {
            entries.push((key.to_string(), value.to_string()));
        }

        let mut out = String::new();
        for (k, v) in &entries {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push('\n');
        }
        fs::write(&self.path, out).map_err(|source| NannyError::Store {
            path: self.path.clone(),
            source,
        })
    }
}

impl NannyStore for FileNannyStore {
    fn heartbeat(&self) -> Option<u64> {
        self.get("heartbeat").and_then(|v| v.parse().ok())
    }

    fn set_heartbeat(&self, epoch_s: u64) -> Result<(), NannyError> {
        self.set("heartbeat", Some(&epoch_s.to_string()))
    }

    fn nanny_message(&self) -> Option<String> {
        self.get("nanny_message")
    }

    fn set_nanny_message(&self, message: &str) -> Result<(), NannyError> {
        self.set("nanny_message", Some(message))
    }

    fn clear_nanny_message(&self) -> Result<(), NannyError> {
        self.set("nanny_message", None)
    }

    fn nanny_status(&self) -> Option<String> {
        self.get("nanny_status")
    }

    fn set_nanny_status(&self, status: &str) -> Result<(), NannyError> {
        self.set("nanny_status", Some(status))
    }

    fn clear_nanny_status(&self) -> Result<(), NannyError> {
        self.set("nanny_status", None)
    }

    fn child_command(&self) -> Option<(String, Vec<String>)> {
        let binary = self.get("child_binary")?;
        let args = self
            .get("child_args")
            .map(|joined| joined.split('\t').map(str::to_string).collect())
            .unwrap_or_default();
        Some((binary, args))
    }

    fn set_child_command(&self, binary: &str, args: &[String]) -> Result<(), NannyError> {
        self.set("child_binary", Some(binary))?;
        // Tab-joined; arguments with embedded tabs are not supported by
        // this store.
        if args.is_empty() {
            self.set("child_args", None)
        } else {
            self.set("child_args", Some(&args.join("\t")))
        }
    }

    fn transaction_log(&self) -> Option<Vec<u8>> {
        self.get("transaction")
            .and_then(|hex| crate::crypto::hex_decode(&hex))
    }

    fn write_transaction_log(&self, request: &[u8]) -> Result<(), NannyError> {
        self.set("transaction", Some(&crate::crypto::hex_lower(request)))
    }

    fn clean_transaction_log(&self) -> Result<(), NannyError> {
        self.set("transaction", None)
    }
}

/// Something the long-sleeping threads can poke to prove liveness.
pub trait Heartbeat: Send + Sync {
    /// Records one heartbeat.
    fn beat(&self);
}

/// No-op heartbeat for hosts running without a supervisor.
pub struct NullHeartbeat;

impl Heartbeat for NullHeartbeat {
    fn beat(&self) {}
}

/// Heartbeat writer stamping a [`NannyStore`].
pub struct StoreHeartbeat<S> {
    store: S,
}

impl<S: NannyStore> StoreHeartbeat<S> {
    /// Wraps a store.
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: NannyStore> Heartbeat for StoreHeartbeat<S> {
    fn beat(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        if let Err(error) = self.store.set_heartbeat(now) {
            debug!(%error, "heartbeat write failed");
        }
    }
}

/// Sleeps in one-second slices, heartbeating between slices so the
/// supervisor keeps seeing a live client through long waits.
pub fn sleep_with_heartbeat(duration: Duration, heartbeat: &dyn Heartbeat) {
    heartbeat.beat();
    let whole_seconds = duration.as_secs();
    let remainder = duration - Duration::from_secs(whole_seconds);
    std::thread::sleep(remainder);
    for _ in 0..whole_seconds {
        std::thread::sleep(Duration::from_secs(1));
        heartbeat.beat();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;

    struct FakeChild {
        alive: bool,
        memory: u64,
        spawned: u32,
        killed_with: Vec<String>,
        fail_spawn: bool,
    }

    impl FakeChild {
        fn new() -> Self {
            Self {
                alive: false,
                memory: 0,
                spawned: 0,
                killed_with: Vec::new(),
                fail_spawn: false,
            }
        }
    }

    impl ChildController for FakeChild {
        fn is_alive(&mut self) -> bool {
            self.alive
        }

        fn memory_bytes(&mut self) -> u64 {
            self.memory
        }

        fn spawn(&mut self) -> Result<(), NannyError> {
            if self.fail_spawn {
                return Err(NannyError::SpawnFailed("refused".to_string()));
            }
            self.alive = true;
            self.spawned += 1;
            Ok(())
        }

        fn kill(&mut self, message: &str) {
            self.alive = false;
            self.killed_with.push(message.to_string());
        }
    }

    fn store() -> FileNannyStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nanny.state");
        // Keep the directory alive for the duration of the test.
        std::mem::forget(dir);
        FileNannyStore::new(path)
    }

    fn policy() -> NannyPolicy {
        NannyPolicy {
            resurrection_period: Duration::from_secs(60),
            unresponsive_kill_period: Duration::from_secs(120),
            unresponsive_grace_period: Duration::from_secs(30),
            event_log_message_suppression: Duration::from_secs(60),
            client_memory_limit: 1_000_000,
        }
    }

    #[test]
    fn test_dead_child_resurrected_after_holdoff() {
        let store = store();
        store.set_heartbeat(1_000).unwrap();
        let mut nanny = Nanny::new(store, FakeChild::new(), policy());

        // Too early: heartbeat 1000 + 120 + 60 = 1180.
        let _ = nanny.tick(1_100);
        assert_eq!(nanny.controller.spawned, 0);

        let _ = nanny.tick(1_180);
        assert_eq!(nanny.controller.spawned, 1);
        assert!(nanny.controller.alive);
        // Heartbeat reset to spawn time.
        assert_eq!(nanny.store().heartbeat(), Some(1_180));
    }

    #[test]
    fn test_silent_child_killed_after_extra_grace() {
        let store = store();
        store.set_heartbeat(1_000).unwrap();
        let mut nanny = Nanny::new(store, FakeChild::new(), policy());
        nanny.controller.alive = true;

        // Silence of 121 s exceeds the 120 s kill period, but the first
        // pass only arms the 2 s suspend grace.
        let next = nanny.tick(1_121);
        assert_eq!(next, 2);
        assert!(nanny.controller.killed_with.is_empty());

        // Still silent after the grace: killed.
        let _ = nanny.tick(1_123);
        assert_eq!(nanny.controller.killed_with, ["No heartbeat received."]);
        assert_eq!(
            nanny.store().nanny_status().as_deref(),
            Some("No heartbeat received.")
        );
    }

    #[test]
    fn test_heartbeat_during_grace_cancels_kill() {
        let store = store();
        store.set_heartbeat(1_000).unwrap();
        let mut nanny = Nanny::new(store, FakeChild::new(), policy());
        nanny.controller.alive = true;

        assert_eq!(nanny.tick(1_121), 2);
        // The client heartbeats before the grace expires.
        nanny.store.set_heartbeat(1_122).unwrap();
        let _ = nanny.tick(1_123);
        assert!(nanny.controller.killed_with.is_empty());
    }

    #[test]
    fn test_memory_limit_kill() {
        let store = store();
        store.set_heartbeat(1_000).unwrap();
        let mut nanny = Nanny::new(store, FakeChild::new(), policy());
        nanny.controller.alive = true;
        nanny.controller.memory = 2_000_000;

        let _ = nanny.tick(1_001);
        assert_eq!(
            nanny.controller.killed_with,
            ["Child process exceeded memory limit."]
        );
    }

    #[test]
    fn test_fresh_child_has_boot_slack() {
        let store = store();
        let mut nanny = Nanny::new(store, FakeChild::new(), policy());

        // Dead from the start with no recorded heartbeat: resurrect at
        // 0 + 120 + 60 = 180.
        let _ = nanny.tick(200);
        assert_eq!(nanny.controller.spawned, 1);

        // Within the 30 s grace nothing is killed, even though the child
        // has not heartbeat yet.
        let _ = nanny.tick(220);
        assert!(nanny.controller.killed_with.is_empty());
    }

    #[test]
    fn test_spawn_failure_backs_off() {
        let store = store();
        let mut child = FakeChild::new();
        child.fail_spawn = true;
        let mut nanny = Nanny::new(store, child, policy());

        let next = nanny.tick(10_000);
        assert_eq!(nanny.controller.spawned, 0);
        assert_eq!(next, 60);
    }

    #[test]
    fn test_heartbeat_is_max_merged() {
        let store = store();
        store.set_heartbeat(2_000).unwrap();
        let mut nanny = Nanny::new(store, FakeChild::new(), policy());
        nanny.controller.alive = true;

        let _ = nanny.tick(2_010);
        // A heartbeat moving backwards is ignored.
        nanny.store.set_heartbeat(1_500).unwrap();
        let next = nanny.tick(2_020);
        // Deadline still derives from the 2000 heartbeat.
        assert_eq!(next, 2_000 + 120 - 2_020);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let store = store();
        assert_eq!(store.heartbeat(), None);
        store.set_heartbeat(42).unwrap();
        assert_eq!(store.heartbeat(), Some(42));

        store.set_nanny_message("hello server").unwrap();
        store.set_nanny_status("No heartbeat received.").unwrap();
        assert_eq!(store.nanny_message().as_deref(), Some("hello server"));
        assert_eq!(
            store.nanny_status().as_deref(),
            Some("No heartbeat received.")
        );

        store.clear_nanny_message().unwrap();
        assert_eq!(store.nanny_message(), None);
        // Other keys survive individual updates.
        assert_eq!(store.heartbeat(), Some(42));
    }

    #[test]
    fn test_file_store_transaction_log() {
        let store = store();
        assert_eq!(store.transaction_log(), None);

        store.write_transaction_log(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        assert_eq!(store.transaction_log(), Some(vec![0xde, 0xad, 0xbe, 0xef]));

        store.clean_transaction_log().unwrap();
        assert_eq!(store.transaction_log(), None);
    }

    #[test]
    fn test_file_store_child_command() {
        let store = store();
        assert_eq!(store.child_command(), None);

        let args = vec!["/etc/outpost/client.conf".to_string()];
        store
            .set_child_command("/usr/bin/outpost-agent", &args)
            .unwrap();
        assert_eq!(
            store.child_command(),
            Some(("/usr/bin/outpost-agent".to_string(), args))
        );

        store.set_child_command("/usr/bin/outpost-agent", &[]).unwrap();
        assert_eq!(
            store.child_command(),
            Some(("/usr/bin/outpost-agent".to_string(), vec![]))
        );
    }

    #[test]
    fn test_store_heartbeat_writes_now() {
        let store = store();
        let path = store.path.clone();
        let heartbeat = StoreHeartbeat::new(store);
        heartbeat.beat();

        let reread = FileNannyStore::new(path);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let written = reread.heartbeat().unwrap();
        assert!(now.abs_diff(written) < 5);
    }

    #[test]
    fn test_null_heartbeat_sleep() {
        let counter = Arc::new(AtomicU64::new(0));

        struct Counting(Arc<AtomicU64>);
        impl Heartbeat for Counting {
            fn beat(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let heartbeat = Counting(Arc::clone(&counter));
        sleep_with_heartbeat(Duration::from_millis(30), &heartbeat);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
