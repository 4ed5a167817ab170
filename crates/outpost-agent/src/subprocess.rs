//! Subprocess delegator.
//!
//! An optional helper executable serves part of the pipeline over three
//! pipes: length-prefixed messages down stdin, length-prefixed responses
//! up stdout, and line-oriented log output on stderr. The child is an
//! opaque processor; this module owns its lifecycle.
//!
//! Invariants: at most one live child; `pid == 0` means no child and
//! `pid == -1` means the delegator is shutting down and the worker threads
//! should exit. Any stream failure kills the child; the writer respawns it
//! lazily when work arrives. Lock poisoning is treated as fatal.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use outpost_core::config::SubprocessConfig;
use outpost_core::queue::MessageQueue;
use outpost_core::wire::Message;
use prost::Message as _;
use tracing::{debug, info, warn};

/// Frames above this size force a child reset.
pub const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

/// Hold-off after a failed spawn.
const SPAWN_BACKOFF: Duration = Duration::from_secs(30);

/// Patience after SIGTERM, then after SIGKILL.
const TERM_WAIT: Duration = Duration::from_secs(4);
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Unreaped children tolerated before spawning is refused.
const MAX_UNDEAD: usize = 5;

/// Delegator errors.
#[derive(Debug, thiserror::Error)]
pub enum DelegatorError {
    /// Too many unreaped children; spawning refused.
    #[error("too many unreaped children, refusing to spawn")]
    TooManyUndead,

    /// The helper could not be started.
    #[error("failed to spawn helper: {0}")]
    Spawn(#[from] std::io::Error),
}

struct ChildState {
    /// `0`: no child. `-1`: shutting down. `> 0`: live child pid.
    pid: i32,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    /// Pids we signalled but could not reap.
    undead: Vec<i32>,
}

struct Shared {
    spec: SubprocessConfig,
    inbox: Arc<MessageQueue>,
    outbox: Arc<MessageQueue>,
    state: Mutex<ChildState>,
    child_spawned: Condvar,
}

/// Host side of the helper-process channel.
pub struct SubprocessDelegator {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl SubprocessDelegator {
    /// Starts the three worker threads. The child itself is spawned
    /// lazily when the first message arrives.
    #[must_use]
    pub fn spawn(
        spec: SubprocessConfig,
        inbox: Arc<MessageQueue>,
        outbox: Arc<MessageQueue>,
    ) -> Self {
        let shared = Arc::new(Shared {
            spec,
            inbox,
            outbox,
            state: Mutex::new(ChildState {
                pid: 0,
                child: None,
                stdin: None,
                stdout: None,
                stderr: None,
                undead: Vec::new(),
            }),
            child_spawned: Condvar::new(),
        });

        let threads = vec![
            spawn_thread("subprocess-writer", Arc::clone(&shared), writer_thread),
            spawn_thread("subprocess-reader", Arc::clone(&shared), reader_thread),
            spawn_thread("subprocess-stderr", Arc::clone(&shared), stderr_thread),
        ];

        Self { shared, threads }
    }

    /// Signals shutdown, kills any child, and joins the workers.
    pub fn shutdown(mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            kill_child_locked(&mut state);
            state.pid = -1;
            self.shared.child_spawned.notify_all();
        }
        // Unstick a writer blocked on its inbox: drop a dummy through,
        // then close.
        self.shared.inbox.enqueue_priority(Message::default());
        self.shared.inbox.close();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SubprocessDelegator {
    fn drop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        kill_child_locked(&mut state);
        state.pid = -1;
        self.shared.child_spawned.notify_all();
        drop(state);
        self.shared.inbox.close();
    }
}

fn spawn_thread(
    name: &str,
    shared: Arc<Shared>,
    body: fn(&Shared),
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&shared))
        .expect("spawning subprocess worker thread")
}

/// Writer: drains the dedicated inbox and feeds frames to the child's
/// stdin, starting the child on demand.
fn writer_thread(shared: &Shared) {
    loop {
        let batch = shared.inbox.dequeue(1, MAX_FRAME_BYTES, true);
        if batch.is_empty() && shared.inbox.is_closed() {
            return;
        }
        for message in batch {
            if shutting_down(shared) {
                return;
            }
            if message.is_sentinel() {
                continue;
            }

            let frame = encode_frame(&message.encode_to_vec());
            if frame.len() > 4 + MAX_FRAME_BYTES {
                warn!(size = frame.len(), "outbound frame exceeds bound, dropped");
                continue;
            }
            write_frame(shared, &frame);
        }
    }
}

/// Writes one frame, spawning the child first when necessary. A failed
/// write kills the child and drops the frame.
fn write_frame(shared: &Shared, frame: &[u8]) {
    let stdin = {
        let mut state = shared.state.lock().unwrap();
        loop {
            if state.pid == -1 {
                return;
            }
            if state.pid == 0 {
                match spawn_child_locked(shared, &mut state) {
                    Ok(()) => shared.child_spawned.notify_all(),
                    Err(error) => {
                        warn!(%error, "helper spawn failed, backing off");
                        drop(state);
                        std::thread::sleep(SPAWN_BACKOFF);
                        state = shared.state.lock().unwrap();
                        continue;
                    }
                }
            }
            match state.stdin.take() {
                Some(stdin) => break stdin,
                // Another thread is resetting the child; retry.
                None => {
                    state = shared
                        .child_spawned
                        .wait_timeout(state, Duration::from_millis(100))
                        .unwrap()
                        .0;
                }
            }
        }
    };

    let mut stdin = stdin;
    let outcome = stdin.write_all(frame).and_then(|()| stdin.flush());

    let mut state = shared.state.lock().unwrap();
    match outcome {
        Ok(()) => {
            if state.pid > 0 {
                state.stdin = Some(stdin);
            }
        }
        Err(error) => {
            info!(%error, "write to helper failed, resetting child");
            kill_child_locked(&mut state);
        }
    }
}

/// Reader: parses frames off the child's stdout and pushes the decoded
/// messages to the outbox.
fn reader_thread(shared: &Shared) {
    loop {
        let Some(stdout) = wait_for_stream(shared, |state| state.stdout.take()) else {
            return;
        };
        let mut stdout = stdout;

        loop {
            match read_frame(&mut stdout) {
                Ok(Some(payload)) => match Message::decode(payload.as_slice()) {
                    Ok(message) => shared.outbox.enqueue(message),
                    Err(error) => debug!(%error, "undecodable frame from helper, skipped"),
                },
                Ok(None) => {
                    // Zero-length frame: tolerated no-op.
                }
                Err(error) => {
                    info!(%error, "read from helper failed, resetting child");
                    let mut state = shared.state.lock().unwrap();
                    kill_child_locked(&mut state);
                    break;
                }
            }
        }
    }
}

/// Stderr: forwards the child's log lines.
fn stderr_thread(shared: &Shared) {
    loop {
        let Some(stderr) = wait_for_stream(shared, |state| state.stderr.take()) else {
            return;
        };

        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            match line {
                Ok(line) => info!(target: "subprocess", "{line}"),
                Err(_) => break,
            }
        }
        // EOF or error: the child is gone or resetting; loop back and
        // wait for the next one.
    }
}

/// Blocks until a live child offers the requested stream, or shutdown.
fn wait_for_stream<T>(
    shared: &Shared,
    take: impl Fn(&mut ChildState) -> Option<T>,
) -> Option<T> {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.pid == -1 {
            return None;
        }
        if state.pid > 0 {
            if let Some(stream) = take(&mut state) {
                return Some(stream);
            }
        }
        state = shared.child_spawned.wait(state).unwrap();
    }
}

fn shutting_down(shared: &Shared) -> bool {
    shared.state.lock().unwrap().pid == -1
}

/// Spawns the configured helper with three pipes. Caller holds the state
/// lock.
fn spawn_child_locked(shared: &Shared, state: &mut ChildState) -> Result<(), DelegatorError> {
    reap_undead(state);
    if state.undead.len() > MAX_UNDEAD {
        return Err(DelegatorError::TooManyUndead);
    }

    let mut child = Command::new(&shared.spec.filename)
        .args(&shared.spec.argv)
        .envs(shared.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    state.pid = i32::try_from(child.id()).unwrap_or(0);
    state.stdin = child.stdin.take();
    state.stdout = child.stdout.take();
    state.stderr = child.stderr.take();
    state.child = Some(child);
    info!(pid = state.pid, "helper spawned");
    Ok(())
}

/// Kills the current child, if any: SIGTERM, up to 4 s, SIGKILL, up to
/// 1 s, then reap. A child that refuses to be reaped joins the undead
/// list and is retried opportunistically.
fn kill_child_locked(state: &mut ChildState) {
    if state.pid <= 0 {
        return;
    }
    let pid = state.pid;
    state.pid = 0;
    state.stdin = None;
    state.stdout = None;
    state.stderr = None;

    let Some(mut child) = state.child.take() else {
        return;
    };

    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    if !wait_for_exit(&mut child, TERM_WAIT) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        if !wait_for_exit(&mut child, KILL_WAIT) {
            warn!(pid, "helper not reaped, stashing as undead");
            state.undead.push(pid);
            return;
        }
    }
    debug!(pid, "helper reaped");
}

/// Polls for child exit up to `patience`.
fn wait_for_exit(child: &mut Child, patience: Duration) -> bool {
    let deadline = Instant::now() + patience;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return false,
        }
    }
}

/// Opportunistically reaps previously unkillable children. A pid stays on
/// the list only while `waitpid` reports it still alive.
fn reap_undead(state: &mut ChildState) {
    state.undead.retain(|&pid| {
        matches!(
            waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)),
            Ok(status) if status.pid().is_none()
        )
    });
}

/// Frames a payload with a little-endian `u32` size prefix.
fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&u32::try_from(payload.len()).unwrap_or(u32::MAX).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reads one frame. `Ok(None)` is a tolerated zero-length frame; a size
/// prefix above the bound is an error (the caller resets the child).
fn read_frame(reader: &mut impl Read) -> std::io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let size = u32::from_le_bytes(prefix) as usize;
    if size == 0 {
        return Ok(None);
    }
    if size > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame size {size} exceeds bound"),
        ));
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}
