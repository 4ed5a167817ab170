//! Hardware resource telemetry.
//!
//! A background thread samples the process's user/system CPU time once a
//! second and ships a `ClientStats` report when the picture changes by
//! more than five percentage points, or every ten seconds. Reporting only
//! starts once the client is enrolled, so the server never sees telemetry
//! from a stranger.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::libc;
use nix::sys::resource::{getrusage, UsageWho};
use outpost_core::queue::MessageQueue;
use outpost_core::wire::{ClientStats, Message, MessageType, Payload, Priority, STATS_SESSION_ID};
use prost::Message as _;
use tracing::{debug, warn};

/// Sampling cadence.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Change that forces a report, in percentage points.
const REPORT_DELTA_PERCENT: f64 = 5.0;

/// Maximum silence between reports.
const REPORT_MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Starts the sampler thread.
pub fn spawn(outbox: Arc<MessageQueue>, enrolled: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("stats".to_string())
        .spawn(move || run(&outbox, &enrolled))
        .expect("spawning the stats thread")
}

fn run(outbox: &MessageQueue, enrolled: &AtomicBool) {
    let mut previous_sample: Option<(CpuTimes, Instant)> = None;
    let mut last_report: Option<Report> = None;

    loop {
        std::thread::sleep(SAMPLE_INTERVAL);

        let now = Instant::now();
        let times = match cpu_times() {
            Ok(times) => times,
            Err(error) => {
                warn!(%error, "rusage sampling failed");
                continue;
            }
        };

        let Some((previous, sampled_at)) = previous_sample.replace((times, now)) else {
            continue;
        };

        let elapsed = now.duration_since(sampled_at).as_secs_f64();
        if elapsed <= 0.0 {
            continue;
        }
        let user_percent = (times.user_s - previous.user_s) / elapsed * 100.0;
        let system_percent = (times.system_s - previous.system_s) / elapsed * 100.0;

        if !enrolled.load(Ordering::SeqCst) {
            continue;
        }
        if !should_report(last_report.as_ref(), user_percent, system_percent, now) {
            continue;
        }

        let stats = ClientStats {
            user_cpu_percent: user_percent as f32,
            system_cpu_percent: system_percent as f32,
            rss_bytes: resident_bytes().unwrap_or(0),
            timestamp_us: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
                .unwrap_or(0),
        };
        debug!(user = user_percent, system = system_percent, "reporting client stats");

        outbox.enqueue(Message {
            session_id: STATS_SESSION_ID.to_string(),
            args_rdf_name: ClientStats::TYPE_NAME.to_string(),
            args: stats.encode_to_vec(),
            r#type: MessageType::Message as i32,
            priority: Priority::Normal as i32,
            ..Default::default()
        });

        last_report = Some(Report {
            user_percent,
            system_percent,
            at: now,
        });
    }
}

struct Report {
    user_percent: f64,
    system_percent: f64,
    at: Instant,
}

/// A report goes out on the first sample, on a >5-point move in either
/// direction, or after 10 quiet seconds.
fn should_report(last: Option<&Report>, user_percent: f64, system_percent: f64, now: Instant) -> bool {
    let Some(last) = last else {
        return true;
    };
    if (user_percent - last.user_percent).abs() > REPORT_DELTA_PERCENT {
        return true;
    }
    if (system_percent - last.system_percent).abs() > REPORT_DELTA_PERCENT {
        return true;
    }
    now.duration_since(last.at) > REPORT_MAX_INTERVAL
}

#[derive(Clone, Copy)]
struct CpuTimes {
    user_s: f64,
    system_s: f64,
}

fn cpu_times() -> Result<CpuTimes, nix::Error> {
    let usage = getrusage(UsageWho::RUSAGE_SELF)?;
    let user = usage.user_time();
    let system = usage.system_time();
    Ok(CpuTimes {
        user_s: user.tv_sec() as f64 + f64::from(user.tv_usec() as i32) / 1e6,
        system_s: system.tv_sec() as f64 + f64::from(system.tv_usec() as i32) / 1e6,
    })
}

/// Resident set size from `/proc/self/statm`.
fn resident_bytes() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * page_size())
}

fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf reads static system configuration and is
        // thread-safe.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u64::try_from(result).unwrap_or(4096)
    })
}
