//! Network admission control.
//!
//! Outbound batches pass through a per-interface-class token bucket before
//! they hit the wire. The active interface is classified from well-known
//! interface names with a short-lived cache; each class refills at a rate
//! sized for a monthly budget (Ethernet ≈ 200 GB, WLAN ≈ 2 GB, mobile
//! ≈ 200 MB). A batch that would require more than 60 seconds of token
//! accumulation is refused and the caller drops it.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use outpost_core::nanny::{sleep_with_heartbeat, Heartbeat};
use outpost_core::wire::Message;
use prost::Message as _;
use tracing::debug;

/// Serialization overhead factor covering HTTP and envelope framing.
const OVERHEAD_FACTOR: f64 = 1.20;

/// Longest the controller will sleep to accumulate tokens.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// How long one interface classification stays valid.
const CLASS_CACHE: Duration = Duration::from_secs(5);

/// Interface classes with distinct bandwidth budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkClass {
    Ethernet,
    Wlan,
    Mobile,
}

impl LinkClass {
    /// Refill rate in bytes per millisecond.
    const fn refill_rate(self) -> f64 {
        match self {
            Self::Ethernet => 100.0,
            Self::Wlan => 1.0,
            Self::Mobile => 0.1,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Ethernet => 0,
            Self::Wlan => 1,
            Self::Mobile => 2,
        }
    }
}

/// Interface names probed for classification, most preferred first.
const KNOWN_INTERFACES: &[(&str, LinkClass)] = &[
    ("en0", LinkClass::Ethernet),
    ("em1", LinkClass::Ethernet),
    ("wlan0", LinkClass::Wlan),
];

#[derive(Debug, Clone, Copy)]
struct Bucket {
    bandwidth_left: f64,
    last_updated_ms: u64,
}

/// The outcome of charging a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Charge {
    /// Tokens were available and have been deducted.
    Granted,
    /// The caller must wait this long for tokens to accumulate.
    SleepMs(u64),
}

/// Token-bucket admission controller over the three link classes.
pub struct AdmissionController {
    buckets: [Bucket; 3],
    cached_class: Option<(LinkClass, Instant)>,
    epoch: Instant,
    sysfs_root: PathBuf,
}

impl AdmissionController {
    /// Creates a controller with empty buckets.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sysfs_root(PathBuf::from("/sys/class/net"))
    }

    /// Test entry point with a relocated sysfs tree.
    #[must_use]
    pub fn with_sysfs_root(sysfs_root: PathBuf) -> Self {
        Self {
            buckets: [Bucket {
                bandwidth_left: 0.0,
                last_updated_ms: 0,
            }; 3],
            cached_class: None,
            epoch: Instant::now(),
            sysfs_root,
        }
    }

    /// Admits or refuses an outbound batch.
    ///
    /// Deducts the batch's estimated wire size when tokens suffice;
    /// otherwise sleeps until they do, refusing outright when the sleep
    /// would exceed 60 seconds.
    pub fn wait_to_send(&mut self, batch: &[Message], heartbeat: &dyn Heartbeat) -> bool {
        let estimated = estimated_bytes(batch);
        let class = self.classify(Instant::now());
        let now_ms = self.now_ms();

        match Self::charge(&mut self.buckets[class.index()], class.refill_rate(), estimated, now_ms)
        {
            Charge::Granted => true,
            Charge::SleepMs(sleep_ms) => {
                if sleep_ms > MAX_SLEEP.as_millis() as u64 {
                    debug!(estimated, ?class, sleep_ms, "batch refused by admission control");
                    return false;
                }
                sleep_with_heartbeat(Duration::from_millis(sleep_ms), heartbeat);
                let now_ms = self.now_ms();
                // After the computed sleep the bucket covers the batch;
                // deduct whatever accumulated.
                let bucket = &mut self.buckets[class.index()];
                Self::refill(bucket, class.refill_rate(), now_ms);
                bucket.bandwidth_left = (bucket.bandwidth_left - estimated).max(0.0);
                true
            }
        }
    }

    /// Classifies the active interface, caching the answer for 5 seconds.
    fn classify(&mut self, now: Instant) -> LinkClass {
        if let Some((class, at)) = self.cached_class {
            if now.duration_since(at) < CLASS_CACHE {
                return class;
            }
        }

        let mut class = LinkClass::Mobile;
        for (name, candidate) in KNOWN_INTERFACES {
            let operstate = self.sysfs_root.join(name).join("operstate");
            if let Ok(state) = fs::read_to_string(&operstate) {
                if state.trim() == "up" {
                    class = *candidate;
                    break;
                }
            }
        }

        self.cached_class = Some((class, now));
        class
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn refill(bucket: &mut Bucket, rate: f64, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(bucket.last_updated_ms);
        bucket.bandwidth_left += elapsed as f64 * rate;
        bucket.last_updated_ms = now_ms;
    }

    /// Refills and charges a bucket; pure with respect to the clock.
    fn charge(bucket: &mut Bucket, rate: f64, estimated: f64, now_ms: u64) -> Charge {
        Self::refill(bucket, rate, now_ms);
        if bucket.bandwidth_left >= estimated {
            bucket.bandwidth_left -= estimated;
            return Charge::Granted;
        }
        let shortfall = estimated - bucket.bandwidth_left;
        Charge::SleepMs((shortfall / rate).ceil() as u64)
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}

/// Estimated wire bytes for a batch: serialized size plus HTTP overhead.
fn estimated_bytes(batch: &[Message]) -> f64 {
    let serialized: usize = batch.iter().map(prost::Message::encoded_len).sum();
    serialized as f64 * OVERHEAD_FACTOR
}
