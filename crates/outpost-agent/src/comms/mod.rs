//! Supervised connection loop.
//!
//! The network driver composes server discovery, certificate pinning,
//! request pacing with exponential back-off, bandwidth admission, lazy
//! enrolment, and delivery of decoded requests into the inbox. It runs on
//! the calling thread and does not return in a normal run.

pub mod admission;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use outpost_core::config::ClientConfig;
use outpost_core::crypto::{Certificate, CsrBuilder};
use outpost_core::nanny::{sleep_with_heartbeat, Heartbeat, NannyStore};
use outpost_core::queue::MessageQueue;
use outpost_core::session::{NonceGenerator, SecureSession};
use outpost_core::wire::{
    CertificateBlob, CertificateType, DataBlob, Message, MessageType, Payload, Priority,
    API_VERSION, ENROLMENT_SESSION_ID, FOREMAN_SESSION_ID, NANNY_SESSION_ID,
};
use prost::Message as _;
use tracing::{debug, info, warn};

use self::admission::AdmissionController;

/// Hold-off after a failed cycle.
const FAILURE_HOLDOFF: Duration = Duration::from_secs(5);

/// Back-off parameters for quiet periods: `min(cap, base * factor^n)`.
const BACKOFF_BASE_MS: f64 = 200.0;
const BACKOFF_FACTOR: f64 = 1.05;
const BACKOFF_CAP_MS: f64 = 600_000.0;

/// Outbox drain bounds per cycle.
const DRAIN_MAX_COUNT: usize = 1_000;
const DRAIN_MAX_BYTES: usize = 1_000_000;

/// Minimum spacing between enrolment attempts.
const ENROLMENT_HOLDOFF: Duration = Duration::from_secs(600);

/// Spacing between foreman probes.
const FOREMAN_CHECK_FREQUENCY: Duration = Duration::from_secs(1_800);

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Pre-POST delay for a cycle, per the pacing policy.
#[must_use]
pub fn backoff_delay_ms(no_activity_count: u32) -> u64 {
    let delay = BACKOFF_BASE_MS * BACKOFF_FACTOR.powi(no_activity_count as i32);
    delay.min(BACKOFF_CAP_MS) as u64
}

/// A discovered, pinned server endpoint plus its session state.
struct Connection {
    control_url: String,
    proxy: String,
    client: reqwest::blocking::Client,
    session: SecureSession,
}

/// The network driver.
pub struct ConnectionLoop {
    config: Arc<ClientConfig>,
    outbox: Arc<MessageQueue>,
    inbox: Arc<MessageQueue>,
    heartbeat: Arc<dyn Heartbeat>,
    nanny_store: Option<Arc<dyn NannyStore>>,
    enrolled: Arc<AtomicBool>,

    admission: AdmissionController,
    nonce: NonceGenerator,
    current: Option<Connection>,

    /// Messages pulled from the outbox but not yet confirmed delivered.
    to_send: Vec<Message>,
    last_enrolment: Option<Instant>,
    last_foreman_check: Option<Instant>,
    no_activity_count: u32,
    last_cycle_failed: bool,
}

impl ConnectionLoop {
    /// Builds the driver over externally-owned collaborators.
    pub fn new(
        config: Arc<ClientConfig>,
        outbox: Arc<MessageQueue>,
        inbox: Arc<MessageQueue>,
        heartbeat: Arc<dyn Heartbeat>,
        nanny_store: Option<Arc<dyn NannyStore>>,
        enrolled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            outbox,
            inbox,
            heartbeat,
            nanny_store,
            enrolled,
            admission: AdmissionController::new(),
            nonce: NonceGenerator::new(),
            current: None,
            to_send: Vec::new(),
            last_enrolment: None,
            last_foreman_check: None,
            no_activity_count: 0,
            last_cycle_failed: false,
        }
    }

    /// Drives cycles forever. Only a fatal setup error returns.
    ///
    /// # Errors
    ///
    /// Never in a normal run; the loop recovers from transport failures
    /// internally.
    pub fn run(&mut self) -> anyhow::Result<()> {
        info!("connection loop starting");
        loop {
            self.forward_nanny_message();
            self.maybe_check_foreman();
            self.run_cycle();
        }
    }

    /// One discovery/drain/POST/decode cycle.
    fn run_cycle(&mut self) {
        let delay = if self.last_cycle_failed {
            FAILURE_HOLDOFF
        } else {
            Duration::from_millis(backoff_delay_ms(self.no_activity_count))
        };
        sleep_with_heartbeat(delay, &*self.heartbeat);

        if self.current.is_none() && !self.establish_connection() {
            self.last_cycle_failed = true;
            return;
        }

        if self.to_send.is_empty() {
            self.to_send = self.outbox.dequeue(DRAIN_MAX_COUNT, DRAIN_MAX_BYTES, false);
        }

        if !self.admission.wait_to_send(&self.to_send, &*self.heartbeat) {
            // Intentional drop: these messages are not persisted.
            info!(dropped = self.to_send.len(), "admission control refused the batch");
            self.to_send.clear();
            return;
        }

        self.post_and_process();
    }

    /// Encodes `to_send`, POSTs it, and handles the response.
    fn post_and_process(&mut self) {
        let Some(connection) = &self.current else {
            self.last_cycle_failed = true;
            return;
        };

        let nonce = self.nonce.next();
        let queue_size = self.inbox.current_count() as u64;
        let body = match connection.session.encode(&self.to_send, nonce, queue_size) {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, "envelope encode failed, rebuilding session");
                self.current = None;
                self.last_cycle_failed = true;
                return;
            }
        };

        let url = format!("{}?api={}", connection.control_url, API_VERSION);
        let sent_bytes = body.len();
        debug!(
            url = %url,
            proxy = %connection.proxy,
            bytes = sent_bytes,
            batch = self.to_send.len(),
            "posting batch"
        );
        let response = connection
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "binary/octet-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .body(body)
            .send();

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                info!(%url, %error, "POST failed");
                self.current = None;
                self.last_cycle_failed = true;
                return;
            }
        };

        match response.status().as_u16() {
            406 => {
                // The server does not know this client yet.
                self.initiate_enrolment();
                self.last_cycle_failed = true;
            }
            200 => {
                let data = match response.bytes() {
                    Ok(data) => data,
                    Err(error) => {
                        info!(%error, "response read failed");
                        self.current = None;
                        self.last_cycle_failed = true;
                        return;
                    }
                };
                self.handle_response_body(&data, nonce, sent_bytes);
            }
            status => {
                info!(status, "unexpected HTTP status");
                self.last_cycle_failed = true;
            }
        }
    }

    fn handle_response_body(&mut self, data: &[u8], nonce: u64, sent_bytes: usize) {
        let Some(connection) = &self.current else {
            self.last_cycle_failed = true;
            return;
        };

        let messages = match connection.session.decode(data, nonce) {
            Ok(messages) => messages,
            Err(error) => {
                info!(%error, "response decode failed, rebuilding session");
                self.current = None;
                self.last_cycle_failed = true;
                return;
            }
        };

        let sent_count = self.to_send.len();
        self.to_send.clear();

        let received_count = messages.len();
        for message in messages {
            self.inbox.enqueue(message);
        }

        if sent_count > 0 || received_count > 0 {
            self.no_activity_count = 0;
        } else {
            self.no_activity_count = self.no_activity_count.saturating_add(1);
        }
        self.last_cycle_failed = false;

        if !self.enrolled.swap(true, Ordering::SeqCst) {
            info!("first successful exchange, telemetry enabled");
        }
        debug!(
            sent = sent_count,
            sent_bytes,
            received = received_count,
            quiet_cycles = self.no_activity_count,
            "exchange complete"
        );
    }

    /// Walks `control_urls x (proxies + direct)` until a server
    /// certificate pins.
    fn establish_connection(&mut self) -> bool {
        let urls = self.config.control_urls();
        let mut proxies = self.config.proxy_servers();
        proxies.push(String::new());

        for url in &urls {
            for proxy in &proxies {
                match self.try_connect(url, proxy) {
                    Ok(connection) => {
                        info!(url = %url, proxy = %proxy, "server certificate pinned");
                        self.current = Some(connection);
                        return true;
                    }
                    Err(error) => {
                        debug!(url = %url, proxy = %proxy, %error, "discovery attempt failed");
                    }
                }
            }
        }
        info!("no control server reachable");
        false
    }

    /// One discovery probe: fetch and verify `server.pem`, then build a
    /// session towards it.
    fn try_connect(&self, control_url: &str, proxy: &str) -> anyhow::Result<Connection> {
        let client = build_client(proxy)?;

        let pem_url = format!("{}/server.pem", dirname(control_url));
        let response = client
            .get(&pem_url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .with_context(|| format!("fetching {pem_url}"))?;
        if response.status().as_u16() != 200 {
            anyhow::bail!("discovery returned HTTP {}", response.status());
        }
        let body = response.text().context("reading discovery body")?;
        if !body.contains("BEGIN CERTIFICATE") {
            // Captive portals happily return 200 for anything.
            anyhow::bail!("discovery body contains no certificate");
        }

        let server_certificate =
            Certificate::from_pem(body.as_bytes()).context("parsing server certificate")?;
        let ca = self.config.ca_certificate();
        if !ca.verify(&server_certificate)? {
            anyhow::bail!("server certificate is not signed by the configured CA");
        }

        let serial = server_certificate.serial_number()?;
        if !self.config.check_update_server_serial(serial) {
            anyhow::bail!("server certificate serial {serial} is older than the last seen one");
        }

        let key = self.config.ensure_private_key()?;
        let client_id = self
            .config
            .client_id()
            .context("client id unavailable after key setup")?;
        let session = SecureSession::new(&client_id, &key, &server_certificate)?;

        Ok(Connection {
            control_url: control_url.to_string(),
            proxy: proxy.to_string(),
            client,
            session,
        })
    }

    /// Queues a priority CSR message, at most once per ten minutes.
    fn initiate_enrolment(&mut self) {
        let now = Instant::now();
        if self
            .last_enrolment
            .is_some_and(|at| now.duration_since(at) < ENROLMENT_HOLDOFF)
        {
            return;
        }

        match build_enrolment_message(&self.config) {
            Ok(message) => {
                info!("sending enrolment request");
                self.outbox.enqueue_priority(message);
                self.last_enrolment = Some(now);
            }
            Err(error) => warn!(%error, "enrolment request construction failed"),
        }
    }

    /// Forwards a pending supervisor message to the server, one-shot.
    ///
    /// Enqueueing from the draining thread must never block, so the
    /// message simply stays in the store until the outbox has room.
    fn forward_nanny_message(&mut self) {
        let Some(store) = &self.nanny_store else {
            return;
        };
        let Some(text) = store.nanny_message() else {
            return;
        };
        if self.outbox.try_enqueue(nanny_blob(&text)) {
            if let Err(error) = store.clear_nanny_message() {
                warn!(%error, "failed to clear nanny message");
            }
        }
    }

    /// Periodically asks the server whether any scheduled work is waiting
    /// for this client.
    fn maybe_check_foreman(&mut self) {
        let now = Instant::now();
        if self
            .last_foreman_check
            .is_some_and(|at| now.duration_since(at) < FOREMAN_CHECK_FREQUENCY)
        {
            return;
        }
        let probe = Message {
            session_id: FOREMAN_SESSION_ID.to_string(),
            args_rdf_name: DataBlob::TYPE_NAME.to_string(),
            args: DataBlob::default().encode_to_vec(),
            r#type: MessageType::Message as i32,
            priority: Priority::Normal as i32,
            ..Default::default()
        };
        // A full outbox means there is plenty to say already; skip the
        // probe rather than block the draining thread.
        if self.outbox.try_enqueue(probe) {
            self.last_foreman_check = Some(now);
        }
    }
}

/// Builds the enrolment message: a CSR whose subject CN is the client id,
/// carried on the enrolment session. Generates and persists a private key
/// when none exists yet.
///
/// # Errors
///
/// Fails when key setup or CSR construction fails.
pub fn build_enrolment_message(config: &ClientConfig) -> anyhow::Result<Message> {
    let key = config.ensure_private_key()?;
    let client_id = config
        .client_id()
        .context("client id unavailable after key setup")?;

    let mut csr = CsrBuilder::new()?;
    csr.set_public_key(&key)?;
    csr.set_subject(&client_id)?;
    csr.sign(&key)?;

    let blob = CertificateBlob {
        r#type: CertificateType::Csr as i32,
        pem: csr.to_pem()?,
    };

    Ok(Message {
        session_id: ENROLMENT_SESSION_ID.to_string(),
        args_rdf_name: CertificateBlob::TYPE_NAME.to_string(),
        args: blob.encode_to_vec(),
        r#type: MessageType::Message as i32,
        priority: Priority::Priority as i32,
        ..Default::default()
    })
}

fn nanny_blob(text: &str) -> Message {
    let blob = DataBlob {
        string: text.to_string(),
    };
    Message {
        session_id: NANNY_SESSION_ID.to_string(),
        args_rdf_name: DataBlob::TYPE_NAME.to_string(),
        args: blob.encode_to_vec(),
        r#type: MessageType::Message as i32,
        priority: Priority::Normal as i32,
        ..Default::default()
    }
}

/// HTTP client for one proxy choice; the empty string means direct.
fn build_client(proxy: &str) -> anyhow::Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder().timeout(HTTP_TIMEOUT);
    if proxy.is_empty() {
        builder = builder.no_proxy();
    } else {
        builder = builder.proxy(reqwest::Proxy::all(proxy).context("invalid proxy URL")?);
    }
    builder.build().context("building HTTP client")
}

/// Everything before the last path segment, as in POSIX `dirname`.
fn dirname(url: &str) -> &str {
    url.rsplit_once('/').map_or(url, |(dir, _)| dir)
}
