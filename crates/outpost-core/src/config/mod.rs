//! Client configuration and write-back.
//!
//! Configuration lives in a field-per-line text file. Loading is two-pass:
//! the base file first, then the writeback overlay when the base names a
//! writeback file that exists. Only two fields are ever written back: the
//! client private key and the last-seen server certificate serial. The
//! config mutex is never held across disk writes; a poisoned mutex means
//! another thread panicked and the process is already lost.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::crypto::{self, Certificate, CryptoError, DigestAlgorithm, RsaKey};

/// Configuration errors. Load failures are fatal at startup; write-back
/// failures after a successful load are logged and the in-memory state
/// stays authoritative.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config file could not be read or written.
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line did not parse.
    #[error("config parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// No control URL was configured.
    #[error("config contains no control URL")]
    MissingControlUrl,

    /// The CA certificate was missing or unparseable.
    #[error("config CA certificate is missing or invalid")]
    InvalidCaCertificate,

    /// A key operation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Helper subprocess description.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Executable path.
    pub filename: PathBuf,
    /// Arguments, not including the executable.
    pub argv: Vec<String>,
    /// Extra environment entries.
    pub env: Vec<(String, String)>,
}

/// The thread-safe client configuration.
pub struct ClientConfig {
    base_path: PathBuf,
    inner: Mutex<State>,
}

struct State {
    control_urls: Vec<String>,
    proxy_servers: Vec<String>,
    ca_certificate: Certificate,
    private_key: Option<RsaKey>,
    private_key_pem: Option<String>,
    writeback_path: Option<PathBuf>,
    last_server_cert_serial: u64,
    temporary_directory: Option<PathBuf>,
    subprocess: Option<SubprocessConfig>,
}

impl ClientConfig {
    /// Loads configuration from `path`, overlaying its writeback file when
    /// one is configured and present.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable, unparseable, names no control
    /// URL, or carries no valid CA certificate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base_path = path.as_ref().to_path_buf();
        let text = fs::read_to_string(&base_path).map_err(|source| ConfigError::Io {
            path: base_path.clone(),
            source,
        })?;
        let mut raw = RawConfig::parse(&text)?;

        if let Some(writeback) = raw.writeback_filename.clone() {
            let writeback_path = Path::new(&writeback);
            if writeback_path.exists() {
                let overlay_text =
                    fs::read_to_string(writeback_path).map_err(|source| ConfigError::Io {
                        path: writeback_path.to_path_buf(),
                        source,
                    })?;
                raw.merge(RawConfig::parse(&overlay_text)?);
            }
        }

        if raw.control_urls.is_empty() {
            return Err(ConfigError::MissingControlUrl);
        }

        let ca_certificate = raw
            .ca_cert_pem
            .as_deref()
            .and_then(|pem| Certificate::from_pem(pem.as_bytes()).ok())
            .ok_or(ConfigError::InvalidCaCertificate)?;

        // An unparseable key is treated as absent; a fresh one is minted on
        // first need, exactly as on a clean install.
        let private_key = match raw.client_private_key_pem.as_deref() {
            Some(pem) => match RsaKey::from_pem(pem.as_bytes()) {
                Ok(key) => Some(key),
                Err(error) => {
                    warn!(%error, "configured private key is invalid, will regenerate");
                    None
                }
            },
            None => None,
        };
        let private_key_pem = private_key
            .as_ref()
            .and_then(|key| key.to_pem().ok());

        let subprocess = raw.subprocess_filename.as_ref().map(|filename| {
            SubprocessConfig {
                filename: PathBuf::from(filename),
                argv: raw.subprocess_args.clone(),
                env: raw
                    .subprocess_env
                    .iter()
                    .filter_map(|entry| {
                        entry
                            .split_once('=')
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                    })
                    .collect(),
            }
        });

        Ok(Self {
            base_path,
            inner: Mutex::new(State {
                control_urls: raw.control_urls,
                proxy_servers: raw.proxy_servers,
                ca_certificate,
                private_key,
                private_key_pem,
                writeback_path: raw.writeback_filename.map(PathBuf::from),
                last_server_cert_serial: raw.last_server_cert_serial.unwrap_or(0),
                temporary_directory: raw.temporary_directory.map(PathBuf::from),
                subprocess,
            }),
        })
    }

    /// Configured control URLs, in preference order.
    #[must_use]
    pub fn control_urls(&self) -> Vec<String> {
        self.inner.lock().unwrap().control_urls.clone()
    }

    /// Configured proxy servers, in preference order.
    #[must_use]
    pub fn proxy_servers(&self) -> Vec<String> {
        self.inner.lock().unwrap().proxy_servers.clone()
    }

    /// The CA certificate used to pin server certificates.
    #[must_use]
    pub fn ca_certificate(&self) -> Certificate {
        self.inner.lock().unwrap().ca_certificate.clone()
    }

    /// Configured temporary directory, if any.
    #[must_use]
    pub fn temporary_directory(&self) -> Option<PathBuf> {
        self.inner.lock().unwrap().temporary_directory.clone()
    }

    /// Helper subprocess description, if configured.
    #[must_use]
    pub fn subprocess(&self) -> Option<SubprocessConfig> {
        self.inner.lock().unwrap().subprocess.clone()
    }

    /// Last server certificate serial accepted by this client.
    #[must_use]
    pub fn last_server_cert_serial(&self) -> u64 {
        self.inner.lock().unwrap().last_server_cert_serial
    }

    /// The client id, derived from the current private key. `None` until a
    /// key exists.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .private_key
            .as_ref()
            .and_then(|key| derive_client_id(key).ok())
    }

    /// Returns the private key, generating and persisting a fresh one on
    /// first use.
    ///
    /// # Errors
    ///
    /// Fails only if key generation itself fails; a write-back failure is
    /// logged and the in-memory key stays authoritative.
    pub fn ensure_private_key(&self) -> Result<RsaKey, ConfigError> {
        {
            let inner = self.inner.lock().unwrap();
            if let Some(key) = &inner.private_key {
                return Ok(key.clone());
            }
        }
        self.install_fresh_key()
    }

    /// Generates a fresh keypair, recomputes the client id, and writes
    /// back.
    ///
    /// # Errors
    ///
    /// Fails only if key generation fails.
    pub fn reset_key(&self) -> Result<(), ConfigError> {
        self.install_fresh_key().map(|_| ())
    }

    fn install_fresh_key(&self) -> Result<RsaKey, ConfigError> {
        let key = RsaKey::generate()?;
        let pem = key.to_pem()?;

        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            inner.private_key = Some(key.clone());
            inner.private_key_pem = Some(pem);
            self.snapshot(&inner)
        };
        if let Ok(id) = derive_client_id(&key) {
            info!(client_id = %id, "new client key installed");
        }
        self.write_back(&snapshot);
        Ok(key)
    }

    /// Updates the last-seen server certificate serial.
    ///
    /// Returns `false` (without touching state) when `serial` is lower than
    /// the recorded one; an equal serial is a no-op success; a higher one
    /// is recorded and written back.
    #[must_use]
    pub fn check_update_server_serial(&self, serial: u64) -> bool {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            if serial < inner.last_server_cert_serial {
                return false;
            }
            if serial == inner.last_server_cert_serial {
                return true;
            }
            info!(serial, "server certificate serial updated");
            inner.last_server_cert_serial = serial;
            self.snapshot(&inner)
        };
        self.write_back(&snapshot);
        true
    }

    fn snapshot(&self, inner: &State) -> WritebackSnapshot {
        WritebackSnapshot {
            writeback_path: inner.writeback_path.clone(),
            private_key_pem: inner.private_key_pem.clone(),
            last_server_cert_serial: inner.last_server_cert_serial,
        }
    }

    /// Persists the mutable fields. The delta against the base file is
    /// recomputed from disk so the writeback only ever carries fields that
    /// actually diverge.
    fn write_back(&self, snapshot: &WritebackSnapshot) {
        let Some(writeback_path) = &snapshot.writeback_path else {
            // Persistence disabled.
            return;
        };

        let base = fs::read_to_string(&self.base_path)
            .ok()
            .and_then(|text| RawConfig::parse(&text).ok())
            .unwrap_or_default();

        let mut out = String::new();
        if let Some(pem) = &snapshot.private_key_pem {
            if base.client_private_key_pem.as_deref() != Some(pem.as_str()) {
                out.push_str("client_private_key_pem: ");
                out.push_str(pem.trim_end());
                out.push('\n');
            }
        }
        if base.last_server_cert_serial.unwrap_or(0) != snapshot.last_server_cert_serial {
            out.push_str(&format!(
                "last_server_cert_serial_number: {}\n",
                snapshot.last_server_cert_serial
            ));
        }

        if let Err(error) = fs::write(writeback_path, out) {
            warn!(path = %writeback_path.display(), %error, "write-back failed");
        }
    }
}

/// Derives the stable client identifier from a private key.
///
/// # Errors
///
/// Fails if the public modulus cannot be extracted or hashed.
pub fn derive_client_id(key: &RsaKey) -> Result<String, CryptoError> {
    let mpi = key.public_key_n_mpi()?;
    let digest = crypto::hash(DigestAlgorithm::Sha256, &mpi)?;
    Ok(format!("C.{}", crypto::hex_lower(&digest[..8])))
}

struct WritebackSnapshot {
    writeback_path: Option<PathBuf>,
    private_key_pem: Option<String>,
    last_server_cert_serial: u64,
}

/// Raw key/value view of one config file.
#[derive(Debug, Default)]
struct RawConfig {
    control_urls: Vec<String>,
    proxy_servers: Vec<String>,
    ca_cert_pem: Option<String>,
    client_private_key_pem: Option<String>,
    writeback_filename: Option<String>,
    last_server_cert_serial: Option<u64>,
    temporary_directory: Option<String>,
    subprocess_filename: Option<String>,
    subprocess_args: Vec<String>,
    subprocess_env: Vec<String>,
}

impl RawConfig {
    /// Parses `key: value` lines. A value opening a PEM block
    /// (`-----BEGIN ...`) swallows the following lines through the
    /// matching `-----END` line.
    fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut raw = Self::default();
        let mut lines = text.lines().enumerate();

        while let Some((index, line)) = lines.next() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (key, value) = trimmed.split_once(':').ok_or_else(|| ConfigError::Parse {
                line: index + 1,
                reason: format!("expected 'key: value', got {trimmed:?}"),
            })?;
            let key = key.trim();
            let mut value = value.trim().to_string();

            if value.starts_with("-----BEGIN") {
                for (pem_index, pem_line) in lines.by_ref() {
                    value.push('\n');
                    value.push_str(pem_line);
                    if pem_line.trim_start().starts_with("-----END") {
                        break;
                    }
                    if pem_index > index + 200 {
                        return Err(ConfigError::Parse {
                            line: index + 1,
                            reason: "unterminated PEM block".to_string(),
                        });
                    }
                }
                value.push('\n');
            }

            match key {
                "control_url" => raw.control_urls.push(value),
                "proxy_server" => raw.proxy_servers.push(value),
                "ca_cert_pem" => raw.ca_cert_pem = Some(value),
                "client_private_key_pem" => raw.client_private_key_pem = Some(value),
                "writeback_filename" => raw.writeback_filename = Some(value),
                "last_server_cert_serial_number" => {
                    let serial = value.parse::<u64>().map_err(|_| ConfigError::Parse {
                        line: index + 1,
                        reason: format!("invalid serial number {value:?}"),
                    })?;
                    raw.last_server_cert_serial = Some(serial);
                }
                "temporary_directory" => raw.temporary_directory = Some(value),
                "subprocess_filename" => raw.subprocess_filename = Some(value),
                "subprocess_arg" => raw.subprocess_args.push(value),
                "subprocess_env" => raw.subprocess_env.push(value),
                other => {
                    return Err(ConfigError::Parse {
                        line: index + 1,
                        reason: format!("unknown field {other:?}"),
                    })
                }
            }
        }
        Ok(raw)
    }

    /// Overlays `other` on top of `self`; scalars replace, lists replace
    /// when non-empty.
    fn merge(&mut self, other: Self) {
        if !other.control_urls.is_empty() {
            self.control_urls = other.control_urls;
        }
        if !other.proxy_servers.is_empty() {
            self.proxy_servers = other.proxy_servers;
        }
        if other.ca_cert_pem.is_some() {
            self.ca_cert_pem = other.ca_cert_pem;
        }
        if other.client_private_key_pem.is_some() {
            self.client_private_key_pem = other.client_private_key_pem;
        }
        if other.last_server_cert_serial.is_some() {
            self.last_server_cert_serial = other.last_server_cert_serial;
        }
        if other.temporary_directory.is_some() {
            self.temporary_directory = other.temporary_directory;
        }
        if other.subprocess_filename.is_some() {
            self.subprocess_filename = other.subprocess_filename;
            self.subprocess_args = other.subprocess_args;
            self.subprocess_env = other.subprocess_env;
        }
        // The writeback path itself never comes from the overlay.
    }
}
