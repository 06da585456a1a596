use std::collections::BTreeSet;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Longest sliding TTL accepted from `SESSION_TTL_SECONDS`: one week.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Extensions accepted by the upload endpoint when `ALLOWED_EXTENSIONS` is unset.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &["epub", "mobi", "azw", "azw3", "pdf", "txt"];

/// The application's configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The address the HTTP listener binds to.
    pub bind_addr: SocketAddr,
    /// Sliding session TTL. `None` disables TTL enforcement (`SESSION_TTL_SECONDS=0`).
    pub session_ttl: Option<Duration>,
    /// Upper bound on a single uploaded file, in bytes.
    pub max_file_bytes: u64,
    /// A sender not heard from for longer than this is considered gone.
    pub sender_gone_after: Duration,
    /// A receiver not heard from for longer than this is considered gone.
    pub receiver_gone_after: Duration,
    /// Interval clients are told to heartbeat at. Coupled with the gone thresholds.
    pub heartbeat_interval: Duration,
    /// How long a closed session stays queryable before it is purged.
    pub tombstone_retention: Duration,
    /// How often the liveness sweeper runs.
    pub sweep_interval: Duration,
    /// Delay between a completed download and the deletion of its blob.
    pub download_cleanup_grace: Duration,
    /// Root directory for per-session blob directories.
    pub upload_dir: PathBuf,
    /// Lowercase extensions (without the dot) accepted for upload.
    pub allowed_extensions: BTreeSet<String>,
    /// Public origin of the web frontend, used to build join links.
    pub frontend_base: Option<String>,
    /// Explicit origin override for the QR join link (scheme + host + port).
    pub force_qr_origin: Option<String>,
    /// Whether the static web root is served as the router fallback.
    pub serve_web: bool,
    /// Directory holding the static web frontend.
    pub public_dir: PathBuf,
    /// Maximum number of uploads/downloads touching the disk at once.
    pub max_concurrent_transfers: usize,
    /// Rate limiting of session creation, per client IP. `None` disables it.
    pub create_rate_limit: Option<RateLimit>,
}

/// Token-bucket parameters for the session creation routes.
#[derive(Clone, Copy, Debug)]
pub struct RateLimit {
    /// Seconds after which one request of quota is replenished.
    pub replenish_secs: u64,
    /// Requests allowed in a burst.
    pub burst: u32,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the validated `Config`.
    pub fn from_env() -> Result<Self> {
        let bind_ip: IpAddr = parse_or("BIND_ADDR", IpAddr::from([0, 0, 0, 0]))?;
        let port: u16 = parse_or("PORT", 3001)?;

        let ttl_secs: u64 = parse_or("SESSION_TTL_SECONDS", 300)?;
        let max_file_mb: u64 = parse_or("MAX_FILE_MB", 100)?;
        let max_file_bytes = max_file_mb
            .checked_mul(1024 * 1024)
            .context("MAX_FILE_MB is too large")?;

        let allowed_extensions = match env::var("ALLOWED_EXTENSIONS") {
            Ok(raw) => parse_extensions(&raw),
            Err(_) => DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        };

        let rate_limit_enabled = flag("RATE_LIMIT_ENABLED", true);
        let create_rate_limit = if rate_limit_enabled {
            Some(RateLimit {
                replenish_secs: parse_or("RATE_LIMIT_REPLENISH_SECS", 1)?,
                burst: parse_or("RATE_LIMIT_BURST", 20)?,
            })
        } else {
            None
        };

        let config = Self {
            bind_addr: SocketAddr::new(bind_ip, port),
            session_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
            max_file_bytes,
            sender_gone_after: Duration::from_secs(parse_or("SENDER_GONE_SECS", 30)?),
            receiver_gone_after: Duration::from_secs(parse_or("RECEIVER_GONE_SECS", 30)?),
            heartbeat_interval: Duration::from_secs(parse_or("HEARTBEAT_INTERVAL_SECS", 10)?),
            tombstone_retention: Duration::from_secs(parse_or("TOMBSTONE_SECS", 120)?),
            sweep_interval: Duration::from_secs(parse_or("SWEEP_INTERVAL_SECS", 5)?),
            download_cleanup_grace: Duration::from_secs(parse_or(
                "DOWNLOAD_CLEANUP_GRACE_SECS",
                0,
            )?),
            upload_dir: PathBuf::from(
                env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads/sessions".to_string()),
            ),
            allowed_extensions,
            frontend_base: non_empty("FRONTEND_BASE"),
            force_qr_origin: non_empty("FORCE_QR_ORIGIN"),
            serve_web: flag("SERVE_WEB", false),
            public_dir: PathBuf::from(
                env::var("PUBLIC_DIR").unwrap_or_else(|_| "web/public".to_string()),
            ),
            max_concurrent_transfers: parse_or("MAX_CONCURRENT_TRANSFERS", 64)?,
            create_rate_limit,
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks the relationships between timing constants.
    ///
    /// Clients heartbeat every `heartbeat_interval`; the server declares a role gone
    /// after `*_gone_after`. Each threshold must cover at least two missed beats so
    /// ordinary network jitter never reclaims a live session.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("HEARTBEAT_INTERVAL_SECS must be greater than 0");
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be greater than 0");
        }

        if self.session_ttl.is_some_and(|ttl| ttl > MAX_SESSION_TTL) {
            anyhow::bail!(
                "SESSION_TTL_SECONDS must not exceed {}",
                MAX_SESSION_TTL.as_secs()
            );
        }

        let min_gone = self.heartbeat_interval.saturating_mul(2);
        if self.sender_gone_after < min_gone {
            anyhow::bail!(
                "SENDER_GONE_SECS ({}s) must be at least twice HEARTBEAT_INTERVAL_SECS ({}s)",
                self.sender_gone_after.as_secs(),
                self.heartbeat_interval.as_secs()
            );
        }
        if self.receiver_gone_after < min_gone {
            anyhow::bail!(
                "RECEIVER_GONE_SECS ({}s) must be at least twice HEARTBEAT_INTERVAL_SECS ({}s)",
                self.receiver_gone_after.as_secs(),
                self.heartbeat_interval.as_secs()
            );
        }
        if self.sweep_interval >= self.tombstone_retention {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be shorter than TOMBSTONE_SECS");
        }
        if self.max_file_bytes == 0 {
            anyhow::bail!("MAX_FILE_MB must be greater than 0");
        }
        if self.allowed_extensions.is_empty() {
            anyhow::bail!("ALLOWED_EXTENSIONS must name at least one extension");
        }
        if self.max_concurrent_transfers == 0 {
            anyhow::bail!("MAX_CONCURRENT_TRANSFERS must be greater than 0");
        }

        Ok(())
    }

    /// Session TTL in whole seconds, `0` when disabled.
    pub fn ttl_secs(&self) -> i64 {
        self.session_ttl.map(|ttl| ttl.as_secs() as i64).unwrap_or(0)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            session_ttl: Some(Duration::from_secs(300)),
            max_file_bytes: 100 * 1024 * 1024,
            sender_gone_after: Duration::from_secs(30),
            receiver_gone_after: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            tombstone_retention: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(5),
            download_cleanup_grace: Duration::ZERO,
            upload_dir: PathBuf::from("uploads/sessions"),
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            frontend_base: None,
            force_qr_origin: None,
            serve_web: false,
            public_dir: PathBuf::from("web/public"),
            max_concurrent_transfers: 64,
            create_rate_limit: Some(RateLimit {
                replenish_secs: 1,
                burst: 20,
            }),
        }
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", key)),
        _ => Ok(default),
    }
}

fn flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

/// Parses a comma separated extension list (`".epub, PDF"` → `{"epub", "pdf"}`).
pub fn parse_extensions(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}
