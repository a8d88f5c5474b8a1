//! Server configuration.
//!
//! Every recognized option can be set through the environment
//! (`KEYQUARRY_*`), and the common ones are also exposed as CLI flags by
//! the binary. Durations accept `300ms`, `10s`, `5m`, `1h30m` or a bare
//! number of seconds.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::HashAlgorithm;
use crate::DEFAULT_RESERVED_PREFIX;

/// Address the wire protocol listens on: `tcp://host:port` or
/// `unix:///path/to.sock`. A bare `host:port` is treated as TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(String),
    Unix(PathBuf),
}

impl ListenAddress {
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::InvalidArgument(
                    "empty unix socket path".to_string(),
                ));
            }
            return Ok(ListenAddress::Unix(PathBuf::from(path)));
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        if addr.is_empty() {
            return Err(Error::InvalidArgument("empty listen address".to_string()));
        }
        Ok(ListenAddress::Tcp(addr.to_string()))
    }
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddress::Tcp(a) => write!(f, "tcp://{}", a),
            ListenAddress::Unix(p) => write!(f, "unix://{}", p.display()),
        }
    }
}

/// Snapshot persistence configuration
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub enabled: bool,
    /// Filesystem sink directory (mutually exclusive with `database`)
    pub dir: Option<PathBuf>,
    /// SQLite blob sink (takes precedence over `dir` when both are set)
    pub database: Option<PathBuf>,
    pub interval: Duration,
    /// Most-recent images kept; older ones are deleted
    pub limit: usize,
    pub encrypt: bool,
    pub secret_key: Option<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            database: None,
            interval: Duration::from_secs(300),
            limit: 5,
            encrypt: false,
            secret_key: None,
        }
    }
}

/// Capacity and pruning thresholds
#[derive(Debug, Clone)]
pub struct PruneConfig {
    /// Soft threshold: background pruner engages above this key count
    pub prune_at: u64,
    /// Background target key count
    pub prune_to: u64,
    pub prune_interval: Duration,
    /// Enable synchronous pruning inside Set when capacity is reached
    pub eager_prune: bool,
    /// Hard threshold for eager pruning
    pub eager_prune_at: u64,
    /// Eager target key count
    pub eager_prune_to: u64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            prune_at: 0,
            prune_to: 0,
            prune_interval: Duration::from_secs(60),
            eager_prune: true,
            eager_prune_at: 0,
            eager_prune_to: 0,
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_address: ListenAddress,
    pub ssl_certfile: Option<PathBuf>,
    pub ssl_keyfile: Option<PathBuf>,

    pub hash_algorithm: HashAlgorithm,
    pub revision_limit: usize,

    pub max_keys: u64,
    pub max_key_length: usize,
    pub max_value_size: usize,
    pub max_lock_duration: Duration,
    pub min_lifespan: Duration,
    pub min_lock_duration: Duration,

    pub prune: PruneConfig,
    pub snapshot: SnapshotConfig,

    pub readonly: bool,
    pub privileged_client_id: Option<String>,
    pub start_fresh: bool,
    pub reserved_prefix: String,

    pub event_stream_buffer_size: usize,
    pub event_stream_send_timeout: Duration,

    pub log_level: String,
    pub log_json: bool,
    /// Log every published event at info level
    pub log_events: bool,
    pub graceful_shutdown_timeout: Duration,

    pub monitor_address: Option<String>,
    pub prometheus: bool,
    pub trace: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: ListenAddress::Tcp("127.0.0.1:11855".to_string()),
            ssl_certfile: None,
            ssl_keyfile: None,
            hash_algorithm: HashAlgorithm::Fnv64,
            revision_limit: 5,
            max_keys: 0,
            max_key_length: 1024,
            max_value_size: 1_000_000,
            max_lock_duration: Duration::from_secs(24 * 3600),
            min_lifespan: Duration::from_secs(5),
            min_lock_duration: Duration::from_secs(5),
            prune: PruneConfig::default(),
            snapshot: SnapshotConfig::default(),
            readonly: false,
            privileged_client_id: None,
            start_fresh: false,
            reserved_prefix: DEFAULT_RESERVED_PREFIX.to_string(),
            event_stream_buffer_size: 1000,
            event_stream_send_timeout: Duration::from_secs(1),
            log_level: "info".to_string(),
            log_json: false,
            log_events: false,
            graceful_shutdown_timeout: Duration::from_secs(30),
            monitor_address: None,
            prometheus: false,
            trace: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `KEYQUARRY_*` environment variables on top
    /// of the defaults.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = env_var("KEYQUARRY_LISTEN_ADDRESS") {
            cfg.listen_address = ListenAddress::parse(&v)?;
        }
        cfg.ssl_certfile = env_var("KEYQUARRY_SSL_CERTFILE").map(PathBuf::from);
        cfg.ssl_keyfile = env_var("KEYQUARRY_SSL_KEYFILE").map(PathBuf::from);

        if let Some(v) = env_var("KEYQUARRY_HASH_ALGORITHM") {
            cfg.hash_algorithm = v.parse()?;
        }
        env_parse(&mut cfg.revision_limit, "KEYQUARRY_REVISION_LIMIT")?;

        env_parse(&mut cfg.max_keys, "KEYQUARRY_MAX_KEYS")?;
        env_parse(&mut cfg.max_key_length, "KEYQUARRY_MAX_KEY_LENGTH")?;
        env_parse(&mut cfg.max_value_size, "KEYQUARRY_MAX_VALUE_SIZE")?;
        env_duration(&mut cfg.max_lock_duration, "KEYQUARRY_MAX_LOCK_DURATION")?;
        env_duration(&mut cfg.min_lifespan, "KEYQUARRY_MIN_LIFESPAN")?;
        env_duration(&mut cfg.min_lock_duration, "KEYQUARRY_MIN_LOCK_DURATION")?;

        env_parse(&mut cfg.prune.prune_at, "KEYQUARRY_PRUNE_AT")?;
        env_parse(&mut cfg.prune.prune_to, "KEYQUARRY_PRUNE_TO")?;
        env_duration(&mut cfg.prune.prune_interval, "KEYQUARRY_PRUNE_INTERVAL")?;
        env_bool(&mut cfg.prune.eager_prune, "KEYQUARRY_EAGER_PRUNE")?;
        env_parse(&mut cfg.prune.eager_prune_at, "KEYQUARRY_EAGER_PRUNE_AT")?;
        env_parse(&mut cfg.prune.eager_prune_to, "KEYQUARRY_EAGER_PRUNE_TO")?;

        env_bool(&mut cfg.snapshot.enabled, "KEYQUARRY_SNAPSHOT_ENABLED")?;
        cfg.snapshot.dir = env_var("KEYQUARRY_SNAPSHOT_DIR")
            .map(PathBuf::from)
            .or(cfg.snapshot.dir);
        cfg.snapshot.database = env_var("KEYQUARRY_SNAPSHOT_DATABASE")
            .map(PathBuf::from)
            .or(cfg.snapshot.database);
        env_duration(&mut cfg.snapshot.interval, "KEYQUARRY_SNAPSHOT_INTERVAL")?;
        env_parse(&mut cfg.snapshot.limit, "KEYQUARRY_SNAPSHOT_LIMIT")?;
        env_bool(&mut cfg.snapshot.encrypt, "KEYQUARRY_SNAPSHOT_ENCRYPT")?;
        cfg.snapshot.secret_key =
            env_var("KEYQUARRY_SNAPSHOT_SECRET_KEY").or(cfg.snapshot.secret_key);

        env_bool(&mut cfg.readonly, "KEYQUARRY_READONLY")?;
        cfg.privileged_client_id =
            env_var("KEYQUARRY_PRIVILEGED_CLIENT_ID").or(cfg.privileged_client_id);
        env_bool(&mut cfg.start_fresh, "KEYQUARRY_START_FRESH")?;
        if let Some(v) = env_var("KEYQUARRY_RESERVED_PREFIX") {
            cfg.reserved_prefix = v;
        }

        env_parse(
            &mut cfg.event_stream_buffer_size,
            "KEYQUARRY_EVENT_STREAM_BUFFER_SIZE",
        )?;
        env_duration(
            &mut cfg.event_stream_send_timeout,
            "KEYQUARRY_EVENT_STREAM_SEND_TIMEOUT",
        )?;

        if let Some(v) = env_var("KEYQUARRY_LOG_LEVEL") {
            cfg.log_level = v;
        }
        env_bool(&mut cfg.log_json, "KEYQUARRY_LOG_JSON")?;
        env_bool(&mut cfg.log_events, "KEYQUARRY_LOG_EVENTS")?;
        env_duration(
            &mut cfg.graceful_shutdown_timeout,
            "KEYQUARRY_GRACEFUL_SHUTDOWN_TIMEOUT",
        )?;

        cfg.monitor_address = env_var("KEYQUARRY_MONITOR_ADDRESS").or(cfg.monitor_address);
        env_bool(&mut cfg.prometheus, "KEYQUARRY_PROMETHEUS")?;
        env_bool(&mut cfg.trace, "KEYQUARRY_TRACE")?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_key_length == 0 {
            return Err(Error::InvalidArgument(
                "MAX_KEY_LENGTH must be positive".to_string(),
            ));
        }
        if self.max_value_size == 0 {
            return Err(Error::InvalidArgument(
                "MAX_VALUE_SIZE must be positive".to_string(),
            ));
        }
        if self.snapshot.enabled && self.snapshot.dir.is_none() && self.snapshot.database.is_none()
        {
            return Err(Error::InvalidArgument(
                "snapshots enabled but neither SNAPSHOT_DIR nor SNAPSHOT_DATABASE set".to_string(),
            ));
        }
        if self.snapshot.encrypt && self.snapshot.secret_key.is_none() {
            return Err(Error::InvalidArgument(
                "snapshot encryption enabled without SNAPSHOT_SECRET_KEY".to_string(),
            ));
        }
        if let Some(cert) = &self.ssl_certfile {
            if !cert.exists() {
                return Err(Error::InvalidArgument(format!(
                    "SSL_CERTFILE not found: {}",
                    cert.display()
                )));
            }
        }
        if let Some(key) = &self.ssl_keyfile {
            if !key.exists() {
                return Err(Error::InvalidArgument(format!(
                    "SSL_KEYFILE not found: {}",
                    key.display()
                )));
            }
        }
        if self.max_keys > 0 {
            if self.prune.eager_prune_to > self.max_keys {
                return Err(Error::InvalidArgument(
                    "EAGER_PRUNE_TO exceeds MAX_KEYS".to_string(),
                ));
            }
            if self.prune.prune_to > self.max_keys {
                return Err(Error::InvalidArgument(
                    "PRUNE_TO exceeds MAX_KEYS".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(target: &mut T, name: &str) -> Result<()> {
    if let Some(v) = env_var(name) {
        *target = v
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("{}: invalid value {:?}", name, v)))?;
    }
    Ok(())
}

fn env_bool(target: &mut bool, name: &str) -> Result<()> {
    if let Some(v) = env_var(name) {
        *target = match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "{}: invalid boolean {:?}",
                    name, v
                )))
            }
        };
    }
    Ok(())
}

fn env_duration(target: &mut Duration, name: &str) -> Result<()> {
    if let Some(v) = env_var(name) {
        *target = parse_duration(&v)
            .ok_or_else(|| Error::InvalidArgument(format!("{}: invalid duration {:?}", name, v)))?;
    }
    Ok(())
}

/// Parse `300ms`, `10s`, `5m`, `2h`, `1h30m`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }
        let mut unit = c.to_string();
        // two-letter units: ms, us
        if (c == 'm' || c == 'u') && chars.peek() == Some(&'s') {
            unit.push(chars.next().unwrap());
        }
        let n: f64 = num.parse().ok()?;
        num.clear();
        let step = match unit.as_str() {
            "us" => Duration::from_secs_f64(n / 1_000_000.0),
            "ms" => Duration::from_secs_f64(n / 1000.0),
            "s" => Duration::from_secs_f64(n),
            "m" => Duration::from_secs_f64(n * 60.0),
            "h" => Duration::from_secs_f64(n * 3600.0),
            "d" => Duration::from_secs_f64(n * 86400.0),
            _ => return None,
        };
        total += step;
    }
    if !num.is_empty() {
        // trailing bare number without a unit
        return None;
    }
    if total.is_zero() && !s.starts_with('0') {
        return None;
    }
    Some(total)
}

/// Render a duration in the same compact form `parse_duration` accepts.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 1000 != 0 {
        return format!("{}ms", ms);
    }
    let mut secs = d.as_secs();
    let mut out = String::new();
    let hours = secs / 3600;
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
        secs %= 3600;
    }
    let mins = secs / 60;
    if mins > 0 {
        out.push_str(&format!("{}m", mins));
        secs %= 60;
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{}s", secs));
    }
    out
}
