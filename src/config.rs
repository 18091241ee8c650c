//! Engine configuration, validated once at startup.
//!
//! Built from plain key/value properties (`backend.hosts`, `queue.batch_size`,
//! ...) or from `SEARCHBIND_*` environment variables, where the property key
//! is upper-cased with `.` replaced by `_`.

use crate::error::{Result, SearchBindError};
use crate::index::writer::{WriterRegistry, DEFAULT_WRITER_BUFFER_BYTES};
use crate::sync::SynchronizationStrategy;
use regex::Regex;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

pub const ENV_PREFIX: &str = "SEARCHBIND_";

const KNOWN_KEYS: &[&str] = &[
    "backend.kind",
    "backend.directory",
    "backend.hosts",
    "backend.protocol",
    "backend.uris",
    "backend.username",
    "backend.password",
    "backend.request_timeout_ms",
    "backend.connection_timeout_ms",
    "backend.keep_alive_ms",
    "backend.max_connections",
    "backend.max_connections_per_route",
    "writer.buffer_bytes",
    "queue.batch_size",
    "queue.commit_interval_ms",
    "queue.capacity",
    "optimizer.operation_limit.max",
    "optimizer.transaction_limit.max",
    "multi_tenancy.enabled",
    "synchronization.strategy",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Embedded,
    Remote,
    Memory,
}

impl FromStr for BackendKind {
    type Err = SearchBindError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embedded" | "tantivy" => Ok(BackendKind::Embedded),
            "remote" | "http" => Ok(BackendKind::Remote),
            "memory" | "in-memory" => Ok(BackendKind::Memory),
            other => Err(SearchBindError::config(format!(
                "Unknown backend kind '{}' (expected embedded, remote or memory)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Base URIs, e.g. `http://localhost:9200`, without trailing slash.
    pub uris: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    pub keep_alive: Duration,
    pub max_connections: usize,
    pub max_connections_per_route: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            uris: vec!["http://localhost:9200".to_string()],
            username: None,
            password: None,
            request_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(1),
            keep_alive: Duration::from_secs(90),
            max_connections: 20,
            max_connections_per_route: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Pending operations that trigger an early flush.
    pub batch_size: usize,
    /// Longest time accumulated work waits before it is flushed.
    pub commit_interval: Duration,
    /// Submissions the channel buffers before rejecting with `QueueFull`.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            batch_size: 10,
            commit_interval: Duration::from_millis(100),
            capacity: 1000,
        }
    }
}

/// `None` disables a threshold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizerConfig {
    pub operation_limit: Option<u64>,
    pub transaction_limit: Option<u64>,
}

impl OptimizerConfig {
    pub fn is_enabled(&self) -> bool {
        self.operation_limit.is_some() || self.transaction_limit.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexingConfig {
    pub backend: BackendKind,
    pub directory: PathBuf,
    pub connection: ConnectionConfig,
    pub writer_buffer_bytes: usize,
    pub queue: QueueConfig,
    pub optimizer: OptimizerConfig,
    pub multi_tenancy: bool,
    pub synchronization: SynchronizationStrategy,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        IndexingConfig {
            backend: BackendKind::default(),
            directory: PathBuf::from("./indexes"),
            connection: ConnectionConfig::default(),
            writer_buffer_bytes: DEFAULT_WRITER_BUFFER_BYTES,
            queue: QueueConfig::default(),
            optimizer: OptimizerConfig::default(),
            multi_tenancy: false,
            synchronization: SynchronizationStrategy::default(),
        }
    }
}

impl IndexingConfig {
    /// In-memory backend with defaults everywhere else.
    pub fn in_memory() -> Self {
        IndexingConfig {
            backend: BackendKind::Memory,
            ..Self::default()
        }
    }

    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let props: HashMap<String, String> = properties
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        for key in props.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                tracing::warn!("Ignoring unknown configuration property '{}'", key);
            }
        }

        let get = |key: &str| {
            props
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let mut config = IndexingConfig::default();

        if let Some(kind) = get("backend.kind") {
            config.backend = kind.parse()?;
        }
        if let Some(dir) = get("backend.directory") {
            config.directory = PathBuf::from(dir);
        }

        match (get("backend.hosts"), get("backend.uris")) {
            (Some(_), Some(_)) => {
                return Err(SearchBindError::config(
                    "Both 'backend.hosts' and 'backend.uris' are set; configure only one",
                ))
            }
            (Some(hosts), None) => {
                let protocol = get("backend.protocol").unwrap_or("http");
                if protocol != "http" && protocol != "https" {
                    return Err(SearchBindError::config(format!(
                        "Invalid 'backend.protocol' value '{}' (expected http or https)",
                        protocol
                    )));
                }
                config.connection.uris = split_list(hosts)
                    .map(|host| format!("{}://{}", protocol, host))
                    .collect();
            }
            (None, Some(uris)) => {
                if get("backend.protocol").is_some() {
                    return Err(SearchBindError::config(
                        "'backend.protocol' cannot be combined with 'backend.uris'",
                    ));
                }
                config.connection.uris = split_list(uris)
                    .map(|uri| uri.trim_end_matches('/').to_string())
                    .collect();
            }
            (None, None) => {}
        }

        config.connection.username = get("backend.username").map(str::to_string);
        config.connection.password = get("backend.password").map(str::to_string);

        if let Some(v) = get("backend.request_timeout_ms") {
            config.connection.request_timeout = parse_millis("backend.request_timeout_ms", v)?;
        }
        if let Some(v) = get("backend.connection_timeout_ms") {
            config.connection.connection_timeout =
                parse_millis("backend.connection_timeout_ms", v)?;
        }
        if let Some(v) = get("backend.keep_alive_ms") {
            config.connection.keep_alive = parse_millis("backend.keep_alive_ms", v)?;
        }
        if let Some(v) = get("backend.max_connections") {
            config.connection.max_connections = parse_positive("backend.max_connections", v)?;
        }
        if let Some(v) = get("backend.max_connections_per_route") {
            config.connection.max_connections_per_route =
                parse_positive("backend.max_connections_per_route", v)?;
        }

        if let Some(v) = get("writer.buffer_bytes") {
            config.writer_buffer_bytes = parse_positive("writer.buffer_bytes", v)?;
        }

        if let Some(v) = get("queue.batch_size") {
            config.queue.batch_size = parse_positive("queue.batch_size", v)?;
        }
        if let Some(v) = get("queue.commit_interval_ms") {
            config.queue.commit_interval = parse_millis("queue.commit_interval_ms", v)?;
        }
        if let Some(v) = get("queue.capacity") {
            config.queue.capacity = parse_positive("queue.capacity", v)?;
        }

        if let Some(v) = get("optimizer.operation_limit.max") {
            config.optimizer.operation_limit =
                parse_threshold("optimizer.operation_limit.max", v)?;
        }
        if let Some(v) = get("optimizer.transaction_limit.max") {
            config.optimizer.transaction_limit =
                parse_threshold("optimizer.transaction_limit.max", v)?;
        }

        if let Some(v) = get("multi_tenancy.enabled") {
            config.multi_tenancy = parse_bool("multi_tenancy.enabled", v)?;
        }
        if let Some(v) = get("synchronization.strategy") {
            config.synchronization = v.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Read every known key from `SEARCHBIND_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let props = KNOWN_KEYS.iter().filter_map(|key| {
            env::var(env_name(key))
                .ok()
                .map(|value| (key.to_string(), value))
        });
        Self::from_properties(props)
    }

    pub fn validate(&self) -> Result<()> {
        let conn = &self.connection;
        if self.backend == BackendKind::Remote {
            if conn.uris.is_empty() {
                return Err(SearchBindError::config(
                    "Remote backend requires at least one host or URI",
                ));
            }
            for uri in &conn.uris {
                if !(uri.starts_with("http://") || uri.starts_with("https://")) {
                    return Err(SearchBindError::config(format!(
                        "Invalid backend URI '{}': must start with http:// or https://",
                        uri
                    )));
                }
            }
        }
        if conn.password.is_some() && conn.username.is_none() {
            return Err(SearchBindError::config(
                "'backend.password' is set without 'backend.username'",
            ));
        }
        if conn.max_connections == 0 || conn.max_connections_per_route == 0 {
            return Err(SearchBindError::config(
                "Connection pool sizes must be positive",
            ));
        }
        if conn.max_connections_per_route > conn.max_connections {
            return Err(SearchBindError::config(format!(
                "'backend.max_connections_per_route' ({}) exceeds 'backend.max_connections' ({})",
                conn.max_connections_per_route, conn.max_connections
            )));
        }
        if self.backend == BackendKind::Embedded {
            WriterRegistry::validate_buffer_size(self.writer_buffer_bytes)?;
        }
        if self.queue.batch_size == 0 || self.queue.capacity == 0 {
            return Err(SearchBindError::config(
                "Queue batch size and capacity must be positive",
            ));
        }
        if self.queue.commit_interval.is_zero() {
            return Err(SearchBindError::config(
                "'queue.commit_interval_ms' must be positive",
            ));
        }
        Ok(())
    }
}

pub fn env_name(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key.replace(['.', '-'], "_").to_uppercase())
}

fn index_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_\-]*$").unwrap())
}

pub fn validate_index_name(name: &str) -> Result<()> {
    if index_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(SearchBindError::config(format!(
            "Invalid index name '{}': use lowercase letters, digits, '_' and '-', starting with a letter or digit",
            name
        )))
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_i64(key: &str, value: &str) -> Result<i64> {
    value.parse::<i64>().map_err(|_| {
        SearchBindError::config(format!(
            "Invalid value '{}' for '{}': expected an integer",
            value, key
        ))
    })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    let ms = parse_i64(key, value)?;
    if ms < 0 {
        return Err(SearchBindError::config(format!(
            "Invalid value '{}' for '{}': timeouts must not be negative",
            value, key
        )));
    }
    Ok(Duration::from_millis(ms as u64))
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    let n = parse_i64(key, value)?;
    if n <= 0 {
        return Err(SearchBindError::config(format!(
            "Invalid value '{}' for '{}': must be positive",
            value, key
        )));
    }
    Ok(n as usize)
}

fn parse_threshold(key: &str, value: &str) -> Result<Option<u64>> {
    match parse_i64(key, value)? {
        -1 => Ok(None),
        n if n < 0 => Err(SearchBindError::config(format!(
            "Invalid value '{}' for '{}': use -1 to disable, or a non-negative limit",
            value, key
        ))),
        n => Ok(Some(n as u64)),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(SearchBindError::config(format!(
            "Invalid value '{}' for '{}': expected true or false",
            value, key
        ))),
    }
}
