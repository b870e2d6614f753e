use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowscopeError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Jaeger,
    Tempo,
}

impl FromStr for BackendKind {
    type Err = FlowscopeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jaeger" => Ok(Self::Jaeger),
            "tempo" => Ok(Self::Tempo),
            _ => Err(FlowscopeError::Config(format!(
                "unknown backend kind {s} (expected jaeger or tempo)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub http_addr: String,
    pub backend_kind: BackendKind,
    pub backend_url: String,
    pub backend_service: Option<String>,
    pub backend_headers: Vec<(String, String)>,
    pub backend_timeout: Duration,
    pub backend_limit: usize,
    pub poll_interval: Duration,
    pub overlap_window: Duration,
    pub initial_lookback: Duration,
    pub shutdown_grace: Duration,
    pub store_capacity: usize,
    pub store_ttl: Duration,
    pub retention_interval: Duration,
    pub operation_attribute: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8470".to_string(),
            backend_kind: BackendKind::Jaeger,
            backend_url: "http://127.0.0.1:16686".to_string(),
            backend_service: None,
            backend_headers: Vec::new(),
            backend_timeout: Duration::from_secs(10),
            backend_limit: 500,
            poll_interval: Duration::from_secs(30),
            overlap_window: Duration::from_secs(60),
            initial_lookback: Duration::from_secs(5 * 60),
            shutdown_grace: Duration::from_secs(5),
            store_capacity: 10_000,
            store_ttl: Duration::from_secs(6 * 60 * 60),
            retention_interval: Duration::from_secs(60),
            operation_attribute: "business.operation".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_capacity == 0 {
            return Err(FlowscopeError::Config(
                "store_capacity must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(FlowscopeError::Config(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.backend_timeout.is_zero() {
            return Err(FlowscopeError::Config(
                "backend_timeout must be greater than zero".to_string(),
            ));
        }
        if self.retention_interval.is_zero() {
            return Err(FlowscopeError::Config(
                "retention_interval must be greater than zero".to_string(),
            ));
        }
        if self.operation_attribute.trim().is_empty() {
            return Err(FlowscopeError::Config(
                "operation_attribute cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    http_addr: Option<String>,
    backend_kind: Option<String>,
    backend_url: Option<String>,
    backend_service: Option<String>,
    backend_headers: Option<String>,
    backend_timeout: Option<String>,
    backend_limit: Option<usize>,
    poll_interval: Option<String>,
    overlap_window: Option<String>,
    initial_lookback: Option<String>,
    shutdown_grace: Option<String>,
    store_capacity: Option<usize>,
    store_ttl: Option<String>,
    retention_interval: Option<String>,
    operation_attribute: Option<String>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("FLOWSCOPE_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("flowscope/config.toml")
}

fn load_file_overrides(path: &Path) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| FlowscopeError::Config(format!("failed reading {}: {e}", path.display())))?;
    let parsed: ConfigOverrides = toml::from_str(&raw)
        .map_err(|e| FlowscopeError::Config(format!("failed parsing {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(v) => v
            .parse::<usize>()
            .map(Some)
            .map_err(|e| FlowscopeError::Config(format!("bad {name} in environment: {e}"))),
        Err(_) => Ok(None),
    }
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    Ok(ConfigOverrides {
        http_addr: env::var("FLOWSCOPE_HTTP_ADDR").ok(),
        backend_kind: env::var("FLOWSCOPE_BACKEND_KIND").ok(),
        backend_url: env::var("FLOWSCOPE_BACKEND_URL").ok(),
        backend_service: env::var("FLOWSCOPE_BACKEND_SERVICE").ok(),
        backend_headers: env::var("FLOWSCOPE_BACKEND_HEADERS").ok(),
        backend_timeout: env::var("FLOWSCOPE_BACKEND_TIMEOUT").ok(),
        backend_limit: env_usize("FLOWSCOPE_BACKEND_LIMIT")?,
        poll_interval: env::var("FLOWSCOPE_POLL_INTERVAL").ok(),
        overlap_window: env::var("FLOWSCOPE_OVERLAP_WINDOW").ok(),
        initial_lookback: env::var("FLOWSCOPE_INITIAL_LOOKBACK").ok(),
        shutdown_grace: env::var("FLOWSCOPE_SHUTDOWN_GRACE").ok(),
        store_capacity: env_usize("FLOWSCOPE_STORE_CAPACITY")?,
        store_ttl: env::var("FLOWSCOPE_STORE_TTL").ok(),
        retention_interval: env::var("FLOWSCOPE_RETENTION_INTERVAL").ok(),
        operation_attribute: env::var("FLOWSCOPE_OPERATION_ATTRIBUTE").ok(),
    })
}

fn parse_duration_field(name: &str, value: &str, source: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        FlowscopeError::Config(format!("bad {name} in {source}: {e} (value={value})"))
    })
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.http_addr {
        cfg.http_addr = v;
    }
    if let Some(v) = overrides.backend_kind {
        cfg.backend_kind = BackendKind::from_str(&v).map_err(|e| {
            FlowscopeError::Config(format!("bad backend_kind in {source}: {e}"))
        })?;
    }
    if let Some(v) = overrides.backend_url {
        cfg.backend_url = v;
    }
    if let Some(v) = overrides.backend_service {
        cfg.backend_service = (!v.trim().is_empty()).then(|| v.trim().to_string());
    }
    if let Some(v) = overrides.backend_headers {
        cfg.backend_headers = parse_headers(&v).map_err(|e| {
            FlowscopeError::Config(format!("bad backend_headers in {source}: {e} (value={v})"))
        })?;
    }
    if let Some(v) = overrides.backend_timeout {
        cfg.backend_timeout = parse_duration_field("backend_timeout", &v, source)?;
    }
    if let Some(v) = overrides.backend_limit {
        cfg.backend_limit = v;
    }
    if let Some(v) = overrides.poll_interval {
        cfg.poll_interval = parse_duration_field("poll_interval", &v, source)?;
    }
    if let Some(v) = overrides.overlap_window {
        cfg.overlap_window = parse_duration_field("overlap_window", &v, source)?;
    }
    if let Some(v) = overrides.initial_lookback {
        cfg.initial_lookback = parse_duration_field("initial_lookback", &v, source)?;
    }
    if let Some(v) = overrides.shutdown_grace {
        cfg.shutdown_grace = parse_duration_field("shutdown_grace", &v, source)?;
    }
    if let Some(v) = overrides.store_capacity {
        cfg.store_capacity = v;
    }
    if let Some(v) = overrides.store_ttl {
        cfg.store_ttl = parse_duration_field("store_ttl", &v, source)?;
    }
    if let Some(v) = overrides.retention_interval {
        cfg.retention_interval = parse_duration_field("retention_interval", &v, source)?;
    }
    if let Some(v) = overrides.operation_attribute {
        cfg.operation_attribute = v;
    }
    Ok(())
}

/// Parses `key=value,key2=value2` into header pairs.
pub fn parse_headers(raw: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(FlowscopeError::Config(
                "header entries must use key=value syntax".to_string(),
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(FlowscopeError::Config("header key cannot be empty".to_string()));
        }
        out.push((key.to_string(), value.trim().to_string()));
    }
    Ok(out)
}
