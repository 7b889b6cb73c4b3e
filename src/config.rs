use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::codec::DEFAULT_MAX_FRAME_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address (default: "0.0.0.0", env HUB_ADDR)
    #[serde(default = "default_address")]
    pub address: String,

    /// Bind port, 0 picks a free port (default: 8083, env HUB_PORT)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Require mutual TLS; plain TCP when off (default: true, env HUB_SECURE)
    #[serde(default = "default_secure")]
    pub secure: bool,

    /// TLS handshake bound in milliseconds, 0 = unbounded (default: 10000)
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Close connections silent for this long, 0 = never (default: 300)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Drop a connection whose delivery write stalls this long in
    /// milliseconds, 0 = unbounded (default: 10000)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Longest accepted envelope line in bytes (default: 1 MiB)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Pending deliveries per connection before dropping (default: 1024)
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    /// Forward publishes from client ids that never subscribed (default: true)
    #[serde(default = "default_anonymous_publish")]
    pub anonymous_publish: bool,

    /// Default tracing filter; RUST_LOG takes precedence (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Certificate material
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8083
}

fn default_secure() -> bool {
    true
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_inbox_capacity() -> usize {
    1024
}

fn default_anonymous_publish() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            secure: default_secure(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            write_timeout_ms: default_write_timeout_ms(),
            max_frame_size: default_max_frame_size(),
            inbox_capacity: default_inbox_capacity(),
            anonymous_publish: default_anonymous_publish(),
            log_level: default_log_level(),
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Overlay HUB_* variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Overlay HUB_* variables obtained through `lookup`. Empty values are
    /// treated as unset.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(address) = get("HUB_ADDR") {
            self.address = address.trim().to_string();
        }
        if let Some(port) = get("HUB_PORT") {
            self.port = parse_value("HUB_PORT", &port)?;
        }
        if let Some(secure) = get("HUB_SECURE") {
            self.secure = parse_bool("HUB_SECURE", &secure)?;
        }
        if let Some(timeout) = get("HUB_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = parse_value("HUB_HANDSHAKE_TIMEOUT_MS", &timeout)?;
        }
        if let Some(timeout) = get("HUB_IDLE_TIMEOUT_SECS") {
            self.idle_timeout_secs = parse_value("HUB_IDLE_TIMEOUT_SECS", &timeout)?;
        }
        if let Some(timeout) = get("HUB_WRITE_TIMEOUT_MS") {
            self.write_timeout_ms = parse_value("HUB_WRITE_TIMEOUT_MS", &timeout)?;
        }
        if let Some(dir) = get("HUB_CERT_DIR") {
            self.tls.cert_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// `address:port`, bracketing IPv6 literals.
    pub fn bind_address(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_ms > 0).then(|| Duration::from_millis(self.handshake_timeout_ms))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Directory holding the PEM files (default: ".", env HUB_CERT_DIR)
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Write freshly issued material to `cert_dir` (default: true)
    #[serde(default = "default_persist")]
    pub persist: bool,

    /// Load material already in `cert_dir` instead of issuing (default: false)
    #[serde(default)]
    pub reuse_existing: bool,

    /// Organization and DNS fallback for the server certificate
    /// (default: machine hostname)
    #[serde(default)]
    pub host_hint: Option<String>,

    /// IP SANs for the server certificate (default: discovered IPv4 address)
    #[serde(default)]
    pub subject_alt_ips: Vec<IpAddr>,
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_persist() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: default_cert_dir(),
            persist: default_persist(),
            reuse_existing: false,
            host_hint: None,
            subject_alt_ips: Vec::new(),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8083");
        assert!(config.secure);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.write_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.tls.cert_dir, PathBuf::from("."));
        assert!(config.tls.persist);
        assert!(!config.tls.reuse_existing);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides_from(env(&[
                ("HUB_ADDR", "127.0.0.1"),
                ("HUB_PORT", "9000"),
                ("HUB_SECURE", "false"),
                ("HUB_CERT_DIR", "/tmp/certs"),
                ("HUB_IDLE_TIMEOUT_SECS", "0"),
                ("HUB_WRITE_TIMEOUT_MS", "250"),
            ]))
            .unwrap();

        assert_eq!(config.bind_address(), "127.0.0.1:9000");
        assert!(!config.secure);
        assert_eq!(config.tls.cert_dir, PathBuf::from("/tmp/certs"));
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.write_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = Config::default();
        config
            .apply_overrides_from(env(&[("HUB_ADDR", ""), ("HUB_PORT", "  ")]))
            .unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:8083");
    }

    #[test]
    fn test_bool_spellings() {
        for value in ["1", "t", "T", "true", "TRUE", "True"] {
            assert!(parse_bool("HUB_SECURE", value).unwrap());
        }
        for value in ["0", "f", "F", "false", "FALSE", "False"] {
            assert!(!parse_bool("HUB_SECURE", value).unwrap());
        }
        assert!(parse_bool("HUB_SECURE", "yes").is_err());
    }

    #[test]
    fn test_invalid_env_values() {
        let mut config = Config::default();
        let err = config
            .apply_overrides_from(env(&[("HUB_PORT", "http")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "HUB_PORT"));

        let err = config
            .apply_overrides_from(env(&[("HUB_SECURE", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_ipv6_bind_address() {
        let config = Config {
            address: "::1".to_string(),
            port: 1234,
            ..Config::default()
        };
        assert_eq!(config.bind_address(), "[::1]:1234");
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            address = "127.0.0.1"
            port = 0
            anonymous_publish = false

            [tls]
            cert_dir = "/var/lib/mhub"
            reuse_existing = true
            subject_alt_ips = ["10.0.0.5"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:0");
        assert!(config.secure);
        assert!(!config.anonymous_publish);
        assert_eq!(config.inbox_capacity, 1024);
        assert_eq!(config.tls.cert_dir, PathBuf::from("/var/lib/mhub"));
        assert!(config.tls.reuse_existing);
        assert!(config.tls.persist);
        assert_eq!(config.tls.subject_alt_ips, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mhub.toml");
        std::fs::write(&path, "port = 7000\nsecure = false\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert!(!config.secure);

        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
