//! Configuration for both roles.
//!
//! Loaded as JSON from a `--config` file, or from the `COMMAND_DISPATCH_CONFIG`
//! environment variable, falling back to built-in defaults. Every field has a
//! default so a config only needs to name what it changes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::command::ExecutionPolicy;
use crate::expr;

/// Environment variable that may hold the whole configuration as JSON.
pub const CONFIG_ENV: &str = "COMMAND_DISPATCH_CONFIG";

/// Ports at or below this are refused.
pub const MIN_PORT_EXCLUSIVE: u16 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Port must be between 1000 and 65535")]
    InvalidPort(u32),

    #[error("unknown math name '{0}'")]
    UnknownMathName(String),

    #[error("invalid shell command name '{0}'")]
    InvalidShellCommand(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Settings for `serve`.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Settings for `dispatch`.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// Worker (server role) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Directory holding `<identity>.key_secret`.
    #[serde(default = "default_secret_keys_dir")]
    pub secret_keys_dir: PathBuf,

    /// Directory of authorized client certificates (`*.key`).
    #[serde(default = "default_public_keys_dir")]
    pub public_keys_dir: PathBuf,

    /// Name of the worker's own certificate.
    #[serde(default = "default_worker_identity")]
    pub identity: String,

    /// Source addresses allowed to connect. Empty admits any address.
    #[serde(default = "default_allowed_addresses")]
    pub allowed_addresses: Vec<IpAddr>,

    /// Executable names shell commands may use.
    #[serde(default = "default_allowed_shell_commands")]
    pub allowed_shell_commands: Vec<String>,

    /// Function and constant names expressions may reference.
    #[serde(default = "default_allowed_math_names")]
    pub allowed_math_names: Vec<String>,

    /// Shell used to run invocations.
    #[serde(default = "default_shell")]
    pub shell: PathBuf,

    /// Kill shell commands running longer than this. Unset means no limit.
    #[serde(default)]
    pub command_timeout_seconds: Option<u64>,

    /// Close a connection that sends nothing for this long between requests,
    /// so an idle dispatcher cannot hold the worker.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
}

/// Dispatcher (client role) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Worker host name or address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Worker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding `<identity>.key_secret`.
    #[serde(default = "default_secret_keys_dir")]
    pub secret_keys_dir: PathBuf,

    /// Directory holding `<worker_identity>.key`.
    #[serde(default = "default_public_keys_dir")]
    pub public_keys_dir: PathBuf,

    /// Name of the dispatcher's own certificate.
    #[serde(default = "default_client_identity")]
    pub identity: String,

    /// Name of the worker's public certificate.
    #[serde(default = "default_worker_identity")]
    pub worker_identity: String,

    /// Give up waiting for results after this long. Unset means wait forever.
    #[serde(default)]
    pub response_timeout_seconds: Option<u64>,
}

const fn default_port() -> u16 {
    5560
}

const fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_secret_keys_dir() -> PathBuf {
    "certificates/private_keys".into()
}

fn default_public_keys_dir() -> PathBuf {
    "certificates/public_keys".into()
}

fn default_worker_identity() -> String {
    "worker".into()
}

fn default_client_identity() -> String {
    "client".into()
}

fn default_allowed_addresses() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
}

fn default_allowed_shell_commands() -> Vec<String> {
    ["date", "df", "echo", "hostname", "ls", "pwd", "uname", "uptime", "whoami"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_allowed_math_names() -> Vec<String> {
    expr::known_names().map(String::from).collect()
}

fn default_shell() -> PathBuf {
    "/bin/sh".into()
}

const fn default_idle_timeout_seconds() -> u64 {
    30
}

fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            secret_keys_dir: default_secret_keys_dir(),
            public_keys_dir: default_public_keys_dir(),
            identity: default_worker_identity(),
            allowed_addresses: default_allowed_addresses(),
            allowed_shell_commands: default_allowed_shell_commands(),
            allowed_math_names: default_allowed_math_names(),
            shell: default_shell(),
            command_timeout_seconds: None,
            idle_timeout_seconds: default_idle_timeout_seconds(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            secret_keys_dir: default_secret_keys_dir(),
            public_keys_dir: default_public_keys_dir(),
            identity: default_client_identity(),
            worker_identity: default_worker_identity(),
            response_timeout_seconds: None,
        }
    }
}

impl Config {
    /// Load configuration from `path` if given, else from `COMMAND_DISPATCH_CONFIG`,
    /// else use defaults. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env()?.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::parse(&text, &path.display().to_string())
    }

    /// Load configuration from the `COMMAND_DISPATCH_CONFIG` environment
    /// variable. `None` when the variable is unset.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::parse(&json, CONFIG_ENV).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn parse(json: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::parse(json, "test JSON")
    }

    /// Check ports and allow-list entries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_port(self.worker.port)?;
        validate_port(self.dispatcher.port)?;

        if let Some(name) = self
            .worker
            .allowed_math_names
            .iter()
            .find(|name| !expr::is_known_name(name))
        {
            return Err(ConfigError::UnknownMathName(name.clone()));
        }

        if let Some(name) = self
            .worker
            .allowed_shell_commands
            .iter()
            .find(|name| name.is_empty() || name.chars().any(char::is_whitespace))
        {
            return Err(ConfigError::InvalidShellCommand(name.clone()));
        }

        Ok(())
    }
}

impl WorkerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_seconds.map(Duration::from_secs)
    }

    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// The allow-lists as an immutable policy.
    pub fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::new(
            self.allowed_shell_commands.iter().cloned(),
            self.allowed_math_names.iter().cloned(),
        )
    }
}

impl DispatcherConfig {
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_seconds.map(Duration::from_secs)
    }
}

/// Accept ports in (1000, 65535].
pub fn validate_port(port: u16) -> Result<u16, ConfigError> {
    if port > MIN_PORT_EXCLUSIVE {
        Ok(port)
    } else {
        Err(ConfigError::InvalidPort(u32::from(port)))
    }
}

/// Parse and range-check a port given on the command line.
pub fn parse_port(s: &str) -> Result<u16, ConfigError> {
    let value: u32 = s
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidPort(0))?;
    let port = u16::try_from(value).map_err(|_| ConfigError::InvalidPort(value))?;
    validate_port(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_any_config() {
        let config = Config::from_json("{}").unwrap();
        config.validate().unwrap();

        assert_eq!(config.worker.port, 5560);
        assert_eq!(config.worker.bind_addr().to_string(), "0.0.0.0:5560");
        assert_eq!(config.worker.identity, "worker");
        assert_eq!(config.worker.allowed_addresses, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert!(config.worker.allowed_shell_commands.contains(&"ls".to_string()));
        assert!(config.worker.command_timeout().is_none());
        assert_eq!(config.worker.idle_timeout(), Duration::from_secs(30));

        assert_eq!(config.dispatcher.host, "127.0.0.1");
        assert_eq!(config.dispatcher.identity, "client");
        assert_eq!(config.dispatcher.worker_identity, "worker");
        assert!(config.dispatcher.response_timeout().is_none());
    }

    #[test]
    fn default_math_names_cover_the_engine() {
        let config = WorkerConfig::default();
        let policy = config.policy();
        for name in expr::known_names() {
            assert!(policy.allows_math(name), "{name} should be allowed");
        }
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let json = r#"{
            "worker": {
                "port": 6000,
                "allowed_addresses": [],
                "allowed_shell_commands": ["ls"],
                "allowed_math_names": ["sqrt", "pi"],
                "command_timeout_seconds": 5,
                "idle_timeout_seconds": 2
            },
            "dispatcher": { "host": "worker.internal", "port": 6000 }
        }"#;
        let config = Config::from_json(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.worker.port, 6000);
        assert!(config.worker.allowed_addresses.is_empty());
        assert_eq!(config.worker.command_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.worker.idle_timeout(), Duration::from_secs(2));
        assert_eq!(config.worker.shell, PathBuf::from("/bin/sh"));

        let policy = config.worker.policy();
        assert!(policy.allows_shell("ls"));
        assert!(!policy.allows_shell("pwd"));
        assert!(policy.allows_math("pi"));
        assert!(!policy.allows_math("cos"));

        assert_eq!(config.dispatcher.host, "worker.internal");
        assert_eq!(config.dispatcher.public_keys_dir, PathBuf::from("certificates/public_keys"));
    }

    #[test]
    fn port_range_is_enforced() {
        let config = Config::from_json(r#"{"worker": {"port": 1000}}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Port must be between 1000 and 65535");

        let config = Config::from_json(r#"{"dispatcher": {"port": 1001}}"#).unwrap();
        config.validate().unwrap();

        assert!(Config::from_json(r#"{"worker": {"port": 70000}}"#).is_err());
    }

    #[test]
    fn parse_port_from_cli() {
        assert_eq!(parse_port("5560").unwrap(), 5560);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        assert!(matches!(parse_port("1000"), Err(ConfigError::InvalidPort(1000))));
        assert!(matches!(parse_port("65536"), Err(ConfigError::InvalidPort(65536))));
        assert!(parse_port("http").is_err());
    }

    #[test]
    fn unknown_math_name_is_rejected() {
        let json = r#"{"worker": {"allowed_math_names": ["sqrt", "__import__"]}}"#;
        let config = Config::from_json(json).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownMathName(name)) if name == "__import__"
        ));
    }

    #[test]
    fn shell_names_must_be_single_words() {
        let json = r#"{"worker": {"allowed_shell_commands": ["ls", "rm -rf"]}}"#;
        let config = Config::from_json(json).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellCommand(name)) if name == "rm -rf"
        ));

        let config = Config::from_json(r#"{"worker": {"allowed_shell_commands": [""]}}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"worker": {"identity": "alpha"}}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.worker.identity, "alpha");
    }

    #[test]
    fn missing_or_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(Config::load(Some(&missing)), Err(ConfigError::Read { .. })));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ worker: ").unwrap();
        assert!(matches!(Config::load(Some(&broken)), Err(ConfigError::Parse { .. })));
    }
}
