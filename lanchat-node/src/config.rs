//! Load config from defaults, file, environment and command line.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration. File: ~/.config/lanchat/config.toml or /etc/lanchat/config.toml.
/// Env overrides: LANCHAT_NAME, LANCHAT_PORT, LANCHAT_MULTICAST_ADDR, LANCHAT_GENERAL_QUEUE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name announced in heartbeats.
    #[serde(default = "default_name")]
    pub name: String,
    /// UDP multicast port and TCP session port (default 25042).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Multicast group (default 224.0.0.1).
    #[serde(default = "default_multicast_addr")]
    pub multicast_addr: Ipv4Addr,
    /// Capacity of the general room's outbound queue (default 10).
    #[serde(default = "default_general_queue")]
    pub general_queue: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// How long the session server waits for open sessions on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string())
}
fn default_port() -> u16 {
    25042
}
fn default_multicast_addr() -> Ipv4Addr {
    Ipv4Addr::new(224, 0, 0, 1)
}
fn default_general_queue() -> usize {
    10
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_probe_interval_ms() -> u64 {
    1000
}
fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            port: default_port(),
            multicast_addr: default_multicast_addr(),
            general_queue: default_general_queue(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("display name must not be empty")]
    EmptyName,
    #[error("display name must not contain `|`")]
    NameDelimiter,
    #[error("port must not be 0")]
    ZeroPort,
    #[error("{0} is not an IPv4 multicast address")]
    NotMulticast(Ipv4Addr),
    #[error("general queue capacity must be at least 1")]
    ZeroQueue,
    #[error("invalid value for {flag}: {value}")]
    BadArgument { flag: String, value: String },
    #[error("missing value for {0}")]
    MissingArgument(String),
    #[error("unknown argument {0}")]
    UnknownArgument(String),
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Reject values the protocol cannot carry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.name.contains('|') {
            return Err(ConfigError::NameDelimiter);
        }
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if !self.multicast_addr.is_multicast() {
            return Err(ConfigError::NotMulticast(self.multicast_addr));
        }
        if self.general_queue == 0 {
            return Err(ConfigError::ZeroQueue);
        }
        Ok(())
    }

    /// Apply environment overrides. Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = get("LANCHAT_NAME") {
            self.name = s.trim().to_string();
        }
        if let Some(p) = get("LANCHAT_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.port = p;
        }
        if let Some(a) = get("LANCHAT_MULTICAST_ADDR").and_then(|s| s.parse::<Ipv4Addr>().ok()) {
            self.multicast_addr = a;
        }
        if let Some(q) = get("LANCHAT_GENERAL_QUEUE").and_then(|s| s.parse::<usize>().ok()) {
            self.general_queue = q;
        }
    }

    /// Apply `--name`, `--port` and `--multicast` from the command line.
    pub fn apply_args<I>(&mut self, args: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        while let Some(flag) = args.next() {
            let value = match flag.as_str() {
                "--name" | "--port" | "--multicast" => args
                    .next()
                    .ok_or_else(|| ConfigError::MissingArgument(flag.clone()))?,
                _ => return Err(ConfigError::UnknownArgument(flag)),
            };
            let bad = || ConfigError::BadArgument {
                flag: flag.clone(),
                value: value.clone(),
            };
            match flag.as_str() {
                "--name" => self.name = value.trim().to_string(),
                "--port" => self.port = value.parse().map_err(|_| bad())?,
                _ => self.multicast_addr = value.parse().map_err(|_| bad())?,
            }
        }
        Ok(())
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.port, 25042);
        assert_eq!(c.multicast_addr, Ipv4Addr::new(224, 0, 0, 1));
        assert_eq!(c.general_queue, 10);
        assert_eq!(c.probe_timeout(), Duration::from_secs(2));
        assert_eq!(c.shutdown_grace(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let c: Config = toml::from_str("name = \"Alice\"\nport = 9000\n").unwrap();
        assert_eq!(c.name, "Alice");
        assert_eq!(c.port, 9000);
        assert_eq!(c.general_queue, 10);
        assert!(toml::from_str::<Config>("colour = \"red\"\n").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        c.apply_env(|k| match k {
            "LANCHAT_PORT" => Some("31000".into()),
            "LANCHAT_MULTICAST_ADDR" => Some("not-an-ip".into()),
            "LANCHAT_GENERAL_QUEUE" => Some("3".into()),
            _ => None,
        });
        assert_eq!(c.port, 31000);
        assert_eq!(c.multicast_addr, default_multicast_addr());
        assert_eq!(c.general_queue, 3);
    }

    #[test]
    fn args_override() {
        let mut c = Config::default();
        c.apply_args(
            ["--name", " Bob ", "--port", "4000", "--multicast", "239.1.2.3"]
                .map(String::from),
        )
        .unwrap();
        assert_eq!(c.name, "Bob");
        assert_eq!(c.port, 4000);
        assert_eq!(c.multicast_addr, Ipv4Addr::new(239, 1, 2, 3));

        assert!(matches!(
            c.apply_args(["--port".to_string(), "x".to_string()]),
            Err(ConfigError::BadArgument { .. })
        ));
        assert_eq!(
            c.apply_args(["--name".to_string()]),
            Err(ConfigError::MissingArgument("--name".into()))
        );
    }

    #[test]
    fn validation() {
        let mut c = Config {
            name: "Alice".into(),
            ..Config::default()
        };
        assert_eq!(c.validate(), Ok(()));
        c.name = "a|b".into();
        assert_eq!(c.validate(), Err(ConfigError::NameDelimiter));
        c.name = "  ".into();
        assert_eq!(c.validate(), Err(ConfigError::EmptyName));
        c.name = "Alice".into();
        c.multicast_addr = Ipv4Addr::new(10, 0, 0, 1);
        assert!(matches!(c.validate(), Err(ConfigError::NotMulticast(_))));
        c.multicast_addr = default_multicast_addr();
        c.general_queue = 0;
        assert_eq!(c.validate(), Err(ConfigError::ZeroQueue));
    }
}
