use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// DOtunnel session core: per-tunnel multiplexing between one agent control
/// socket and many public HTTP/WebSocket client connections.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address to bind the public HTTP/WS server on
    #[arg(long, env = "DOTUNNEL_SESSION_BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port to bind the public HTTP/WS server on
    #[arg(long, env = "DOTUNNEL_SESSION_BIND_PORT", default_value_t = 8080)]
    pub bind_port: u16,

    /// Cap on concurrent HTTP + WebSocket streams per session (§6)
    #[arg(
        long,
        env = "DOTUNNEL_SESSION_MAX_CONCURRENT_STREAMS",
        default_value_t = 100
    )]
    pub max_concurrent_streams: usize,

    /// HTTP deadline and WebSocket-upgrade deadline, in milliseconds (§6)
    #[arg(
        long,
        env = "DOTUNNEL_SESSION_REQUEST_TIMEOUT_MS",
        default_value_t = 30_000
    )]
    pub request_timeout_ms: u64,

    /// Hostname pattern driving front-door routing, e.g. `*.tunnel.io` (§6).
    /// Echoed into `tunnelUrl` on attach, and used by the standalone binary's
    /// own `axum` adapter to pick a subdomain out of the `Host` header — a
    /// real deployment's front door is a separate out-of-scope service that
    /// may apply the same pattern before ever reaching this process.
    #[arg(
        long,
        env = "DOTUNNEL_SESSION_TUNNEL_HOST_PATTERN",
        default_value = "*.tunnel.io"
    )]
    pub tunnel_host_pattern: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DOTUNNEL_SESSION_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "DOTUNNEL_SESSION_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Optional TOML config file merged in ahead of CLI/env parsing
    #[arg(long, env = "DOTUNNEL_SESSION_CONFIG_FILE")]
    pub config_file: Option<String>,
}

impl Config {
    /// `request_timeout_ms` as a `Duration`, for arming each stream's
    /// deadline watcher (§4.2).
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    /// A config with every tunable at its documented default, for unit and
    /// integration tests that don't care about CLI parsing.
    pub fn for_test() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            bind_port: 0,
            max_concurrent_streams: 100,
            request_timeout_ms: 30_000,
            tunnel_host_pattern: "*.tunnel.io".into(),
            log_level: "info".into(),
            log_json: false,
            config_file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TOML config file support
// ---------------------------------------------------------------------------

/// Serializable config for TOML file persistence. All fields are optional —
/// only populated values are written.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_streams: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_host_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,
}

impl ConfigFile {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Inject values as environment variables so clap picks them up.
    ///
    /// Only sets variables that are **not** already present in the
    /// environment, preserving the precedence: CLI > env > config file.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }
        set!("DOTUNNEL_SESSION_BIND_ADDR", self.bind_addr);
        set!("DOTUNNEL_SESSION_BIND_PORT", self.bind_port);
        set!(
            "DOTUNNEL_SESSION_MAX_CONCURRENT_STREAMS",
            self.max_concurrent_streams
        );
        set!(
            "DOTUNNEL_SESSION_REQUEST_TIMEOUT_MS",
            self.request_timeout_ms
        );
        set!(
            "DOTUNNEL_SESSION_TUNNEL_HOST_PATTERN",
            self.tunnel_host_pattern
        );
        set!("DOTUNNEL_SESSION_LOG_LEVEL", self.log_level);
        set!("DOTUNNEL_SESSION_LOG_JSON", self.log_json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_timeout_converts_millis_to_duration() {
        let cfg = Config {
            bind_addr: "0.0.0.0".into(),
            bind_port: 8080,
            max_concurrent_streams: 100,
            request_timeout_ms: 30_000,
            tunnel_host_pattern: "*.tunnel.io".into(),
            log_level: "info".into(),
            log_json: false,
            config_file: None,
        };
        assert_eq!(cfg.request_timeout(), std::time::Duration::from_secs(30));
    }
}
