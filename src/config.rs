//! Proxy configuration loading and validation.
//!
//! Reads one YAML (or JSON) file at startup and resolves environment
//! variables. The file is the single source of truth for the listen address,
//! timeouts, and the set of tool providers. It is never reloaded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backend::{ConnectionSettings, ProviderSpec};

/// File name searched in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "tool-proxy.yaml";

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "TOOL_PROXY_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors that can occur while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// The file is not valid YAML/JSON for this schema.
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    /// The file parsed but a value is unusable.
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level proxy configuration (mirrors `tool-proxy.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address the front-end listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bound for the provider handshake and capability discovery.
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Optional per-call ceiling. Absent means calls are unbounded.
    #[serde(default)]
    pub invocation_timeout_ms: Option<u64>,
    /// Outbound queue capacity of each front-end session.
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,
    /// Tool providers, keyed by unique name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSpec>,
}

fn default_listen() -> String {
    "127.0.0.1:8765".to_string()
}
fn default_discovery_timeout_ms() -> u64 {
    10_000
}
fn default_session_queue_capacity() -> usize {
    64
}

impl ProxyConfig {
    /// Timeouts handed to every backend connection.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            discovery_timeout: Duration::from_millis(self.discovery_timeout_ms),
            invocation_timeout: self.invocation_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Provider specs with their names filled in from the map keys.
    pub fn provider_specs(&self) -> Vec<ProviderSpec> {
        self.providers
            .iter()
            .map(|(name, spec)| ProviderSpec {
                name: name.clone(),
                ..spec.clone()
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "listen address is empty".into(),
            });
        }
        if self.discovery_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "discovery_timeout_ms must be greater than zero".into(),
            });
        }
        if self.session_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                reason: "session_queue_capacity must be greater than zero".into(),
            });
        }
        for (name, spec) in &self.providers {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "provider names must be non-empty".into(),
                });
            }
            if spec.command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: format!("provider '{name}' has an empty command"),
                });
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve which config file to load.
///
/// Order: explicit path, `$TOOL_PROXY_CONFIG`, `./tool-proxy.yaml`, then
/// `<config dir>/tool-proxy/config.yaml`. Falls back to the local file name
/// so the read error names something sensible.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("tool-proxy").join("config.yaml");
        if candidate.exists() {
            return candidate;
        }
    }
    local
}

/// Load, interpolate, parse, and validate the configuration file.
///
/// `${VAR_NAME}` and `${VAR_NAME:-default}` are resolved before parsing.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw, is_json(path)).map_err(|e| match e {
        ConfigError::Parse { reason, .. } => ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        },
        other => other,
    })
}

/// Parse configuration text. Used by `load_config` and tests.
pub fn parse_config(raw: &str, json: bool) -> Result<ProxyConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);

    let config: ProxyConfig = if json {
        serde_json::from_str(&interpolated).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| e.to_string())
    }
    .map_err(|reason| ConfigError::Parse {
        path: "<inline>".into(),
        reason,
    })?;

    config.validate()?;
    Ok(config)
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();

        let mut expr = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            expr.push(c);
        }

        if closed {
            result.push_str(&resolve_var_expr(&expr));
        } else {
            // Unterminated: keep the text as written.
            result.push_str("${");
            result.push_str(&expr);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset variables without a default
/// become empty.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
