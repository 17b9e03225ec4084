//! Fetch engine configuration.
//!
//! Values are resolved in priority order (later overrides earlier):
//! 1. Built-in defaults ([`FetchConfig::default()`])
//! 2. An optional TOML file
//! 3. `CDPFETCH_*` environment variables
//!
//! Callers apply CLI flags on top of the returned value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Maximum config file size in bytes.
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Navigation deadline used when neither config nor request sets one.
pub const DEFAULT_NAVIGATION_TIMEOUT_SECS: u64 = 10;

/// Top-level configuration for [`crate::BrowserFetcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Deadline for `Page.navigate`.
    pub navigation_timeout_secs: u64,
    /// How long to wait for the document root after navigation.
    pub ready_timeout_secs: u64,
    /// Delay between document-root polls.
    pub ready_poll_interval_ms: u64,
    /// Deadline for ordinary CDP commands.
    pub command_timeout_secs: u64,
    /// Deadline for `Fetch.continueRequest` / `Fetch.failRequest`.
    pub intercept_command_timeout_secs: u64,
    /// Directory under which per-session profiles are created. A temporary
    /// directory is used when unset.
    pub profile_root: Option<PathBuf>,
    pub browser: BrowserConfig,
}

/// How the browser process is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Explicit Chrome/Chromium binary.
    pub binary_path: Option<PathBuf>,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    /// How long to wait for the DevTools endpoint after spawning.
    pub startup_timeout_secs: u64,
    /// Additional command-line flags, appended after the built-in ones.
    pub extra_args: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            navigation_timeout_secs: DEFAULT_NAVIGATION_TIMEOUT_SECS,
            ready_timeout_secs: 30,
            ready_poll_interval_ms: 50,
            command_timeout_secs: 30,
            intercept_command_timeout_secs: 5,
            profile_root: None,
            browser: BrowserConfig::default(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            headless: true,
            window_width: 1,
            window_height: 1,
            startup_timeout_secs: 10,
            extra_args: Vec::new(),
        }
    }
}

impl FetchConfig {
    /// Load from an optional TOML file, then apply `CDPFETCH_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, FetchError> {
        Self::load_with_env(path, |name| std::env::var(name).ok())
    }

    /// Like [`FetchConfig::load`] with an injectable environment lookup.
    pub fn load_with_env<F>(path: Option<&Path>, env: F) -> Result<Self, FetchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut merged = toml::Value::try_from(FetchConfig::default())
            .map_err(|e| FetchError::Config(format!("failed to serialize defaults: {e}")))?;

        if let Some(path) = path {
            let content = read_config_file(path)?;
            let layer: toml::Value = toml::from_str(&content).map_err(|e| {
                FetchError::Config(format!("invalid config {}: {e}", path.display()))
            })?;
            deep_merge(&mut merged, &layer);
        }

        apply_env_overrides(&mut merged, env)?;

        let config: FetchConfig = merged
            .try_into()
            .map_err(|e| FetchError::Config(format!("failed to parse merged config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every fetch fail.
    pub fn validate(&self) -> Result<(), FetchError> {
        let timeouts = [
            ("navigation_timeout_secs", self.navigation_timeout_secs),
            ("ready_timeout_secs", self.ready_timeout_secs),
            ("command_timeout_secs", self.command_timeout_secs),
            ("intercept_command_timeout_secs", self.intercept_command_timeout_secs),
            ("browser.startup_timeout_secs", self.browser.startup_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(FetchError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.ready_poll_interval_ms == 0 {
            return Err(FetchError::Config(
                "ready_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.browser.window_width == 0 || self.browser.window_height == 0 {
            return Err(FetchError::Config(
                "browser window dimensions must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn intercept_command_timeout(&self) -> Duration {
        Duration::from_secs(self.intercept_command_timeout_secs)
    }
}

impl BrowserConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Read a config file with a size limit.
fn read_config_file(path: &Path) -> Result<String, FetchError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        FetchError::Config(format!("cannot read config file {}: {e}", path.display()))
    })?;

    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(FetchError::Config(format!(
            "config file {} exceeds maximum size of {} bytes (actual: {} bytes)",
            path.display(),
            MAX_CONFIG_FILE_SIZE,
            metadata.len()
        )));
    }

    std::fs::read_to_string(path).map_err(|e| {
        FetchError::Config(format!("cannot read config file {}: {e}", path.display()))
    })
}

/// Deep-merge `overlay` into `base`. Tables merge field-by-field; arrays and
/// scalars are replaced.
fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_table.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[derive(Debug, Clone, Copy)]
enum EnvKind {
    Integer,
    Bool,
    Path,
}

/// A `CDPFETCH_*` variable and the config field it sets.
#[derive(Debug)]
struct EnvMapping {
    env_var: &'static str,
    toml_path: &'static [&'static str],
    kind: EnvKind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        env_var: "CDPFETCH_NAVIGATION_TIMEOUT_SECS",
        toml_path: &["navigation_timeout_secs"],
        kind: EnvKind::Integer,
    },
    EnvMapping {
        env_var: "CDPFETCH_READY_TIMEOUT_SECS",
        toml_path: &["ready_timeout_secs"],
        kind: EnvKind::Integer,
    },
    EnvMapping {
        env_var: "CDPFETCH_PROFILE_ROOT",
        toml_path: &["profile_root"],
        kind: EnvKind::Path,
    },
    EnvMapping {
        env_var: "CDPFETCH_BROWSER_BIN",
        toml_path: &["browser", "binary_path"],
        kind: EnvKind::Path,
    },
    EnvMapping {
        env_var: "CDPFETCH_HEADLESS",
        toml_path: &["browser", "headless"],
        kind: EnvKind::Bool,
    },
];

fn apply_env_overrides<F>(merged: &mut toml::Value, env: F) -> Result<(), FetchError>
where
    F: Fn(&str) -> Option<String>,
{
    for mapping in ENV_MAPPINGS {
        let Some(raw) = env(mapping.env_var) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let value = match mapping.kind {
            EnvKind::Integer => raw
                .parse::<i64>()
                .map(toml::Value::Integer)
                .map_err(|_| {
                    FetchError::Config(format!("{} must be an integer, got `{raw}`", mapping.env_var))
                })?,
            EnvKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => toml::Value::Boolean(true),
                "0" | "false" | "no" => toml::Value::Boolean(false),
                _ => {
                    return Err(FetchError::Config(format!(
                        "{} must be a boolean, got `{raw}`",
                        mapping.env_var
                    )))
                }
            },
            EnvKind::Path => toml::Value::String(raw.to_string()),
        };
        tracing::debug!(var = mapping.env_var, "applying environment override");
        set_nested_value(merged, mapping.toml_path, value);
    }
    Ok(())
}

fn set_nested_value(root: &mut toml::Value, path: &[&str], value: toml::Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        let toml::Value::Table(table) = current else {
            return;
        };
        current = table
            .entry(segment.to_string())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    if let toml::Value::Table(table) = current {
        table.insert(last.to_string(), value);
    }
}
