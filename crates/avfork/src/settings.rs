// Spawn settings: defaults, environment overrides and an optional JSON file.

use anyhow::{Context, Result};
use avfork_syscall::PATH_MAX;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The child needs room for the exec path buffer plus its own frames.
pub const MIN_STACK_SIZE: usize = PATH_MAX + 16 * 1024;

pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;
pub const DEFAULT_POOL_CAPACITY: usize = 16;
pub const DEFAULT_SIGINT_TIMEOUT_MS: u64 = 7500;
pub const DEFAULT_SIGTERM_TIMEOUT_MS: u64 = 2500;

pub const ENV_STACK_SIZE: &str = "AVFORK_STACK_SIZE";
pub const ENV_POOL_CAPACITY: &str = "AVFORK_POOL_CAPACITY";
pub const ENV_SIGINT_TIMEOUT_MS: &str = "AVFORK_SIGINT_TIMEOUT_MS";
pub const ENV_SIGTERM_TIMEOUT_MS: &str = "AVFORK_SIGTERM_TIMEOUT_MS";
pub const ENV_PRINT_LOG_TO_STDOUT: &str = "AVFORK_PRINT_LOG_TO_STDOUT";

static GLOBAL: Lazy<SpawnSettings> = Lazy::new(SpawnSettings::from_env);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnSettings {
    /// Usable stack size given to each child, in bytes.
    pub stack_size: usize,

    /// How many idle stacks the process-wide pool keeps mapped. The pool is
    /// built once from `SpawnSettings::global()`, so only `AVFORK_POOL_CAPACITY`
    /// affects it; a value loaded from a file does not resize it.
    pub pool_capacity: usize,

    /// How long a cancelled child gets to honor SIGINT.
    pub sigint_timeout_ms: u64,

    /// How long a cancelled child gets to honor SIGTERM before SIGKILL.
    pub sigterm_timeout_ms: u64,

    /// Echo invoker trace lines to stdout.
    pub print_log_to_stdout: bool,
}

impl Default for SpawnSettings {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            sigint_timeout_ms: DEFAULT_SIGINT_TIMEOUT_MS,
            sigterm_timeout_ms: DEFAULT_SIGTERM_TIMEOUT_MS,
            print_log_to_stdout: false,
        }
    }
}

impl SpawnSettings {
    /// The settings read from the environment on first use.
    pub fn global() -> &'static SpawnSettings {
        &GLOBAL
    }

    /// Defaults overridden by `AVFORK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, with variables resolved through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        settings.apply_overrides(lookup);
        settings
    }

    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {path:?}"))?;

        let settings: SpawnSettings = serde_json::from_str(&json)
            .with_context(|| format!("Failed to deserialize settings in {path:?}"))?;

        Ok(settings.normalized())
    }

    /// Apply `AVFORK_*` overrides from `lookup` on top of `self`. Values that
    /// do not parse are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, ENV_STACK_SIZE) {
            self.stack_size = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_POOL_CAPACITY) {
            self.pool_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_SIGINT_TIMEOUT_MS) {
            self.sigint_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_SIGTERM_TIMEOUT_MS) {
            self.sigterm_timeout_ms = v;
        }
        if let Some(raw) = lookup(ENV_PRINT_LOG_TO_STDOUT) {
            match convert_to_bool(&raw) {
                Some(v) => self.print_log_to_stdout = v,
                None => tracing::warn!("Ignoring {ENV_PRINT_LOG_TO_STDOUT}={raw:?}: not a boolean"),
            }
        }

        *self = self.clone().normalized();
    }

    fn normalized(mut self) -> Self {
        self.stack_size = self.stack_size.max(MIN_STACK_SIZE);
        self
    }

    pub fn sigint_timeout(&self) -> Duration {
        Duration::from_millis(self.sigint_timeout_ms)
    }

    pub fn sigterm_timeout(&self) -> Duration {
        Duration::from_millis(self.sigterm_timeout_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring {key}={raw:?}: not a valid number");
            None
        }
    }
}

/// Convert a string to a boolean.
///
/// Valid true values: `"1"`, `"true"`, `"$true"` (case-insensitive).
/// Valid false values: `"0"`, `"false"`, `"$false"` (case-insensitive).
pub fn convert_to_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "$true" => Some(true),
        "0" | "false" | "$false" => Some(false),
        _ => None,
    }
}
