//! User settings: default shift times, randomization and break window, and
//! where the extension bridge listens.
//!
//! Stored as camelCase JSON. Values are read leniently: a missing or
//! malformed field falls back to its default instead of rejecting the file.

use crate::extension_bridge::DEFAULT_WS_ADDR;
use crate::messages::RunPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CLOCK_IN: &str = "09:00";
pub const DEFAULT_CLOCK_OUT: &str = "17:00";
pub const DEFAULT_RANDOMIZE_MINUTES: u32 = 15;
pub const DEFAULT_BREAK_START: &str = "12:00";
pub const DEFAULT_BREAK_DURATION_MINUTES: u32 = 30;

const SETTINGS_DIR: &str = "clockfill";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawSettings")]
pub struct Settings {
    pub clock_in: String,
    pub clock_out: String,
    pub randomize_enabled: bool,
    pub randomize_minutes: u32,
    pub break_enabled: bool,
    pub break_start: String,
    pub break_duration_minutes: u32,
    pub bridge_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            clock_in: DEFAULT_CLOCK_IN.to_string(),
            clock_out: DEFAULT_CLOCK_OUT.to_string(),
            randomize_enabled: false,
            randomize_minutes: DEFAULT_RANDOMIZE_MINUTES,
            break_enabled: false,
            break_start: DEFAULT_BREAK_START.to_string(),
            break_duration_minutes: DEFAULT_BREAK_DURATION_MINUTES,
            bridge_addr: DEFAULT_WS_ADDR.to_string(),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawSettings {
    clock_in: Option<Value>,
    clock_out: Option<Value>,
    randomize_enabled: Option<Value>,
    randomize_minutes: Option<Value>,
    break_enabled: Option<Value>,
    break_start: Option<Value>,
    break_duration_minutes: Option<Value>,
    bridge_addr: Option<Value>,
}

fn string_or(value: Option<Value>, default: &str) -> String {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        _ => default.to_string(),
    }
}

/// Booleans stored as anything else are read by truthiness.
fn flag_or(value: Option<Value>, default: bool) -> bool {
    match value {
        None | Some(Value::Null) => default,
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(default),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Integers, or strings with a leading integer; anything else is the default.
fn minutes_or(value: Option<Value>, default: u32) -> u32 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Some(Value::String(s)) => {
            let s = s.trim();
            let end = s
                .char_indices()
                .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
                .map(|(i, _)| i)
                .unwrap_or(s.len());
            s[..end].parse::<i64>().ok()
        }
        _ => None,
    };
    parsed
        .map(|v| v.clamp(0, i64::from(u32::MAX)) as u32)
        .unwrap_or(default)
}

impl From<RawSettings> for Settings {
    fn from(raw: RawSettings) -> Self {
        Self {
            clock_in: string_or(raw.clock_in, DEFAULT_CLOCK_IN),
            clock_out: string_or(raw.clock_out, DEFAULT_CLOCK_OUT),
            randomize_enabled: flag_or(raw.randomize_enabled, false),
            randomize_minutes: minutes_or(raw.randomize_minutes, DEFAULT_RANDOMIZE_MINUTES),
            break_enabled: flag_or(raw.break_enabled, false),
            break_start: string_or(raw.break_start, DEFAULT_BREAK_START),
            break_duration_minutes: minutes_or(
                raw.break_duration_minutes,
                DEFAULT_BREAK_DURATION_MINUTES,
            ),
            bridge_addr: string_or(raw.bridge_addr, DEFAULT_WS_ADDR),
        }
    }
}

impl Settings {
    /// `<config dir>/clockfill/settings.json`, when the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(SETTINGS_DIR).join(SETTINGS_FILE))
    }

    pub fn from_json(text: &str) -> Result<Settings, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn load_from(path: &Path) -> Result<Settings, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` if given; otherwise the default location, falling back
    /// to built-in defaults when no file exists there.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        if let Some(path) = path {
            return Self::load_from(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            other => {
                debug!(path = ?other, "No settings file; using defaults");
                Ok(Settings::default())
            }
        }
    }

    /// The run request these settings describe.
    pub fn to_run_payload(&self) -> RunPayload {
        RunPayload {
            clock_in: self.clock_in.clone(),
            clock_out: self.clock_out.clone(),
            randomize_enabled: Some(self.randomize_enabled),
            randomize_minutes: Some(self.randomize_minutes),
            break_enabled: Some(self.break_enabled),
            break_start: Some(self.break_start.clone()),
            break_duration_minutes: Some(self.break_duration_minutes),
        }
    }
}
