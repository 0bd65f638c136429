//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use ssam_core::commands::HidDescriptor;
use ssam_core::transaction::{DEFAULT_RESPONSE_CAPACITY, DEVICE_PATH};
use ssam_core::transfer::{RetryPolicy, TraceBuffer};

/// Tool configuration. File: ~/.config/ssam/config.toml or /etc/ssam/config.toml.
/// Env overrides: SSAM_DEVICE, SSAM_TCL_CHUNK_SIZE, SSAM_HID_CHUNK_SIZE,
/// SSAM_RESPONSE_CAPACITY, SSAM_MAX_TIMEOUT_RETRIES, SSAM_MAX_CHUNKS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Aggregator debug device (default /dev/surface/aggregator).
    #[serde(default = "default_device_path")]
    pub device_path: PathBuf,
    /// Bytes requested per trace buffer chunk (default 0x20).
    #[serde(default = "default_tcl_chunk_size")]
    pub tcl_chunk_size: u16,
    /// Bytes requested per HID descriptor chunk (default 0x76).
    #[serde(default = "default_hid_chunk_size")]
    pub hid_chunk_size: u16,
    /// Response capacity of plain requests (default 1024).
    #[serde(default = "default_response_capacity")]
    pub response_capacity: usize,
    /// Timeouts retried in a row during bulk transfers; unset retries forever.
    #[serde(default)]
    pub max_timeout_retries: Option<u32>,
    /// Chunks read before a bulk transfer gives up; unset is unbounded.
    #[serde(default)]
    pub max_chunks: Option<usize>,
}

fn default_device_path() -> PathBuf {
    PathBuf::from(DEVICE_PATH)
}
fn default_tcl_chunk_size() -> u16 {
    TraceBuffer::DEFAULT_CHUNK_SIZE
}
fn default_hid_chunk_size() -> u16 {
    HidDescriptor::DEFAULT_CHUNK_SIZE
}
fn default_response_capacity() -> usize {
    DEFAULT_RESPONSE_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            tcl_chunk_size: default_tcl_chunk_size(),
            hid_chunk_size: default_hid_chunk_size(),
            response_capacity: default_response_capacity(),
            max_timeout_retries: None,
            max_chunks: None,
        }
    }
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_timeout_retries: self.max_timeout_retries,
            max_chunks: self.max_chunks,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file(&config_paths()).unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SSAM_DEVICE") {
        c.device_path = PathBuf::from(s);
    }
    if let Some(n) = parsed(&var, "SSAM_TCL_CHUNK_SIZE") {
        c.tcl_chunk_size = n;
    }
    if let Some(n) = parsed(&var, "SSAM_HID_CHUNK_SIZE") {
        c.hid_chunk_size = n;
    }
    if let Some(n) = parsed(&var, "SSAM_RESPONSE_CAPACITY") {
        c.response_capacity = n;
    }
    if let Some(n) = parsed(&var, "SSAM_MAX_TIMEOUT_RETRIES") {
        c.max_timeout_retries = Some(n);
    }
    if let Some(n) = parsed(&var, "SSAM_MAX_CHUNKS") {
        c.max_chunks = Some(n);
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let s = var(key)?;
    match s.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring invalid {key}={s:?}");
            None
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ssam/config.toml"));
    }
    out.push(PathBuf::from("/etc/ssam/config.toml"));
    out
}

fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let p = paths.iter().find(|p| p.exists())?;
    read_file(p)
}

fn read_file(p: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(p) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("cannot read {}: {e}", p.display());
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => {
            log::debug!("loaded config from {}", p.display());
            Some(c)
        }
        Err(e) => {
            log::warn!("ignoring invalid config {}: {e}", p.display());
            None
        }
    }
}
