//! Session configuration.
//!
//! Loaded from `<confdir>/proof/etc/<conffile>` (the conffile name arrives in
//! the master handshake; workers and bare masters fall back to `proof.toml`).
//! A missing file yields defaults: no startup scripts and an empty fleet.

use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Known top-level config keys.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["load", "logon", "master"];

/// Known keys within the `[master]` section.
const KNOWN_MASTER_KEYS: &[&str] = &["workers", "packet_size"];

const DEFAULT_CONF_FILE: &str = "proof.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MasterConfig {
  /// Worker endpoints as `host:port`, connected in ordinal order.
  #[serde(default)]
  pub workers: Vec<String>,
  /// Entries handed out per packet; derived from the dataset when unset.
  #[serde(default)]
  pub packet_size: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
  /// Script sourced into the evaluator right after the handshake.
  #[serde(default)]
  pub load: Option<String>,
  /// Logon script, suppressed by the `--no-logon` flag.
  #[serde(default)]
  pub logon: Option<String>,
  #[serde(default)]
  pub master: MasterConfig,
}

impl SessionConfig {
  pub fn path_in(conf_dir: &Path, conf_file: &str) -> PathBuf {
    let name = if conf_file.is_empty() {
      DEFAULT_CONF_FILE
    } else {
      conf_file
    };
    conf_dir.join("proof").join("etc").join(name)
  }

  pub fn load_from(conf_dir: &Path, conf_file: &str) -> Result<Self> {
    let path = Self::path_in(conf_dir, conf_file);
    if !path.exists() {
      return Ok(Self::default());
    }
    let text = fs::read_to_string(&path)
      .with_context(|| format!("read config {}", path.display()))?;
    warn_unknown_keys(&text, &path);
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
  }
}

/// Warns about config keys this version does not understand, without
/// rejecting the file.
fn warn_unknown_keys(text: &str, path: &Path) {
  let Ok(value) = text.parse::<toml::Value>() else {
    return;
  };
  let Some(table) = value.as_table() else {
    return;
  };
  for key in table.keys() {
    if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
      warn!("Unknown key '{}' in {}", key, path.display());
    }
  }
  if let Some(master) = table.get("master").and_then(|v| v.as_table()) {
    for key in master.keys() {
      if !KNOWN_MASTER_KEYS.contains(&key.as_str()) {
        warn!("Unknown key 'master.{}' in {}", key, path.display());
      }
    }
  }
}
