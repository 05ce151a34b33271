//! Dataset configuration stored under `.repro/config.toml`.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{ParamValue, SubstitutionTable, is_reserved_substitution};
use crate::io::process::ProcessLimits;

pub const CONFIG_RELATIVE_PATH: &str = ".repro/config.toml";
pub const DEFAULT_RUNINFO_DIR: &str = ".repro/runinfo";

/// Recorder configuration (TOML).
///
/// Committed with the dataset so that every clone records runs the same
/// way. Missing fields take defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecordConfig {
    /// Stable dataset identifier embedded in every provenance URI.
    pub dataset_id: Option<String>,

    /// Wall-clock budget for the recorded command, in seconds.
    pub execution_timeout_secs: u64,

    /// Bytes of command stdout/stderr kept for reporting.
    pub output_limit_bytes: usize,

    /// Directory (relative to the dataset root) holding run-record sidecars.
    pub runinfo_dir: PathBuf,

    /// Run-declared substitution values, by placeholder name.
    pub substitutions: SubstitutionTable,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            dataset_id: None,
            execution_timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
            runinfo_dir: PathBuf::from(DEFAULT_RUNINFO_DIR),
            substitutions: SubstitutionTable::new(),
        }
    }
}

impl RecordConfig {
    pub fn validate(&self) -> Result<()> {
        if self.execution_timeout_secs == 0 {
            return Err(anyhow!("execution_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if let Some(id) = &self.dataset_id
            && (id.is_empty() || id.contains(['/', '@', '?', '#']) || id.contains(char::is_whitespace))
        {
            return Err(anyhow!(
                "dataset_id must be non-empty without '/', '@', '?', '#' or whitespace (got '{id}')"
            ));
        }
        let escapes = self
            .runinfo_dir
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if self.runinfo_dir.as_os_str().is_empty() || escapes {
            return Err(anyhow!(
                "runinfo_dir must be a relative path inside the dataset (got '{}')",
                self.runinfo_dir.display()
            ));
        }
        for (name, value) in &self.substitutions {
            if !is_identifier(name) {
                return Err(anyhow!("substitution name '{name}' is not an identifier"));
            }
            if is_reserved_substitution(name) {
                return Err(anyhow!("substitution '{name}' is provided by every run"));
            }
            if let ParamValue::Many(values) = value
                && values.is_empty()
            {
                return Err(anyhow!("substitution '{name}' has no values"));
            }
        }
        Ok(())
    }

    /// The dataset id, required before anything can be recorded.
    pub fn require_dataset_id(&self) -> Result<&str> {
        self.dataset_id
            .as_deref()
            .ok_or_else(|| anyhow!("dataset has no id (run `repro init`)"))
    }

    pub fn process_limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.execution_timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RecordConfig::default()`.
pub fn load_config(path: &Path) -> Result<RecordConfig> {
    if !path.exists() {
        let cfg = RecordConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RecordConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RecordConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
