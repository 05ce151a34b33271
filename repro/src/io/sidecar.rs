//! Run-record sidecar files under the runinfo directory.
//!
//! A sidecar is the JSON description of one run. Its file name is the
//! SHA-256 of its content, which doubles as the run's record id.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::types::{Expand, SubstitutionTable};

/// Persisted description of a run.
///
/// Templates are stored unexpanded so the record covers every
/// parametrization; `substitutions` holds the values used this time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidecar {
    pub dataset_id: String,
    pub cmd: String,
    pub inputs: Vec<String>,
    pub extra_inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<Expand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expanded_inputs: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expanded_outputs: Vec<PathBuf>,
    pub substitutions: SubstitutionTable,
    pub exit: i32,
    pub recorded_at: DateTime<Utc>,
}

/// Where a sidecar landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenSidecar {
    pub record_id: String,
    /// Path relative to the dataset root.
    pub path: PathBuf,
}

fn render(sidecar: &Sidecar) -> Result<String> {
    let mut buf = serde_json::to_string_pretty(sidecar).context("serialize sidecar")?;
    buf.push('\n');
    Ok(buf)
}

/// Content-derived record id of a sidecar.
pub fn record_id(sidecar: &Sidecar) -> Result<String> {
    let body = render(sidecar)?;
    Ok(hex::encode(Sha256::digest(body.as_bytes())))
}

/// Write `sidecar` to `<root>/<runinfo_dir>/<record id>`.
pub fn write_sidecar(root: &Path, runinfo_dir: &Path, sidecar: &Sidecar) -> Result<WrittenSidecar> {
    let body = render(sidecar)?;
    let record_id = hex::encode(Sha256::digest(body.as_bytes()));
    let rel_path = runinfo_dir.join(&record_id);
    let abs_path = root.join(&rel_path);
    let parent = abs_path
        .parent()
        .with_context(|| format!("sidecar path missing parent {}", abs_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = abs_path.with_extension("tmp");
    fs::write(&tmp_path, &body).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &abs_path)
        .with_context(|| format!("replace sidecar {}", abs_path.display()))?;
    debug!(%record_id, path = %rel_path.display(), "sidecar written");
    Ok(WrittenSidecar {
        record_id,
        path: rel_path,
    })
}

pub fn load_sidecar(path: &Path) -> Result<Sidecar> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse sidecar {}", path.display()))
}
