//! Shared data model for reproducibility recording.
//!
//! These types are the contracts between the orchestrator and its
//! collaborators. They carry no I/O and serialize deterministically
//! (maps are `BTreeMap`, sequences keep declaration order).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::invariants::ValidationError;

/// Action name used for records produced by the orchestrator itself.
pub const RECORD_ACTION: &str = "record_reproducibility";

/// Substitution names provided dynamically by every run.
///
/// These are never required from the caller and never embedded in a
/// provenance URI.
pub const RESERVED_SUBSTITUTIONS: [&str; 5] = ["pwd", "dspath", "tmpdir", "inputs", "outputs"];

pub fn is_reserved_substitution(name: &str) -> bool {
    RESERVED_SUBSTITUTIONS.contains(&name)
}

/// Which path collections are persisted in expanded form next to their
/// templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expand {
    Inputs,
    Outputs,
    Both,
}

impl Expand {
    pub fn inputs(self) -> bool {
        matches!(self, Expand::Inputs | Expand::Both)
    }

    pub fn outputs(self) -> bool {
        matches!(self, Expand::Outputs | Expand::Both)
    }
}

/// One invocation request: a command template plus declared path templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    pub cmd: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub extra_inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<Expand>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
}

impl RunSpec {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Reject requests that cannot possibly yield a reproducibility record.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.outputs.is_empty() {
            return Err(ValidationError::NoOutputsDeclared);
        }
        if self.cmd.trim().is_empty() {
            return Err(ValidationError::EmptyCommand);
        }
        Ok(())
    }
}

/// A substitution value: either a single string or an ordered list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    One(String),
    Many(Vec<String>),
}

impl ParamValue {
    pub fn values(&self) -> &[String] {
        match self {
            ParamValue::One(value) => std::slice::from_ref(value),
            ParamValue::Many(values) => values,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::One(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::One(value)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(values: Vec<String>) -> Self {
        ParamValue::Many(values)
    }
}

/// Placeholder name to value(s) for one run.
pub type SubstitutionTable = BTreeMap<String, ParamValue>;

/// Opaque reference to a synchronized point in the dataset history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoState(pub String);

impl RepoState {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModState {
    Clean,
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl fmt::Display for ModState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModState::Clean => "clean",
            ModState::Added => "added",
            ModState::Modified => "modified",
            ModState::Deleted => "deleted",
            ModState::Renamed => "renamed",
        };
        f.write_str(label)
    }
}

/// One path-level difference between two repository states.
///
/// `path` is relative to the dataset root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub path: PathBuf,
    pub state: ModState,
}

impl ModificationRecord {
    pub fn new(path: impl Into<PathBuf>, state: ModState) -> Self {
        Self {
            path: path.into(),
            state,
        }
    }
}

/// Terminal description of one executed run, as reported by the executor.
///
/// Template fields keep the unexpanded declarations so that one record can
/// parametrically cover many expanded output sets. Expanded paths are
/// relative to the dataset root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub record_id: Option<String>,
    pub dataset_id: String,
    pub cmd: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub extra_inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub expanded_inputs: Vec<PathBuf>,
    #[serde(default)]
    pub expanded_outputs: Vec<PathBuf>,
    #[serde(default)]
    pub substitutions: SubstitutionTable,
}

impl RunRecord {
    /// Command, input, extra-input and output templates in declaration order.
    pub fn templates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.cmd.as_str())
            .chain(self.inputs.iter().map(String::as_str))
            .chain(self.extra_inputs.iter().map(String::as_str))
            .chain(self.outputs.iter().map(String::as_str))
    }
}

/// Content-derived address of a file's bytes in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(pub String);

impl ContentKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unit submitted to the content store: attach `url` to `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEntry {
    pub key: ContentKey,
    pub url: String,
    pub path: PathBuf,
}

/// Per-entry outcome of a batched registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Registered,
    Failed(String),
}

/// Execution policy handed to the run executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionPolicy {
    /// Abort at the first failing sub-step.
    pub stop_on_failure: bool,
    /// Delete declared outputs before running so the run must regenerate them.
    pub remove_outputs: bool,
    /// Record templates rather than expanded values in the run record.
    pub parametric_record: bool,
    /// Report both consumed inputs and produced outputs in expanded form.
    pub report_expanded: Expand,
}

impl ExecutionPolicy {
    /// The only policy under which a run can prove reproducibility.
    pub const fn reproducibility() -> Self {
        Self {
            stop_on_failure: true,
            remove_outputs: true,
            parametric_record: true,
            report_expanded: Expand::Both,
        }
    }
}

/// Event emitted by the run executor while a run is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Progress or status report, forwarded to the caller unchanged.
    Status(ResultRecord),
    /// Terminal description of the run.
    Record(RunRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Impossible,
    Error,
}

/// Phase-specific payload of a [`ResultRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ResultDetail {
    Validation,
    Precheck,
    Run {
        #[serde(skip_serializing_if = "Option::is_none")]
        record_id: Option<String>,
    },
    Modification {
        state: ModState,
        hint: String,
    },
    Registration {
        key: ContentKey,
        url: String,
    },
    Summary {
        registered: usize,
        failed: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
}

/// Result record emitted to the caller, one per phase outcome, offending
/// path or registration entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRecord {
    pub action: String,
    pub status: Status,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(flatten)]
    pub detail: ResultDetail,
}

impl ResultRecord {
    pub fn new(
        action: impl Into<String>,
        status: Status,
        message: impl Into<String>,
        detail: ResultDetail,
    ) -> Self {
        Self {
            action: action.into(),
            status,
            message: message.into(),
            path: None,
            detail,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_outputs() {
        let spec = RunSpec::new("echo");
        assert_eq!(spec.validate(), Err(ValidationError::NoOutputsDeclared));
    }

    #[test]
    fn validate_rejects_blank_command() {
        let spec = RunSpec::new("  ").with_outputs(["out.txt"]);
        assert_eq!(spec.validate(), Err(ValidationError::EmptyCommand));
    }

    #[test]
    fn param_value_deserializes_scalar_or_list() {
        let table: SubstitutionTable =
            serde_json::from_str(r#"{"a": "1", "b": ["2", "3"]}"#).expect("parse");
        assert_eq!(table["a"].values(), ["1".to_string()]);
        assert_eq!(table["b"].values(), ["2".to_string(), "3".to_string()]);
    }

    #[test]
    fn result_record_flattens_phase_tag() {
        let record = ResultRecord::new(
            RECORD_ACTION,
            Status::Error,
            "illegal dataset modification",
            ResultDetail::Modification {
                state: ModState::Modified,
                hint: "reset".to_string(),
            },
        )
        .with_path("/ds/other.txt");

        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["phase"], "modification");
        assert_eq!(value["status"], "error");
        assert_eq!(value["state"], "modified");
        assert_eq!(value["path"], "/ds/other.txt");
    }

    #[test]
    fn status_orders_by_severity() {
        assert!(Status::Ok < Status::Impossible);
        assert!(Status::Impossible < Status::Error);
    }
}
