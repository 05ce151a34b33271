//! Typed contract checks for requests and collaborator reports.

use thiserror::Error;

use crate::core::types::RunRecord;

/// Request-level problems detected before anything is executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(
        "recording a reproducibility record requires a declaration of outputs \
         to identify the files that are to be reproduced"
    )]
    NoOutputsDeclared,
    #[error("command must not be empty")]
    EmptyCommand,
}

/// Broken collaborator contracts. These abort processing outright.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("run record reports {outputs} output(s) but carries no record id")]
    MissingRecordId { outputs: usize },
    #[error("substitution '{name}' is referenced by the run but has no value")]
    MissingSubstitution { name: String },
    #[error("execution produced {count} run records; exactly one per invocation is supported")]
    MultipleRunRecords { count: usize },
}

/// Return the record id of a run that produced outputs.
pub fn require_record_id(record: &RunRecord) -> Result<&str, InvariantViolation> {
    match record.record_id.as_deref() {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(InvariantViolation::MissingRecordId {
            outputs: record.expanded_outputs.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn record(record_id: Option<&str>) -> RunRecord {
        RunRecord {
            record_id: record_id.map(str::to_string),
            dataset_id: "ds".to_string(),
            cmd: "echo".to_string(),
            inputs: Vec::new(),
            extra_inputs: Vec::new(),
            outputs: vec!["out.txt".to_string()],
            expanded_inputs: Vec::new(),
            expanded_outputs: vec![PathBuf::from("out.txt")],
            substitutions: Default::default(),
        }
    }

    #[test]
    fn record_id_is_returned_when_present() {
        let rec = record(Some("abc"));
        assert_eq!(require_record_id(&rec), Ok("abc"));
    }

    #[test]
    fn missing_or_empty_record_id_is_a_violation() {
        assert_eq!(
            require_record_id(&record(None)),
            Err(InvariantViolation::MissingRecordId { outputs: 1 })
        );
        assert!(require_record_id(&record(Some(""))).is_err());
    }
}
