//! Stable exit codes for repro CLI commands.

use crate::core::types::Status;

/// Every record was `ok` or `impossible`.
pub const OK: i32 = 0;
/// At least one record was `error`, or the command itself failed.
pub const ERROR: i32 = 1;

/// Exit code for a run whose most severe record status was `worst`.
pub fn for_worst_status(worst: Option<Status>) -> i32 {
    match worst {
        Some(Status::Error) => ERROR,
        Some(Status::Ok | Status::Impossible) | None => OK,
    }
}
