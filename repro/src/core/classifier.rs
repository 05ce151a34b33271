//! Classification of repository modifications made by a run.

use std::path::{Component, Path};

use crate::core::types::{ModState, ModificationRecord};

/// Outcome of [`classify_modifications`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Classification {
    /// Records that void the run for registration purposes.
    pub problems: Vec<ModificationRecord>,
}

impl Classification {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Split `records` into tolerated changes and problems.
///
/// - `clean` records are always tolerated.
/// - The first `added` record strictly under `sidecar_dir` is tolerated.
/// - Everything else is a problem, including a second sidecar addition.
///
/// Problems keep the input order.
pub fn classify_modifications(
    records: &[ModificationRecord],
    sidecar_dir: &Path,
) -> Classification {
    let mut sidecar_seen = false;
    let mut problems = Vec::new();
    for record in records {
        match record.state {
            ModState::Clean => continue,
            ModState::Added if !sidecar_seen && is_strictly_under(&record.path, sidecar_dir) => {
                sidecar_seen = true;
            }
            _ => problems.push(record.clone()),
        }
    }
    Classification { problems }
}

fn is_strictly_under(path: &Path, dir: &Path) -> bool {
    let mut path_parts = normal_components(path);
    for dir_part in normal_components(dir) {
        match path_parts.next() {
            Some(part) if part == dir_part => {}
            _ => return false,
        }
    }
    path_parts.next().is_some()
}

fn normal_components(path: &Path) -> impl Iterator<Item = Component<'_>> {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir | Component::RootDir))
}
