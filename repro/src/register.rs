//! Content-key resolution and batched provenance registration.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::types::{
    ContentKey, EntryStatus, RegistrationEntry, ResultDetail, ResultRecord, Status,
};
use crate::io::repository::Repository;

pub const REGISTER_ACTION: &str = "register_url";

/// Entries ready for submission plus the outputs that have no content key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedEntries {
    pub entries: Vec<RegistrationEntry>,
    pub skipped: Vec<PathBuf>,
}

/// Per-entry outcome of one registration batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistrationReport {
    pub outcomes: Vec<(RegistrationEntry, EntryStatus)>,
    pub skipped: Vec<PathBuf>,
}

impl RegistrationReport {
    pub fn registered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, status)| *status == EntryStatus::Registered)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.registered()
    }

    /// One record per submitted entry, with absolute paths.
    pub fn results(&self, root: &Path) -> Vec<ResultRecord> {
        self.outcomes
            .iter()
            .map(|(entry, status)| {
                let (status, message) = match status {
                    EntryStatus::Registered => (Status::Ok, "registered provenance URL".to_string()),
                    EntryStatus::Failed(message) => (Status::Error, message.clone()),
                };
                ResultRecord::new(
                    REGISTER_ACTION,
                    status,
                    message,
                    ResultDetail::Registration {
                        key: entry.key.clone(),
                        url: entry.url.clone(),
                    },
                )
                .with_path(root.join(&entry.path))
            })
            .collect()
    }
}

/// Resolve content keys for `paths` in up to `jobs` parallel chunks and pair
/// each key with `url`.
///
/// Paths without a key are skipped. Paths sharing a key yield one entry.
#[instrument(skip_all, fields(paths = paths.len(), jobs = jobs))]
pub fn resolve_entries<R>(repo: &R, paths: &[PathBuf], url: &str, jobs: usize) -> Result<ResolvedEntries>
where
    R: Repository + Sync + ?Sized,
{
    let keys = resolve_keys(repo, paths, jobs)?;
    if keys.len() != paths.len() {
        return Err(anyhow!(
            "content key lookup answered {} of {} paths",
            keys.len(),
            paths.len()
        ));
    }

    let mut seen: BTreeSet<ContentKey> = BTreeSet::new();
    let mut resolved = ResolvedEntries::default();
    for (path, key) in paths.iter().zip(keys) {
        match key {
            Some(key) if seen.insert(key.clone()) => resolved.entries.push(RegistrationEntry {
                key,
                url: url.to_string(),
                path: path.clone(),
            }),
            Some(key) => debug!(path = %path.display(), %key, "key already queued"),
            None => {
                debug!(path = %path.display(), "not content-addressed, skipping");
                resolved.skipped.push(path.clone());
            }
        }
    }
    Ok(resolved)
}

fn resolve_keys<R>(repo: &R, paths: &[PathBuf], jobs: usize) -> Result<Vec<Option<ContentKey>>>
where
    R: Repository + Sync + ?Sized,
{
    let jobs = jobs.max(1);
    if jobs == 1 || paths.len() < 2 {
        return repo.resolve_content_keys(paths);
    }
    let chunk_size = paths.len().div_ceil(jobs);
    thread::scope(|scope| -> Result<Vec<Option<ContentKey>>> {
        let handles: Vec<_> = paths
            .chunks(chunk_size)
            .map(|chunk| scope.spawn(move || repo.resolve_content_keys(chunk)))
            .collect();
        let mut keys = Vec::with_capacity(paths.len());
        for handle in handles {
            let chunk_keys = handle
                .join()
                .map_err(|_| anyhow!("content key lookup thread panicked"))??;
            keys.extend(chunk_keys);
        }
        Ok(keys)
    })
}

/// Submit all entries in one batched call.
#[instrument(skip_all, fields(entries = resolved.entries.len()))]
pub fn submit_entries<R>(repo: &R, resolved: ResolvedEntries) -> Result<RegistrationReport>
where
    R: Repository + ?Sized,
{
    let ResolvedEntries { entries, skipped } = resolved;
    if entries.is_empty() {
        return Ok(RegistrationReport {
            outcomes: Vec::new(),
            skipped,
        });
    }
    let statuses = repo.register(&entries)?;
    if statuses.len() != entries.len() {
        return Err(anyhow!(
            "content store answered {} of {} registrations",
            statuses.len(),
            entries.len()
        ));
    }
    let report = RegistrationReport {
        outcomes: entries.into_iter().zip(statuses).collect(),
        skipped,
    };
    info!(
        registered = report.registered(),
        failed = report.failed(),
        skipped = report.skipped.len(),
        "registration finished"
    );
    Ok(report)
}

/// Resolve keys for `paths` and register `url` for each of them.
pub fn register_outputs<R>(repo: &R, paths: &[PathBuf], url: &str, jobs: usize) -> Result<RegistrationReport>
where
    R: Repository + Sync + ?Sized,
{
    let resolved = resolve_entries(repo, paths, url, jobs)?;
    submit_entries(repo, resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRepository;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn skips_paths_without_keys() {
        let repo = FakeRepository::new("/ds");
        repo.set_key("a.txt", "KEY-A");

        let report =
            register_outputs(&repo, &paths(&["a.txt", "plain.txt"]), "repro://x", 1).expect("register");
        assert_eq!(report.registered(), 1);
        assert_eq!(report.skipped, paths(&["plain.txt"]));
        assert_eq!(repo.register_calls().len(), 1);
    }

    #[test]
    fn parallel_resolution_keeps_path_order() {
        let repo = FakeRepository::new("/ds");
        let names: Vec<String> = (0..7).map(|i| format!("out/{i}.txt")).collect();
        for (i, name) in names.iter().enumerate() {
            repo.set_key(name, &format!("KEY-{i}"));
        }
        let all: Vec<PathBuf> = names.iter().map(PathBuf::from).collect();

        let resolved = resolve_entries(&repo, &all, "repro://x", 3).expect("resolve");
        let got: Vec<&Path> = resolved.entries.iter().map(|e| e.path.as_path()).collect();
        let want: Vec<&Path> = all.iter().map(PathBuf::as_path).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn duplicate_keys_are_submitted_once() {
        let repo = FakeRepository::new("/ds");
        repo.set_key("a.txt", "SAME");
        repo.set_key("b.txt", "SAME");

        let report =
            register_outputs(&repo, &paths(&["a.txt", "b.txt"]), "repro://x", 2).expect("register");
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(repo.register_calls()[0].len(), 1);
    }

    #[test]
    fn failures_are_reported_per_entry() {
        let repo = FakeRepository::new("/ds");
        repo.set_key("a.txt", "KEY-A");
        repo.set_key("b.txt", "KEY-B");
        repo.fail_key("KEY-A");

        let report =
            register_outputs(&repo, &paths(&["a.txt", "b.txt"]), "repro://x", 1).expect("register");
        assert_eq!(report.registered(), 1);
        assert_eq!(report.failed(), 1);

        let results = report.results(Path::new("/ds"));
        assert_eq!(results[0].status, Status::Error);
        assert_eq!(results[0].path.as_deref(), Some(Path::new("/ds/a.txt")));
        assert_eq!(results[1].status, Status::Ok);
        assert_eq!(repo.registrations().len(), 1);
    }

    #[test]
    fn nothing_to_submit_skips_the_store() {
        let repo = FakeRepository::new("/ds");
        let report = register_outputs(&repo, &paths(&["plain.txt"]), "repro://x", 4).expect("register");
        assert!(report.outcomes.is_empty());
        assert!(repo.register_calls().is_empty());
    }
}
