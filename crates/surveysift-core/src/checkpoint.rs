//! Durable run progress.
//!
//! A [`Checkpoint`] is a versioned snapshot of every result slot gathered so
//! far plus the accountant totals. [`CheckpointStore`] keeps one file per
//! committed boundary, `progress_<next_index>.json`, written atomically:
//! serialize to a temp file in the same directory, then rename over the
//! target. A crash mid-write leaves the previous checkpoint intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::accounting::AccountantSnapshot;
use crate::domain::{CandidateFingerprint, CandidateRecord, EvaluationOutcome, Result, SiftError};

/// Highest checkpoint schema this build can read.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

const FILE_PREFIX: &str = "progress_";
const FILE_SUFFIX: &str = ".json";

/// Snapshot of a run at a committed boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run_id: String,
    pub total_candidates: usize,
    /// First index not guaranteed complete. Every slot below it is filled.
    pub next_index: usize,
    /// Identity of the candidate at `next_index`; `None` once the run is done.
    pub next_candidate: Option<CandidateFingerprint>,
    /// One slot per candidate. Slots at or past `next_index` may already be
    /// filled by out-of-order completions.
    pub results: Vec<Option<EvaluationOutcome>>,
    pub usage: AccountantSnapshot,
    pub model: String,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        run_id: impl Into<String>,
        candidates: &[CandidateRecord],
        next_index: usize,
        results: Vec<Option<EvaluationOutcome>>,
        usage: AccountantSnapshot,
        model: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run_id: run_id.into(),
            total_candidates: candidates.len(),
            next_index,
            next_candidate: candidates.get(next_index).map(CandidateRecord::fingerprint),
            results,
            usage,
            model: model.into(),
            updated_at: Utc::now(),
        }
    }

    /// Number of filled slots.
    pub fn recorded(&self) -> usize {
        self.results.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.next_index >= self.total_candidates
    }

    /// Confirm this checkpoint belongs to `candidates`.
    ///
    /// Checks the input length, the candidate at `next_index`, and the id of
    /// every recorded slot.
    pub fn verify_against(&self, candidates: &[CandidateRecord]) -> Result<()> {
        if self.schema_version > CHECKPOINT_SCHEMA_VERSION {
            return Err(SiftError::UnsupportedCheckpointVersion {
                found: self.schema_version,
                supported: CHECKPOINT_SCHEMA_VERSION,
            });
        }
        if self.total_candidates != candidates.len() {
            return Err(SiftError::CheckpointMismatch {
                index: self.next_index,
                expected: format!("{} candidates", self.total_candidates),
                actual: format!("{} candidates", candidates.len()),
            });
        }
        if self.results.len() != self.total_candidates {
            return Err(SiftError::CheckpointCorrupt(format!(
                "{} result slots for {} candidates",
                self.results.len(),
                self.total_candidates
            )));
        }
        if self.next_index > self.total_candidates {
            return Err(SiftError::CheckpointCorrupt(format!(
                "next_index {} past end of input ({})",
                self.next_index, self.total_candidates
            )));
        }

        if let Some(current) = candidates.get(self.next_index) {
            let actual = current.fingerprint();
            match &self.next_candidate {
                Some(expected) if *expected == actual => {}
                Some(expected) => {
                    return Err(SiftError::CheckpointMismatch {
                        index: self.next_index,
                        expected: format!("{} ({})", expected.id, short(&expected.digest)),
                        actual: format!("{} ({})", actual.id, short(&actual.digest)),
                    })
                }
                None => {
                    return Err(SiftError::CheckpointCorrupt(format!(
                        "no candidate recorded for next_index {}",
                        self.next_index
                    )))
                }
            }
        }

        for (index, (slot, candidate)) in self.results.iter().zip(candidates).enumerate() {
            match slot {
                Some(outcome) if outcome.candidate_id() != candidate.id => {
                    return Err(SiftError::CheckpointMismatch {
                        index,
                        expected: outcome.candidate_id().to_string(),
                        actual: candidate.id.clone(),
                    });
                }
                None if index < self.next_index => {
                    return Err(SiftError::CheckpointCorrupt(format!(
                        "slot {index} is empty but below next_index {}",
                        self.next_index
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

/// Directory of `progress_<n>.json` files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, next_index: usize) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{next_index}{FILE_SUFFIX}"))
    }

    /// Write `checkpoint` atomically and return its path.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(checkpoint.next_index);
        let body = serde_json::to_vec_pretty(checkpoint)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(path = %path.display(), next_index = checkpoint.next_index, "checkpoint saved");
        Ok(path)
    }

    /// Read one checkpoint file. Newer schema versions are refused.
    pub fn load(&self, path: &Path) -> Result<Checkpoint> {
        let raw = fs::read(path)?;
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| SiftError::CheckpointCorrupt(format!("{}: {e}", path.display())))?;

        let found = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| {
                SiftError::CheckpointCorrupt(format!("{}: no schema_version", path.display()))
            })?;
        let found = u32::try_from(found).unwrap_or(u32::MAX);
        if found > CHECKPOINT_SCHEMA_VERSION {
            return Err(SiftError::UnsupportedCheckpointVersion {
                found,
                supported: CHECKPOINT_SCHEMA_VERSION,
            });
        }

        serde_json::from_value(value)
            .map_err(|e| SiftError::CheckpointCorrupt(format!("{}: {e}", path.display())))
    }

    /// Checkpoint files sorted by ascending `next_index`.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let index = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(FILE_PREFIX))
                .and_then(|n| n.strip_suffix(FILE_SUFFIX))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(index) = index {
                found.push((index, path));
            }
        }
        found.sort_by_key(|(index, _)| *index);
        Ok(found)
    }

    /// The checkpoint with the highest index that loads cleanly.
    ///
    /// Unreadable or corrupt files are skipped with a warning. A file from a
    /// newer schema is an error: silently resuming from an older one would
    /// discard that run's progress.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        for (index, path) in self.list()?.into_iter().rev() {
            match self.load(&path) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(err @ SiftError::UnsupportedCheckpointVersion { .. }) => return Err(err),
                Err(err) => {
                    warn!(path = %path.display(), index, error = %err, "skipping unreadable checkpoint");
                }
            }
        }
        Ok(None)
    }

    /// Delete all but the newest `keep_last` checkpoints. Returns how many
    /// files were removed.
    pub fn prune(&self, keep_last: usize) -> Result<usize> {
        let files = self.list()?;
        let excess = files.len().saturating_sub(keep_last);
        for (_, path) in &files[..excess] {
            fs::remove_file(path)?;
        }
        Ok(excess)
    }

    /// Delete every checkpoint file, and the directory if that leaves it empty.
    pub fn clear(&self) -> Result<usize> {
        let files = self.list()?;
        for (_, path) in &files {
            fs::remove_file(path)?;
        }
        if fs::remove_dir(&self.dir).is_err() {
            debug!(dir = %self.dir.display(), "checkpoint directory kept (not empty or missing)");
        }
        Ok(files.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureCause, FailureMarker, TokenUsage};
    use crate::fakes::candidates;

    fn marker(c: &CandidateRecord) -> Option<EvaluationOutcome> {
        Some(EvaluationOutcome::Failure(FailureMarker::new(
            c,
            FailureCause::Rejected {
                detail: "test".into(),
            },
            TokenUsage::empty("gpt-4"),
            1,
        )))
    }

    fn checkpoint_at(input: &[CandidateRecord], next_index: usize) -> Checkpoint {
        let results = input
            .iter()
            .enumerate()
            .map(|(i, c)| if i < next_index { marker(c) } else { None })
            .collect();
        Checkpoint::new(
            "run-1",
            input,
            next_index,
            results,
            AccountantSnapshot::default(),
            "gpt-4",
        )
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt"));
        let input = candidates(20);
        let cp = checkpoint_at(&input, 10);

        let path = store.save(&cp).unwrap();
        assert!(path.ends_with("progress_10.json"));
        assert_eq!(store.load(&path).unwrap(), cp);

        // Only the checkpoint itself remains; the temp file was renamed.
        let names: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_load_latest_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let input = candidates(30);
        store.save(&checkpoint_at(&input, 10)).unwrap();
        store.save(&checkpoint_at(&input, 20)).unwrap();
        fs::write(store.path_for(30), b"{\"schema_version\": 1, \"truncated").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.next_index, 20);
        assert_eq!(store.list().unwrap().len(), 3);
    }

    #[test]
    fn test_load_latest_on_missing_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent"));
        assert!(store.load_latest().unwrap().is_none());
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let input = candidates(10);
        let mut cp = checkpoint_at(&input, 0);
        cp.schema_version = CHECKPOINT_SCHEMA_VERSION + 1;
        let path = store.save(&cp).unwrap();
        assert!(matches!(
            store.load(&path),
            Err(SiftError::UnsupportedCheckpointVersion { found: 2, supported: 1 })
        ));
        assert!(store.load_latest().is_err());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let input = candidates(4);
        let cp = checkpoint_at(&input, 2);
        let mut value = serde_json::to_value(&cp).unwrap();
        value["written_by"] = serde_json::json!("a later build");
        let path = store.path_for(2);
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(store.load(&path).unwrap(), cp);
    }

    #[test]
    fn test_verify_accepts_matching_input() {
        let input = candidates(20);
        checkpoint_at(&input, 10).verify_against(&input).unwrap();
        checkpoint_at(&input, 20).verify_against(&input).unwrap();
    }

    #[test]
    fn test_verify_rejects_other_input() {
        let input = candidates(20);
        let cp = checkpoint_at(&input, 10);

        assert!(matches!(
            cp.verify_against(&candidates(21)),
            Err(SiftError::CheckpointMismatch { .. })
        ));

        let mut edited = input.clone();
        edited[10].abstract_text.push_str(" (revised)");
        assert!(matches!(
            cp.verify_against(&edited),
            Err(SiftError::CheckpointMismatch { index: 10, .. })
        ));

        let mut reordered = input.clone();
        reordered.swap(3, 4);
        assert!(matches!(
            cp.verify_against(&reordered),
            Err(SiftError::CheckpointMismatch { index: 3, .. })
        ));
    }

    #[test]
    fn test_prune_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt"));
        let input = candidates(40);
        for n in [10, 20, 30, 40] {
            store.save(&checkpoint_at(&input, n)).unwrap();
        }
        assert_eq!(store.prune(2).unwrap(), 2);
        let left: Vec<usize> = store.list().unwrap().into_iter().map(|(i, _)| i).collect();
        assert_eq!(left, vec![30, 40]);

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
        assert!(!store.dir().exists());
    }
}
