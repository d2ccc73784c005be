//! File-backed checkpoint storage with atomic writes and GC.
//!
//! One JSON document per episode, named `checkpoint_<episode_id>.json`
//! inside the configured directory (default
//! `$TMPDIR/predicato-checkpoints`). Writes serialize to a temp file
//! beside the target and rename it into place, so readers never observe a
//! torn document. Completion leaves a small `completed_<episode_id>.json`
//! tombstone carrying the final result, which makes re-ingestion of a
//! finished episode a no-op until the caller clears it.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  $TMPDIR/predicato-checkpoints/               │
//! │    checkpoint_ep-1.json   (in flight)         │
//! │    checkpoint_ep-7.json   (stalled, retryable)│
//! │    completed_ep-0.json    (tombstone)         │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Episode ids become file names, so they are validated before any
//! filesystem access: empty ids, path separators, `..`, and NUL are all
//! rejected with [`CheckpointError::InvalidEpisodeId`], and the resolved
//! path must stay lexically inside the checkpoint directory.
//!
//! A single manager owns a checkpoint for the duration of one episode's
//! processing. Two orchestrators driving the same episode id concurrently
//! is undefined behavior; no file lock is taken.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Duration;
use tokio::fs;
use tracing::{debug, warn};

use predicato_graph::{Episode, IngestionOptions};

use crate::checkpoint::EpisodeCheckpoint;
use crate::error::{CheckpointError, Result};
use crate::step::IngestStep;

const CHECKPOINT_PREFIX: &str = "checkpoint_";
const TOMBSTONE_PREFIX: &str = "completed_";
const FILE_SUFFIX: &str = ".json";

/// Aggregate view over the checkpoint directory.
#[derive(Debug, Clone, Default)]
pub struct CheckpointStatistics {
    /// Checkpoints currently on disk.
    pub total: usize,
    /// Checkpoints whose attempts are exhausted.
    pub failed: usize,
    /// Checkpoints idle longer than the stall threshold.
    pub stalled: usize,
    /// Checkpoints parked on an NLP-backed (resumable) step.
    pub recoverable: usize,
    /// Count per step tag.
    pub by_step: HashMap<String, usize>,
}

/// File-backed store for [`EpisodeCheckpoint`] documents.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    directory: PathBuf,
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointManager {
    /// Manager over the default directory,
    /// `$TMPDIR/predicato-checkpoints`.
    pub fn new() -> Self {
        Self {
            directory: std::env::temp_dir().join("predicato-checkpoints"),
        }
    }

    /// Manager over an explicit directory.
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// The configured checkpoint directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Load a checkpoint. A missing id is `Ok(None)`, not an error.
    pub async fn load(&self, episode_id: &str) -> Result<Option<EpisodeCheckpoint>> {
        let path = self.checkpoint_path(episode_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Persist a checkpoint, stamping `last_updated_at`.
    pub async fn save(&self, checkpoint: &mut EpisodeCheckpoint) -> Result<()> {
        let path = self.checkpoint_path(&checkpoint.episode_id)?;
        checkpoint.last_updated_at = chrono::Utc::now();
        self.write_atomic(&path, &serde_json::to_vec_pretty(checkpoint)?)
            .await?;
        debug!(
            episode_id = %checkpoint.episode_id,
            step = %checkpoint.step,
            progress = checkpoint.progress(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Advance the checkpoint to `step` and persist it.
    pub async fn save_with_step(
        &self,
        checkpoint: &mut EpisodeCheckpoint,
        step: IngestStep,
    ) -> Result<()> {
        checkpoint.advance_to(step);
        self.save(checkpoint).await
    }

    /// Record a failed attempt and persist it.
    pub async fn save_with_error(
        &self,
        checkpoint: &mut EpisodeCheckpoint,
        error: impl std::fmt::Display,
        stack: Option<String>,
    ) -> Result<()> {
        checkpoint.record_error(error, stack);
        self.save(checkpoint).await
    }

    /// Remove a checkpoint. Deleting a missing checkpoint succeeds.
    pub async fn delete(&self, episode_id: &str) -> Result<()> {
        let path = self.checkpoint_path(episode_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a checkpoint exists for `episode_id`.
    pub async fn exists(&self, episode_id: &str) -> Result<bool> {
        let path = self.checkpoint_path(episode_id)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Load the checkpoint for `episode.id`, or create a fresh one at
    /// [`IngestStep::Initial`] if none exists.
    pub async fn load_or_create(
        &self,
        episode: &Episode,
        options: &IngestionOptions,
        max_characters: usize,
    ) -> Result<EpisodeCheckpoint> {
        if let Some(existing) = self.load(&episode.id).await? {
            debug!(
                episode_id = %episode.id,
                step = %existing.step,
                attempts = existing.attempt_count,
                "resuming from existing checkpoint"
            );
            return Ok(existing);
        }
        Ok(EpisodeCheckpoint::new(
            episode.clone(),
            options.clone(),
            max_characters,
        ))
    }

    /// Every parseable checkpoint in the directory.
    ///
    /// Files without the checkpoint prefix/suffix are ignored, as are
    /// documents that fail to parse; a corrupt checkpoint never aborts
    /// enumeration.
    pub async fn list(&self) -> Result<Vec<EpisodeCheckpoint>> {
        let mut checkpoints = Vec::new();
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(CHECKPOINT_PREFIX) || !name.ends_with(FILE_SUFFIX) {
                continue;
            }
            let bytes = match fs::read(entry.path()).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(file = %name, error = %err, "skipping unreadable checkpoint");
                    continue;
                }
            };
            match serde_json::from_slice::<EpisodeCheckpoint>(&bytes) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(err) => {
                    warn!(file = %name, error = %err, "skipping corrupt checkpoint");
                }
            }
        }
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(checkpoints)
    }

    /// Checkpoints idle longer than `older_than`.
    pub async fn find_stalled(&self, older_than: Duration) -> Result<Vec<EpisodeCheckpoint>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|cp| cp.idle_for() > older_than)
            .collect())
    }

    /// Checkpoints whose attempts are exhausted.
    pub async fn find_failed(&self, max_attempts: u32) -> Result<Vec<EpisodeCheckpoint>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|cp| cp.attempt_count >= max_attempts)
            .collect())
    }

    /// Delete checkpoints (and tombstones) idle longer than `max_age`.
    /// Returns the number of files removed.
    pub async fn clean_old(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0;
        for checkpoint in self.list().await? {
            if checkpoint.idle_for() > max_age {
                self.delete(&checkpoint.episode_id).await?;
                removed += 1;
                debug!(episode_id = %checkpoint.episode_id, "removed aged checkpoint");
            }
        }
        removed += self.clean_old_tombstones(max_age).await?;
        Ok(removed)
    }

    /// Aggregate statistics over the directory.
    pub async fn get_statistics(
        &self,
        max_attempts: u32,
        stalled_after: Duration,
    ) -> Result<CheckpointStatistics> {
        let mut stats = CheckpointStatistics::default();
        for checkpoint in self.list().await? {
            stats.total += 1;
            if checkpoint.attempt_count >= max_attempts {
                stats.failed += 1;
            }
            if checkpoint.idle_for() > stalled_after {
                stats.stalled += 1;
            }
            if checkpoint.is_recoverable() {
                stats.recoverable += 1;
            }
            *stats
                .by_step
                .entry(checkpoint.step.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Record the final result of a completed episode.
    pub async fn save_tombstone(
        &self,
        episode_id: &str,
        result: &serde_json::Value,
    ) -> Result<()> {
        let path = self.tombstone_path(episode_id)?;
        self.write_atomic(&path, &serde_json::to_vec(result)?).await
    }

    /// The recorded result of a completed episode, if any.
    pub async fn load_tombstone(&self, episode_id: &str) -> Result<Option<serde_json::Value>> {
        let path = self.tombstone_path(episode_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Forget a completed episode so it can be re-ingested from scratch.
    pub async fn clear_tombstone(&self, episode_id: &str) -> Result<()> {
        let path = self.tombstone_path(episode_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn checkpoint_path(&self, episode_id: &str) -> Result<PathBuf> {
        self.path_for(CHECKPOINT_PREFIX, episode_id)
    }

    fn tombstone_path(&self, episode_id: &str) -> Result<PathBuf> {
        self.path_for(TOMBSTONE_PREFIX, episode_id)
    }

    fn path_for(&self, prefix: &str, episode_id: &str) -> Result<PathBuf> {
        validate_episode_id(episode_id)?;
        let path = self
            .directory
            .join(format!("{prefix}{episode_id}{FILE_SUFFIX}"));
        // The resolved path must stay inside the checkpoint directory.
        if !path.starts_with(&self.directory) {
            return Err(CheckpointError::InvalidEpisodeId(episode_id.to_string()));
        }
        Ok(path)
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        self.ensure_directory().await?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).await?;
        }
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn ensure_directory(&self) -> Result<()> {
        if fs::try_exists(&self.directory).await? {
            return Ok(());
        }
        fs::create_dir_all(&self.directory).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.directory, std::fs::Permissions::from_mode(0o755)).await?;
        }
        Ok(())
    }

    async fn clean_old_tombstones(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let cutoff = std::time::SystemTime::now()
            - max_age.to_std().unwrap_or(std::time::Duration::ZERO);
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(TOMBSTONE_PREFIX) || !name.ends_with(FILE_SUFFIX) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let modified = metadata.modified().unwrap_or(std::time::SystemTime::now());
            if modified < cutoff {
                if fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Reject ids that are empty or could escape the checkpoint directory.
fn validate_episode_id(episode_id: &str) -> Result<()> {
    let invalid = episode_id.is_empty()
        || episode_id.contains('/')
        || episode_id.contains('\\')
        || episode_id.contains("..")
        || episode_id.contains('\0');
    if invalid {
        return Err(CheckpointError::InvalidEpisodeId(episode_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use predicato_graph::Episode;
    use tempfile::TempDir;

    fn manager() -> (TempDir, CheckpointManager) {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::with_directory(dir.path());
        (dir, manager)
    }

    fn checkpoint(id: &str) -> EpisodeCheckpoint {
        EpisodeCheckpoint::new(
            Episode::new(id, "g", "Alice works for Acme."),
            IngestionOptions::default(),
            1000,
        )
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrips() {
        let (_dir, manager) = manager();
        let mut cp = checkpoint("ep-1");
        cp.chunks = Some(vec!["Alice works for Acme.".into()]);
        manager.save(&mut cp).await.unwrap();

        let loaded = manager.load("ep-1").await.unwrap().unwrap();
        // Equal except last_updated_at, which save stamps.
        assert_eq!(loaded, cp);
        assert_eq!(loaded.chunks.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let (_dir, manager) = manager();
        assert!(manager.load("ep-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, manager) = manager();
        let mut cp = checkpoint("ep-1");
        manager.save(&mut cp).await.unwrap();
        manager.delete("ep-1").await.unwrap();
        manager.delete("ep-1").await.unwrap();
        assert!(!manager.exists("ep-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_ids_are_rejected_without_touching_disk() {
        let (dir, manager) = manager();
        for id in ["", "../etc/passwd", "a/b", "a\\b", "a\0b", "a..b"] {
            let result = manager.load(id).await;
            assert!(
                matches!(result, Err(CheckpointError::InvalidEpisodeId(_))),
                "{id:?} should be rejected"
            );
            assert!(manager.delete(id).await.is_err());
            assert!(manager.exists(id).await.is_err());
        }
        let mut cp = checkpoint("ok");
        cp.episode_id = "a/b".to_string();
        assert!(manager.save(&mut cp).await.is_err());
        // Nothing was created.
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_files() {
        let (dir, manager) = manager();
        let mut cp = checkpoint("ep-1");
        manager.save(&mut cp).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["checkpoint_ep-1.json".to_string()]);
    }

    #[tokio::test]
    async fn test_list_skips_foreign_and_corrupt_files() {
        let (dir, manager) = manager();
        let mut cp = checkpoint("ep-1");
        manager.save(&mut cp).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("checkpoint_bad.json"), "{not json").unwrap();

        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].episode_id, "ep-1");
    }

    #[tokio::test]
    async fn test_clean_old_removes_only_aged_checkpoints() {
        let (_dir, manager) = manager();
        let mut old = checkpoint("ep-old");
        manager.save(&mut old).await.unwrap();
        // Backdate the stored document.
        old.last_updated_at = chrono::Utc::now() - Duration::hours(48);
        let path = manager.checkpoint_path("ep-old").unwrap();
        std::fs::write(&path, serde_json::to_vec_pretty(&old).unwrap()).unwrap();

        let mut fresh = checkpoint("ep-new");
        manager.save(&mut fresh).await.unwrap();

        let removed = manager.clean_old(Duration::hours(24)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!manager.exists("ep-old").await.unwrap());
        assert!(manager.exists("ep-new").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_stalled_returns_idle_checkpoints() {
        let (_dir, manager) = manager();
        let mut old = checkpoint("ep-old");
        manager.save(&mut old).await.unwrap();
        old.last_updated_at = chrono::Utc::now() - Duration::hours(48);
        let path = manager.checkpoint_path("ep-old").unwrap();
        std::fs::write(&path, serde_json::to_vec_pretty(&old).unwrap()).unwrap();
        let mut fresh = checkpoint("ep-new");
        manager.save(&mut fresh).await.unwrap();

        let stalled = manager.find_stalled(Duration::hours(1)).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].episode_id, "ep-old");
    }

    #[tokio::test]
    async fn test_find_failed_uses_attempt_count() {
        let (_dir, manager) = manager();
        let mut failing = checkpoint("ep-fail");
        failing.attempt_count = 3;
        manager.save(&mut failing).await.unwrap();
        let mut healthy = checkpoint("ep-ok");
        manager.save(&mut healthy).await.unwrap();

        let failed = manager.find_failed(3).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].episode_id, "ep-fail");
    }

    #[tokio::test]
    async fn test_statistics_aggregate() {
        let (_dir, manager) = manager();
        let mut a = checkpoint("ep-a");
        a.advance_to(IngestStep::ExtractedEdges);
        manager.save(&mut a).await.unwrap();
        let mut b = checkpoint("ep-b");
        b.attempt_count = 5;
        manager.save(&mut b).await.unwrap();

        let stats = manager
            .get_statistics(3, Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.recoverable, 1);
        assert_eq!(stats.by_step.get("extracted_edges"), Some(&1));
        assert_eq!(stats.by_step.get("initial"), Some(&1));
    }

    #[tokio::test]
    async fn test_load_or_create_prefers_existing() {
        let (_dir, manager) = manager();
        let episode = Episode::new("ep-1", "g", "content");
        let options = IngestionOptions::default();

        let mut first = manager.load_or_create(&episode, &options, 500).await.unwrap();
        first.advance_to(IngestStep::Prepared);
        manager.save(&mut first).await.unwrap();

        let second = manager.load_or_create(&episode, &options, 500).await.unwrap();
        assert_eq!(second.step, IngestStep::Prepared);
    }

    #[tokio::test]
    async fn test_tombstone_lifecycle() {
        let (_dir, manager) = manager();
        let result = serde_json::json!({"resolved_nodes": 2});
        manager.save_tombstone("ep-1", &result).await.unwrap();
        assert_eq!(
            manager.load_tombstone("ep-1").await.unwrap(),
            Some(result)
        );
        manager.clear_tombstone("ep-1").await.unwrap();
        assert!(manager.load_tombstone("ep-1").await.unwrap().is_none());
        // Clearing again is fine.
        manager.clear_tombstone("ep-1").await.unwrap();
    }
}
