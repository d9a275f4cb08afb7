use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;

use crate::config::MirrorSettings;
use crate::error::HoardError;
use crate::object_store::ObjectStore;
use crate::pipeline::{FailureRecord, FailureStage, ProgressEvent, ProgressSink};
use crate::source::{ArchiveSource, EntryKind};
use crate::staging::Staging;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorSummary {
    pub dirs_listed: usize,
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub directories_skipped: usize,
    pub elapsed_ms: u64,
    pub failures: Vec<FailureRecord>,
}

impl MirrorSummary {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    fn record_failure(&mut self, stage: FailureStage, subject: &str, err: &HoardError) {
        tracing::warn!(subject, error = %err, "mirror skipped file");
        self.failures.push(FailureRecord {
            stage,
            subject: subject.to_string(),
            message: err.to_string(),
        });
    }
}

/// Copies the flat files of a release, directory by directory, to
/// `<version>/<relative path>` in the bucket. Keys already present are left
/// alone; every file goes through staging and is removed once stored.
pub struct ReleaseMirror<'a, S: ArchiveSource, O: ObjectStore + ?Sized> {
    source: &'a S,
    store: &'a O,
    staging: &'a Staging,
    bucket: &'a str,
    settings: &'a MirrorSettings,
}

impl<'a, S: ArchiveSource, O: ObjectStore + ?Sized> ReleaseMirror<'a, S, O> {
    pub fn new(
        source: &'a S,
        store: &'a O,
        staging: &'a Staging,
        bucket: &'a str,
        settings: &'a MirrorSettings,
    ) -> Self {
        Self {
            source,
            store,
            staging,
            bucket,
            settings,
        }
    }

    fn version_prefix(&self) -> String {
        format!("{}/", self.settings.version.trim_end_matches('/'))
    }

    pub fn run(&self, sink: &dyn ProgressSink) -> Result<MirrorSummary, HoardError> {
        let started = Instant::now();
        let prefix = self.version_prefix();
        let existing: HashSet<String> = self
            .store
            .list(self.bucket, &prefix)?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        tracing::info!(existing = existing.len(), prefix = %prefix, "release objects already stored");

        let root = self.settings.release_root.trim_end_matches('/');
        let mut summary = MirrorSummary::default();
        for dir in &self.settings.dirs {
            let dir = dir.trim_matches('/');
            let remote_dir = if dir == "." || dir.is_empty() {
                root.to_string()
            } else {
                format!("{root}/{dir}")
            };

            let entries = match self.source.list(&remote_dir) {
                Ok(entries) => entries,
                Err(err) if err.is_recoverable() => {
                    summary.record_failure(FailureStage::Fetch, &remote_dir, &err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            summary.dirs_listed += 1;
            sink.event(ProgressEvent {
                message: format!("{remote_dir}: {} entries", entries.len()),
                elapsed: Some(started.elapsed()),
            });

            for entry in entries {
                if entry.kind == EntryKind::Directory {
                    summary.directories_skipped += 1;
                    continue;
                }
                let relative = if dir == "." || dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{dir}/{}", entry.name)
                };
                if existing.contains(&relative) {
                    tracing::debug!(path = %relative, "already mirrored");
                    summary.files_skipped += 1;
                    continue;
                }

                let remote_path = format!("{remote_dir}/{}", entry.name);
                match self.copy_file(&remote_path, &entry.name, &format!("{prefix}{relative}")) {
                    Ok(()) => {
                        summary.files_uploaded += 1;
                        sink.event(ProgressEvent {
                            message: format!("mirrored {relative}"),
                            elapsed: Some(started.elapsed()),
                        });
                    }
                    Err(err) if err.is_recoverable() => {
                        summary.record_failure(FailureStage::Fetch, &remote_path, &err);
                    }
                    Err(err @ HoardError::StorePut { .. }) => {
                        summary.record_failure(FailureStage::Upload, &relative, &err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(summary)
    }

    fn copy_file(&self, remote_path: &str, file_name: &str, key: &str) -> Result<(), HoardError> {
        let local = self.staging.mirror_path(file_name);
        let temp = Staging::temp_beside(&local)?;
        let bytes = self.source.retrieve(remote_path, temp.path())?;
        Staging::persist(temp, &local)?;
        tracing::info!(remote = remote_path, bytes, key, "uploading release file");

        let stored = self.store.put(self.bucket, key, local.as_std_path());
        Staging::remove_file(&local)?;
        stored
    }
}
