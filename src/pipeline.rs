use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::compress::Compressor;
use crate::config::ResolvedConfig;
use crate::domain::{ArchiveEnumerator, ArchiveIdentifier, HoardLayout};
use crate::error::HoardError;
use crate::fetcher::{ArchiveFetcher, FetchAction};
use crate::inspect::ArchiveInspector;
use crate::metadata::MetadataEnricher;
use crate::object_store::ObjectStore;
use crate::remote_index::RemoteIndex;
use crate::source::ArchiveSource;
use crate::staging::Staging;
use crate::upload::{RetryPolicy, UploadJob, UploadOutcome, UploadWorkerPool};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Fetch,
    Inspect,
    Compress,
    Upload,
}

impl FailureStage {
    fn of(err: &HoardError) -> Self {
        match err {
            HoardError::Archive { .. } => FailureStage::Inspect,
            HoardError::Compression { .. } => FailureStage::Compress,
            HoardError::StorePut { .. } => FailureStage::Upload,
            _ => FailureStage::Fetch,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub stage: FailureStage,
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub archives_total: usize,
    pub archives_downloaded: usize,
    pub archives_cached: usize,
    pub archives_complete: usize,
    pub archives_skipped: usize,
    pub existing_objects: usize,
    pub members_present: usize,
    pub members_scheduled: usize,
    pub members_deduplicated: usize,
    pub uploads_succeeded: usize,
    pub uploads_failed: usize,
    pub records_written: usize,
    pub elapsed_ms: u64,
    pub failures: Vec<FailureRecord>,
}

impl RunSummary {
    fn record_failure(&mut self, subject: &str, err: &HoardError) {
        tracing::warn!(subject, error = %err, "skipping");
        self.failures.push(FailureRecord {
            stage: FailureStage::of(err),
            subject: subject.to_string(),
            message: err.to_string(),
        });
    }

    fn record_outcomes(&mut self, outcomes: &[UploadOutcome]) {
        for outcome in outcomes {
            match outcome {
                UploadOutcome::Uploaded { .. } => self.uploads_succeeded += 1,
                UploadOutcome::Failed { key, error, .. } => {
                    self.uploads_failed += 1;
                    self.failures.push(FailureRecord {
                        stage: FailureStage::Upload,
                        subject: key.clone(),
                        message: error.clone(),
                    });
                }
            }
        }
    }

    /// Some file did not make it to the store and a rerun is needed.
    pub fn has_failures(&self) -> bool {
        self.failures
            .iter()
            .any(|failure| matches!(failure.stage, FailureStage::Compress | FailureStage::Upload))
    }
}

/// Everything the sync run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub bucket: String,
    pub layout: HoardLayout,
    pub enumerator: ArchiveEnumerator,
    pub member_suffix: String,
    pub min_archive_bytes: u64,
    pub staging_dir: Utf8PathBuf,
    pub output_file: Utf8PathBuf,
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            bucket: config.store.bucket.clone(),
            layout: config.layout(),
            enumerator: config.enumerator(),
            member_suffix: config.source.member_suffix.clone(),
            min_archive_bytes: config.source.min_archive_bytes,
            staging_dir: config.local.staging_dir.clone(),
            output_file: config.local.output_file.clone(),
            workers: config.workers,
            retry: RetryPolicy {
                attempts: config.put_attempts,
                ..RetryPolicy::default()
            },
        }
    }
}

/// Sequential fetch, inspect, extract and compress per archive, with uploads
/// handed to a worker pool that runs alongside.
pub struct Pipeline<S: ArchiveSource, O: ObjectStore + ?Sized + 'static> {
    source: S,
    store: Arc<O>,
    compressor: Compressor,
    settings: PipelineSettings,
    staging: Staging,
    inspector: ArchiveInspector,
}

struct RunState {
    summary: RunSummary,
    scheduled: HashSet<String>,
    /// Compressed file behind each queued object key.
    staged: HashMap<String, Utf8PathBuf>,
}

impl RunState {
    /// Folds settled uploads into the summary and the enricher. Compressed
    /// files are dropped once stored; failed ones stay for the next run.
    fn settle(&mut self, outcomes: &[UploadOutcome], enricher: &mut MetadataEnricher) {
        self.summary.record_outcomes(outcomes);
        enricher.apply(outcomes);
        for outcome in outcomes {
            let Some(path) = self.staged.remove(outcome.key()) else {
                continue;
            };
            if outcome.is_uploaded() {
                if let Err(err) = Staging::remove_file(&path) {
                    tracing::warn!(path = %path, error = %err, "could not remove uploaded file");
                }
            }
        }
    }
}

impl<S: ArchiveSource, O: ObjectStore + ?Sized + 'static> Pipeline<S, O> {
    pub fn new(source: S, store: Arc<O>, compressor: Compressor, settings: PipelineSettings) -> Self {
        let staging = Staging::new(settings.staging_dir.clone());
        let inspector = ArchiveInspector::new(settings.layout.clone(), &settings.member_suffix);
        Self {
            source,
            store,
            compressor,
            settings,
            staging,
            inspector,
        }
    }

    /// Runs every archive through the pipeline and writes the URL table.
    ///
    /// The table is rewritten after each archive with the URLs confirmed so
    /// far, and once more after the pool drained. A fatal error still drains
    /// the pool and writes the table before it is returned.
    pub fn run(
        &self,
        mut enricher: MetadataEnricher,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, HoardError> {
        let started = Instant::now();
        let settings = &self.settings;

        sink.event(ProgressEvent {
            message: "reading existing objects".to_string(),
            elapsed: None,
        });
        let index = RemoteIndex::snapshot(
            self.store.as_ref(),
            &settings.bucket,
            &settings.layout.list_prefix(),
        )?;
        let pool = UploadWorkerPool::start(Arc::clone(&self.store), settings.workers, settings.retry)?;

        let mut state = RunState {
            summary: RunSummary {
                existing_objects: index.len(),
                archives_total: settings.enumerator.count,
                ..RunSummary::default()
            },
            scheduled: HashSet::new(),
            staged: HashMap::new(),
        };

        let mut fatal = None;
        for (position, id) in settings.enumerator.identifiers().enumerate() {
            sink.event(ProgressEvent {
                message: format!("[{}/{}] {}", position + 1, settings.enumerator.count, id.stem()),
                elapsed: Some(started.elapsed()),
            });

            match self.process_archive(&id, &index, &pool, &mut enricher, &mut state, sink) {
                Ok(()) => {}
                Err(err) if err.is_recoverable() => {
                    state.summary.archives_skipped += 1;
                    state.summary.record_failure(id.as_str(), &err);
                }
                Err(err) => {
                    fatal = Some(err);
                    break;
                }
            }

            let outcomes = pool.take_outcomes();
            state.settle(&outcomes, &mut enricher);
            state.summary.records_written = enricher.write_snapshot(&settings.output_file)?;
        }

        if pool.outstanding() > 0 {
            sink.event(ProgressEvent {
                message: format!("waiting for {} uploads", pool.outstanding()),
                elapsed: Some(started.elapsed()),
            });
        }
        let outcomes = pool.shutdown();
        state.settle(&outcomes, &mut enricher);
        state.summary.records_written = enricher.write_snapshot(&settings.output_file)?;
        state.summary.elapsed_ms = started.elapsed().as_millis() as u64;

        if let Some(err) = fatal {
            return Err(err);
        }

        tracing::info!(
            uploaded = state.summary.uploads_succeeded,
            failed = state.summary.uploads_failed,
            records = state.summary.records_written,
            "run finished"
        );
        Ok(state.summary)
    }

    fn process_archive(
        &self,
        id: &ArchiveIdentifier,
        index: &RemoteIndex,
        pool: &UploadWorkerPool,
        enricher: &mut MetadataEnricher,
        state: &mut RunState,
        sink: &dyn ProgressSink,
    ) -> Result<(), HoardError> {
        let settings = &self.settings;
        let fetcher = ArchiveFetcher::new(&self.source, &self.staging, settings.min_archive_bytes);
        let fetched = fetcher.fetch(id)?;
        match fetched.action {
            FetchAction::Downloaded => state.summary.archives_downloaded += 1,
            FetchAction::Cached => state.summary.archives_cached += 1,
        }

        let inspection = self.inspector.inspect(&fetched.path, index)?;
        for present in &inspection.present {
            enricher.record_present(&present.member.sample_id, &present.url);
        }
        state.summary.members_present += inspection.present.len();

        if inspection.is_complete() {
            tracing::info!(archive = %id, "all members stored, removing local archive");
            Staging::remove_file(&fetched.path)?;
            state.summary.archives_complete += 1;
            return Ok(());
        }

        sink.event(ProgressEvent {
            message: format!(
                "{} missing of {}",
                inspection.missing.len(),
                inspection.missing.len() + inspection.present.len()
            ),
            elapsed: None,
        });
        let extracted = self
            .inspector
            .extract(&fetched.path, &inspection.missing, self.staging.extract_root())?;

        for item in extracted {
            let key = item.member.storage_key()?;
            let object_key = settings.layout.object_key(&key);
            if !state.scheduled.insert(object_key.clone()) {
                tracing::debug!(key = %object_key, "already queued in this run");
                state.summary.members_deduplicated += 1;
                Staging::remove_file(&item.path)?;
                continue;
            }

            let compressed = match self.compressor.compress(&item.path) {
                Ok(compressed) => compressed,
                Err(err) if err.is_recoverable() => {
                    state.scheduled.remove(&object_key);
                    state.summary.record_failure(&item.member.name, &err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            Staging::remove_file(&item.path)?;

            enricher.schedule(&object_key, &item.member.sample_id, &settings.layout.url(&key));
            state.staged.insert(object_key.clone(), compressed.path.clone());
            pool.submit(UploadJob {
                local_path: compressed.path,
                bucket: settings.bucket.clone(),
                prefix: settings.layout.object_dir(&key),
            })?;
            state.summary.members_scheduled += 1;
            sink.event(ProgressEvent {
                message: format!("queued {object_key}"),
                elapsed: None,
            });
        }
        Ok(())
    }
}
