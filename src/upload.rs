use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::Utf8PathBuf;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

use crate::error::HoardError;
use crate::object_store::ObjectStore;

pub const DEFAULT_WORKERS: usize = 10;

/// One file to put at `{prefix}/{file name}`.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub local_path: Utf8PathBuf,
    pub bucket: String,
    pub prefix: String,
}

impl UploadJob {
    pub fn key(&self) -> String {
        let name = self.local_path.file_name().unwrap_or(self.local_path.as_str());
        format!("{}/{name}", self.prefix.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UploadOutcome {
    Uploaded {
        key: String,
        attempts: u32,
    },
    Failed {
        key: String,
        local_path: String,
        attempts: u32,
        error: String,
    },
}

impl UploadOutcome {
    pub fn key(&self) -> &str {
        match self {
            UploadOutcome::Uploaded { key, .. } | UploadOutcome::Failed { key, .. } => key,
        }
    }

    pub fn is_uploaded(&self) -> bool {
        matches!(self, UploadOutcome::Uploaded { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Default)]
struct Ledger {
    outstanding: usize,
    outcomes: Vec<UploadOutcome>,
}

#[derive(Default)]
struct Shared {
    ledger: Mutex<Ledger>,
    settled: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: UploadOutcome) {
        let mut ledger = self.lock();
        ledger.outcomes.push(outcome);
        ledger.outstanding = ledger.outstanding.saturating_sub(1);
        if ledger.outstanding == 0 {
            self.settled.notify_all();
        }
    }
}

/// Fixed set of upload threads fed from one unbounded FIFO queue.
///
/// Every submitted job settles exactly once, as either
/// [`UploadOutcome::Uploaded`] (after the put returned success) or
/// [`UploadOutcome::Failed`] (retries exhausted, or the put panicked).
/// Outcomes accumulate until collected with [`take_outcomes`](Self::take_outcomes)
/// or [`drain`](Self::drain).
pub struct UploadWorkerPool {
    sender: Option<Sender<UploadJob>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl UploadWorkerPool {
    /// Spawns `workers` threads sharing one `store` client.
    pub fn start<O: ObjectStore + ?Sized + 'static>(
        store: Arc<O>,
        workers: usize,
        retry: RetryPolicy,
    ) -> Result<Self, HoardError> {
        let (sender, receiver) = crossbeam_channel::unbounded::<UploadJob>();
        let shared = Arc::new(Shared::default());

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let store = Arc::clone(&store);
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("hoard-upload-{index}"))
                .spawn(move || worker_loop(receiver, store.as_ref(), shared.as_ref(), retry))
                .map_err(|err| HoardError::Filesystem(format!("spawn upload worker: {err}")))?;
            tracing::debug!(worker = index, "upload worker started");
            handles.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers: handles,
            shared,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn submit(&self, job: UploadJob) -> Result<(), HoardError> {
        let sender = self.sender.as_ref().ok_or(HoardError::PoolClosed)?;
        self.shared.lock().outstanding += 1;
        if sender.send(job).is_err() {
            self.shared.lock().outstanding -= 1;
            return Err(HoardError::PoolClosed);
        }
        Ok(())
    }

    /// Jobs submitted and not yet settled.
    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding
    }

    pub fn take_outcomes(&self) -> Vec<UploadOutcome> {
        std::mem::take(&mut self.shared.lock().outcomes)
    }

    /// Blocks until every submitted job has settled, then hands back the
    /// outcomes not collected yet. The queue is empty when this returns.
    pub fn drain(&self) -> Vec<UploadOutcome> {
        let mut ledger = self.shared.lock();
        while ledger.outstanding > 0 {
            ledger = self
                .shared
                .settled
                .wait(ledger)
                .unwrap_or_else(PoisonError::into_inner);
        }
        std::mem::take(&mut ledger.outcomes)
    }

    /// Drains, closes the queue and joins the workers.
    pub fn shutdown(mut self) -> Vec<UploadOutcome> {
        let outcomes = self.drain();
        self.close();
        outcomes
    }

    fn close(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("upload worker exited abnormally");
            }
        }
    }
}

impl Drop for UploadWorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop<O: ObjectStore + ?Sized>(
    receiver: Receiver<UploadJob>,
    store: &O,
    shared: &Shared,
    retry: RetryPolicy,
) {
    for job in receiver.iter() {
        let key = job.key();
        let result = panic::catch_unwind(AssertUnwindSafe(|| put_with_retry(store, &job, &key, retry)));
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => UploadOutcome::Failed {
                key,
                local_path: job.local_path.to_string(),
                attempts: 0,
                error: "upload worker panicked".to_string(),
            },
        };
        shared.settle(outcome);
    }
}

fn put_with_retry<O: ObjectStore + ?Sized>(
    store: &O,
    job: &UploadJob,
    key: &str,
    retry: RetryPolicy,
) -> UploadOutcome {
    let attempts = retry.attempts.max(1);
    let mut attempt = 1;
    loop {
        match store.put(&job.bucket, key, job.local_path.as_std_path()) {
            Ok(()) => {
                tracing::info!(key, "uploaded");
                return UploadOutcome::Uploaded {
                    key: key.to_string(),
                    attempts: attempt,
                };
            }
            Err(err) if attempt < attempts => {
                let delay = retry.base_delay * 2u32.saturating_pow(attempt - 1);
                tracing::warn!(key, attempt, error = %err, "upload failed, retrying in {delay:.1?}");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => {
                tracing::warn!(key, attempt, error = %err, "upload failed, giving up");
                return UploadOutcome::Failed {
                    key: key.to_string(),
                    local_path: job.local_path.to_string(),
                    attempts: attempt,
                    error: err.to_string(),
                };
            }
        }
    }
}
