//! Thread-safe collection of task outcomes.
//!
//! Every task invocation produces exactly one [`OutcomeRecord`]. Virtual users submit
//! records through a cloneable [`RecorderHandle`], which pushes them into an unbounded
//! [`flume`] channel and therefore never blocks the submitting user. The [`Recorder`]
//! drains the channel into its storage only while holding the storage lock, so a
//! [`Recorder::summarize`] always works from a consistent snapshot: a record is either
//! in the snapshot or still queued for the next one, never counted twice or lost.

use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};

use crate::metrics::RunSummary;
use crate::GanderError;

/// The result of a single task invocation. Never modified once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Wall clock time the invocation started.
    pub timestamp: DateTime<Utc>,
    /// How long after the start of the load test the invocation started.
    pub elapsed: Duration,
    /// How long the invocation took.
    pub duration: Duration,
    /// Whether the task function returned `Ok`.
    pub success: bool,
    /// The task name, or a per-invocation override.
    pub label: String,
    /// The scenario the invoking virtual user belongs to.
    pub scenario: String,
    /// The index of the invoking virtual user within its scenario.
    pub user: usize,
    /// Which iteration this was.
    pub iteration: usize,
    /// Why the invocation failed, if it did.
    pub error: Option<String>,
}

/// A cheap, cloneable submission endpoint handed to every virtual user.
#[derive(Clone, Debug)]
pub struct RecorderHandle {
    sender: flume::Sender<OutcomeRecord>,
    logger: Option<flume::Sender<Option<OutcomeRecord>>>,
}
impl RecorderHandle {
    /// Submit one record. Never blocks.
    pub fn record(&self, record: OutcomeRecord) {
        if let Some(logger) = self.logger.as_ref() {
            if let Err(e) = logger.send(Some(record.clone())) {
                debug!("outcome logger has shut down: {}", e);
            }
        }
        if let Err(e) = self.sender.send(record) {
            // Only possible once the Recorder itself was dropped.
            warn!("dropping outcome, recorder has shut down: {}", e.into_inner().label);
        }
    }
}

/// Collects every [`OutcomeRecord`] submitted during a load test.
///
/// Storage grows without bound, one record per task invocation, for the lifetime of the
/// `Recorder`. Long running tests should enable the outcome log (`--outcome-log`) if they
/// need the individual records, and budget memory accordingly.
///
/// # Example
/// ```rust
/// use gander::recorder::{OutcomeRecord, Recorder};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), gander::GanderError> {
/// let recorder = Recorder::new(Duration::from_secs(10));
/// let handle = recorder.handle();
/// handle.record(OutcomeRecord {
///     timestamp: chrono::Utc::now(),
///     elapsed: Duration::ZERO,
///     duration: Duration::from_millis(12),
///     success: true,
///     label: "list todos".to_string(),
///     scenario: "studier".to_string(),
///     user: 0,
///     iteration: 0,
///     error: None,
/// });
/// let summary = recorder.summarize().await?;
/// assert_eq!(summary.total_invocations(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Recorder {
    sender: flume::Sender<OutcomeRecord>,
    receiver: flume::Receiver<OutcomeRecord>,
    records: Arc<Mutex<Vec<OutcomeRecord>>>,
    lock_timeout: Duration,
    logger: Option<flume::Sender<Option<OutcomeRecord>>>,
    started: Instant,
    started_at: DateTime<Utc>,
}
impl Recorder {
    /// Create a recorder. `lock_timeout` bounds how long [`Recorder::flush`] and
    /// [`Recorder::summarize`] wait for the storage lock.
    pub fn new(lock_timeout: Duration) -> Self {
        let (sender, receiver) = flume::unbounded();
        Recorder {
            sender,
            receiver,
            records: Arc::new(Mutex::new(Vec::new())),
            lock_timeout,
            logger: None,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Also stream every record to the outcome logger. Only affects handles created
    /// afterwards.
    pub(crate) fn set_logger(&mut self, logger: flume::Sender<Option<OutcomeRecord>>) {
        self.logger = Some(logger);
    }

    /// A submission endpoint for virtual users.
    pub fn handle(&self) -> RecorderHandle {
        RecorderHandle {
            sender: self.sender.clone(),
            logger: self.logger.clone(),
        }
    }

    /// Submit one record. Never blocks.
    pub fn record(&self, record: OutcomeRecord) {
        self.handle().record(record);
    }

    /// Move all pending submissions into storage, returning how many records are stored.
    pub async fn flush(&self) -> Result<usize, GanderError> {
        let mut records = self.lock().await?;
        self.drain_into(&mut records);
        Ok(records.len())
    }

    /// A copy of every stored record, after moving pending submissions into storage.
    pub async fn records(&self) -> Result<Vec<OutcomeRecord>, GanderError> {
        let mut records = self.lock().await?;
        self.drain_into(&mut records);
        Ok(records.clone())
    }

    /// Build a [`RunSummary`] from a consistent snapshot of all records submitted so far.
    ///
    /// Records submitted while the summary is computed are counted by the next call.
    pub async fn summarize(&self) -> Result<RunSummary, GanderError> {
        let mut records = self.lock().await?;
        self.drain_into(&mut records);
        debug!("summarizing {} outcomes", records.len());
        Ok(RunSummary::from_records(
            &records,
            self.started_at,
            self.started.elapsed(),
        ))
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Vec<OutcomeRecord>>, GanderError> {
        match tokio::time::timeout(self.lock_timeout, self.records.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                error!(
                    "failed to lock outcome storage within {:?}",
                    self.lock_timeout
                );
                Err(GanderError::RecorderContention {
                    waited: self.lock_timeout,
                })
            }
        }
    }

    fn drain_into(&self, records: &mut Vec<OutcomeRecord>) {
        records.extend(self.receiver.try_iter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(user: usize, iteration: usize, success: bool) -> OutcomeRecord {
        OutcomeRecord {
            timestamp: Utc::now(),
            elapsed: Duration::ZERO,
            duration: Duration::from_millis((iteration % 7) as u64),
            success,
            label: "test".to_string(),
            scenario: "recorder".to_string(),
            user,
            iteration,
            error: if success {
                None
            } else {
                Some("task failed (forced)".to_string())
            },
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_are_all_counted() {
        const USERS: usize = 16;
        const RECORDS: usize = 250;

        let recorder = Recorder::new(Duration::from_secs(10));
        let mut users = Vec::new();
        for user in 0..USERS {
            let handle = recorder.handle();
            users.push(tokio::spawn(async move {
                for iteration in 0..RECORDS {
                    handle.record(outcome(user, iteration, iteration % 5 != 0));
                    if iteration % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for user in users {
            user.await.unwrap();
        }

        let summary = recorder.summarize().await.unwrap();
        assert_eq!(summary.total_invocations(), USERS * RECORDS);
        assert_eq!(summary.failure_count(), USERS * RECORDS / 5);
        assert_eq!(
            summary.success_count() + summary.failure_count(),
            USERS * RECORDS
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn summaries_racing_submissions_never_lose_records() {
        const USERS: usize = 8;
        const RECORDS: usize = 500;

        let recorder = Arc::new(Recorder::new(Duration::from_secs(10)));
        let mut users = Vec::new();
        for user in 0..USERS {
            let handle = recorder.handle();
            users.push(tokio::spawn(async move {
                for iteration in 0..RECORDS {
                    handle.record(outcome(user, iteration, true));
                    tokio::task::yield_now().await;
                }
            }));
        }

        // Summaries taken mid-run only ever grow.
        let mut previous = 0;
        while users.iter().any(|user| !user.is_finished()) {
            let total = recorder.summarize().await.unwrap().total_invocations();
            assert!(total >= previous);
            assert!(total <= USERS * RECORDS);
            previous = total;
            tokio::task::yield_now().await;
        }
        for user in users {
            user.await.unwrap();
        }

        assert_eq!(
            recorder.summarize().await.unwrap().total_invocations(),
            USERS * RECORDS
        );
        // Summarizing again doesn't count anything twice.
        assert_eq!(recorder.flush().await.unwrap(), USERS * RECORDS);
    }

    #[tokio::test]
    async fn records_are_kept_in_submission_order_per_user() {
        let recorder = Recorder::new(Duration::from_secs(1));
        let handle = recorder.handle();
        for iteration in 0..10 {
            handle.record(outcome(0, iteration, true));
        }
        let records = recorder.records().await.unwrap();
        let iterations: Vec<usize> = records.iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, (0..10).collect::<Vec<usize>>());
    }

    #[tokio::test]
    async fn contention_times_out() {
        let recorder = Recorder::new(Duration::from_millis(50));
        let _guard = recorder.records.lock().await;
        match recorder.summarize().await {
            Err(GanderError::RecorderContention { waited }) => {
                assert_eq!(waited, Duration::from_millis(50))
            }
            other => panic!("expected recorder contention, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn records_stream_to_logger() {
        let mut recorder = Recorder::new(Duration::from_secs(1));
        let (logger, logged) = flume::unbounded();
        recorder.set_logger(logger);
        recorder.handle().record(outcome(2, 3, false));
        let streamed = logged.try_recv().unwrap().unwrap();
        assert_eq!(streamed.user, 2);
        assert_eq!(streamed.iteration, 3);
        assert_eq!(recorder.flush().await.unwrap(), 1);
    }
}
