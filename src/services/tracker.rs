use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use garde::Validate;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::models::job::{Job, JobKind, JobStatus, JobUpdate, MergeReport};
use crate::models::outcome::ItemOutcome;
use crate::models::submission::{BatchSubmission, SingleAnalysisRequest};
use crate::services::api::{AnalysisBackend, ApiError};
use crate::services::store::{JobStore, StoreError};

/// Poll cadence for spreadsheet batches.
pub const BATCH_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Poll cadence for single-video jobs.
pub const SINGLE_POLL_INTERVAL: Duration = Duration::from_secs(3);

const EVENT_CAPACITY: usize = 256;

/// State-change notifications delivered to observers.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Updated(Job),
    Removed { id: String, reason: RemovalReason },
    ResultsReady(Job),
}

/// Why a job left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Removed by an explicit delete request.
    Deleted,
    /// The service reported the job no longer exists.
    VanishedUpstream,
}

/// Tracks the full life of analysis jobs: submission, status polling,
/// cancellation, deletion, result retrieval and restart reconciliation.
///
/// One polling task exists per tracked non-terminal job; all updates are
/// keyed by job id, and stale status responses are discarded via a per-job
/// response sequence. Observers subscribe to [`JobEvent`]s instead of owning
/// any timers themselves.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    backend: Arc<dyn AnalysisBackend>,
    store: JobStore,
    owner_id: String,
    batch_interval: Duration,
    single_interval: Duration,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    applied_seq: Mutex<HashMap<String, u64>>,
    poll_seq: AtomicU64,
    events: broadcast::Sender<JobEvent>,
}

impl Tracker {
    pub fn new(
        backend: Arc<dyn AnalysisBackend>,
        store: JobStore,
        owner_id: impl Into<String>,
    ) -> Self {
        Self::with_poll_intervals(
            backend,
            store,
            owner_id,
            BATCH_POLL_INTERVAL,
            SINGLE_POLL_INTERVAL,
        )
    }

    /// Like [`Tracker::new`] with explicit poll cadences. Tests shrink the
    /// intervals to keep wall-clock time down.
    pub fn with_poll_intervals(
        backend: Arc<dyn AnalysisBackend>,
        store: JobStore,
        owner_id: impl Into<String>,
        batch_interval: Duration,
        single_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(TrackerInner {
                backend,
                store,
                owner_id: owner_id.into(),
                batch_interval,
                single_interval,
                timers: Mutex::new(HashMap::new()),
                applied_seq: Mutex::new(HashMap::new()),
                poll_seq: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Submit one video URL for analysis. On success the returned job is
    /// already persisted and being polled.
    pub async fn submit_single(
        &self,
        request: SingleAnalysisRequest,
    ) -> Result<Job, SubmissionError> {
        request.validate()?;
        let ack = self
            .inner
            .backend
            .submit_single(&request)
            .await
            .map_err(SubmissionError::from_api)?;

        let job = Job::new_single(
            ack.job_id,
            &self.inner.owner_id,
            Some(request.target_language.clone()),
        );
        self.inner.track_new(job.clone()).await;
        metrics::counter!("analysis_jobs_submitted", "kind" => "single").increment(1);
        tracing::info!(job_id = %job.id, url = %request.video_url, "single analysis submitted");
        Ok(job)
    }

    /// Submit a spreadsheet of video URLs for bulk analysis.
    pub async fn submit_batch(
        &self,
        submission: BatchSubmission,
    ) -> Result<Job, SubmissionError> {
        submission.validate()?;
        let ack = self
            .inner
            .backend
            .submit_batch(&submission)
            .await
            .map_err(SubmissionError::from_api)?;

        let job = Job::new_batch(
            ack.job_id,
            &self.inner.owner_id,
            submission.file_name.clone(),
            ack.total_items,
            Some(submission.target_language.clone()),
        );
        self.inner.track_new(job.clone()).await;
        metrics::counter!("analysis_jobs_submitted", "kind" => "batch").increment(1);
        tracing::info!(
            job_id = %job.id,
            file = %submission.file_name,
            total = ack.total_items,
            "bulk analysis submitted"
        );
        Ok(job)
    }

    /// Request cancellation. On acceptance the job moves to `stopping`
    /// locally and polling stops; the true terminal state (`cancelled` vs
    /// `completed`, since cancellation can race completion) comes from one
    /// final status fetch.
    pub async fn cancel(&self, job_id: &str) -> Result<(), CancellationError> {
        let inner = &self.inner;
        let job = inner
            .store
            .get(job_id)
            .await
            .ok_or(CancellationError::UnknownJob)?;
        if job.status.is_terminal() {
            return Err(CancellationError::AlreadyTerminal(job.status));
        }

        inner
            .backend
            .cancel(job.kind, job_id)
            .await
            .map_err(|e| match e {
                ApiError::NotFound => CancellationError::UnknownJob,
                ApiError::Rejected { status, detail } => {
                    CancellationError::Rejected { status, detail }
                }
                other => CancellationError::Unreachable(other),
            })?;

        inner.stop_polling(job_id).await;
        let stopping = JobUpdate {
            status: Some(JobStatus::Stopping),
            ..JobUpdate::default()
        };
        if let Some(updated) = inner
            .store
            .update(job_id, |j| {
                j.apply_update(&stopping);
            })
            .await
        {
            inner.emit(JobEvent::Updated(updated));
        }
        tracing::info!(job_id = %job_id, "cancellation requested");

        let follow = Arc::clone(inner);
        let id = job_id.to_string();
        let kind = job.kind;
        tokio::spawn(async move { follow.finalize_cancel(id, kind).await });
        Ok(())
    }

    /// Delete a job server-side, then locally. The service is the authority
    /// on whether deletion is permitted; cached status is not re-checked.
    pub async fn delete(&self, job_id: &str) -> Result<(), DeletionError> {
        let inner = &self.inner;
        let job = inner
            .store
            .get(job_id)
            .await
            .ok_or(DeletionError::UnknownJob)?;

        match inner.backend.delete(job.kind, job_id).await {
            // A job the service no longer knows is as deleted as it gets.
            Ok(()) | Err(ApiError::NotFound) => {
                inner.evict(job_id, RemovalReason::Deleted).await;
                tracing::info!(job_id = %job_id, "job deleted");
                Ok(())
            }
            Err(ApiError::Rejected { status, detail }) => {
                Err(DeletionError::Rejected { status, detail })
            }
            Err(other) => Err(DeletionError::Unreachable(other)),
        }
    }

    /// Fetch final per-item outcomes. Callable only once the job has
    /// completed; earlier calls are rejected without touching the network.
    pub async fn fetch_results(
        &self,
        job_id: &str,
    ) -> Result<Vec<ItemOutcome>, ResultFetchError> {
        let inner = &self.inner;
        let job = inner
            .store
            .get(job_id)
            .await
            .ok_or(ResultFetchError::UnknownJob)?;
        if job.status != JobStatus::Completed {
            return Err(ResultFetchError::NotReady(job.status));
        }

        let outcomes = inner
            .backend
            .job_results(job.kind, job_id)
            .await
            .map_err(ResultFetchError::Unavailable)?;
        if let Some(updated) = inner
            .store
            .update(job_id, |j| j.results = outcomes.clone())
            .await
        {
            inner.emit(JobEvent::ResultsReady(updated));
        }
        Ok(outcomes)
    }

    /// Reconcile local state with the service and restart polling. Called
    /// once at application start.
    ///
    /// The server listing wins wholesale when reachable; otherwise the
    /// last-persisted cache is restored as a degraded fallback. Returns how
    /// many jobs resumed polling.
    pub async fn resume(&self) -> Result<usize, StoreError> {
        let inner = &self.inner;
        match inner.backend.list_jobs(&inner.owner_id).await {
            Ok(listed) => {
                let count = inner.store.replace_all(listed).await;
                tracing::info!(count, "reconciled job list from service");
            }
            Err(e) => {
                tracing::warn!(error = %e, "job list unavailable, falling back to cached jobs");
                let count = inner.store.hydrate().await?;
                tracing::info!(count, "restored jobs from local cache");
            }
        }

        inner.refresh_active_gauge().await;
        let mut resumed = 0;
        for job in inner.store.snapshot().await {
            inner.emit(JobEvent::Updated(job.clone()));
            if !job.status.is_terminal() {
                inner.ensure_polling(&job).await;
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Snapshot of all tracked jobs, newest first.
    pub async fn jobs(&self) -> Vec<Job> {
        self.inner.store.snapshot().await
    }

    pub async fn job(&self, id: &str) -> Option<Job> {
        self.inner.store.get(id).await
    }

    /// Whether a live polling task exists for `id`. Mostly useful to tests
    /// and diagnostics.
    pub async fn is_polling(&self, id: &str) -> bool {
        self.inner
            .timers
            .lock()
            .await
            .get(id)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }
}

impl TrackerInner {
    async fn track_new(self: &Arc<Self>, job: Job) {
        self.store.insert(job.clone()).await;
        self.refresh_active_gauge().await;
        self.emit(JobEvent::Updated(job.clone()));
        self.ensure_polling(&job).await;
    }

    /// Start a polling task for `job` unless a live one already exists.
    async fn ensure_polling(self: &Arc<Self>, job: &Job) {
        if job.status.is_terminal() {
            return;
        }
        let mut timers = self.timers.lock().await;
        if let Some(handle) = timers.get(&job.id) {
            if !handle.is_finished() {
                return;
            }
        }
        tracing::debug!(job_id = %job.id, kind = %job.kind, "starting status polling");
        let inner = Arc::clone(self);
        let id = job.id.clone();
        let kind = job.kind;
        let task = tokio::spawn(async move { inner.poll_loop(id, kind).await });
        timers.insert(job.id.clone(), task);
    }

    async fn poll_loop(self: Arc<Self>, id: String, kind: JobKind) {
        let period = match kind {
            JobKind::Batch => self.batch_interval,
            JobKind::Single => self.single_interval,
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The interval fires immediately; consume that so the first status
        // check happens one full period after submission.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.store.get(&id).await.is_none() {
                break;
            }
            let seq = self.poll_seq.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!("analysis_polls_total").increment(1);
            match self.backend.job_status(kind, &id).await {
                Ok(update) => {
                    let Some(job) = self.apply_status(&id, seq, update).await else {
                        break;
                    };
                    if job.status.is_terminal() {
                        if job.status == JobStatus::Completed {
                            self.try_fetch_results(&job).await;
                        }
                        break;
                    }
                }
                Err(ApiError::NotFound) => {
                    tracing::info!(job_id = %id, "job no longer exists upstream, pruning");
                    self.evict(&id, RemovalReason::VanishedUpstream).await;
                    return;
                }
                Err(e) => {
                    metrics::counter!("analysis_poll_failures").increment(1);
                    tracing::warn!(job_id = %id, error = %e, "status poll failed, will retry");
                }
            }
        }

        self.timers.lock().await.remove(&id);
        self.applied_seq.lock().await.remove(&id);
    }

    /// Merge one status response, guarding against out-of-order arrival.
    /// Returns the job as stored afterwards, or `None` if it is untracked.
    async fn apply_status(&self, id: &str, seq: u64, update: JobUpdate) -> Option<Job> {
        {
            let mut applied = self.applied_seq.lock().await;
            match applied.get(id) {
                Some(&latest) if latest > seq => {
                    tracing::debug!(job_id = %id, "discarding stale status response");
                    return self.store.get(id).await;
                }
                _ => {
                    applied.insert(id.to_string(), seq);
                }
            }
        }

        let prev = self.store.get(id).await?;
        let mut report = MergeReport::default();
        let updated = self
            .store
            .update(id, |job| {
                report = job.apply_update(&update);
            })
            .await?;

        if let Some(discarded) = report.discarded_status {
            tracing::warn!(
                job_id = %id,
                from = %prev.status,
                to = %discarded,
                "ignoring status regression from service"
            );
        }
        if report.counts_clamped {
            tracing::warn!(job_id = %id, "service counts exceeded total, clamped");
        }
        if report.changed {
            self.emit(JobEvent::Updated(updated.clone()));
        }

        if !prev.status.is_terminal() && updated.status.is_terminal() {
            match updated.status {
                JobStatus::Completed => {
                    metrics::counter!("analysis_jobs_completed").increment(1)
                }
                JobStatus::Failed => metrics::counter!("analysis_jobs_failed").increment(1),
                _ => {}
            }
            self.refresh_active_gauge().await;
            tracing::info!(
                job_id = %id,
                status = %updated.status,
                processed = updated.counts.processed,
                failed = updated.counts.failed,
                "job reached terminal state"
            );
        }
        Some(updated)
    }

    async fn try_fetch_results(&self, job: &Job) {
        match self.backend.job_results(job.kind, &job.id).await {
            Ok(outcomes) => {
                if let Some(updated) = self
                    .store
                    .update(&job.id, |j| j.results = outcomes.clone())
                    .await
                {
                    tracing::info!(
                        job_id = %job.id,
                        items = updated.results.len(),
                        "final results retrieved"
                    );
                    self.emit(JobEvent::ResultsReady(updated));
                }
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    error = %e,
                    "failed to fetch final results, caller may retry"
                );
            }
        }
    }

    /// One post-cancel status fetch to settle `stopping` into its real
    /// terminal state.
    async fn finalize_cancel(self: Arc<Self>, id: String, kind: JobKind) {
        let seq = self.poll_seq.fetch_add(1, Ordering::Relaxed) + 1;
        match self.backend.job_status(kind, &id).await {
            Ok(update) => {
                self.apply_status(&id, seq, update).await;
            }
            Err(ApiError::NotFound) => {
                self.evict(&id, RemovalReason::VanishedUpstream).await;
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "could not confirm state after cancel");
            }
        }
    }

    /// Drop a job from local state. The polling task is stopped last so a
    /// self-eviction from inside the poll loop still completes the rest.
    async fn evict(&self, id: &str, reason: RemovalReason) {
        if self.store.remove(id).await.is_some() {
            self.refresh_active_gauge().await;
            self.emit(JobEvent::Removed {
                id: id.to_string(),
                reason,
            });
        }
        self.applied_seq.lock().await.remove(id);
        self.stop_polling(id).await;
    }

    async fn stop_polling(&self, id: &str) {
        if let Some(handle) = self.timers.lock().await.remove(id) {
            handle.abort();
        }
    }

    async fn refresh_active_gauge(&self) {
        let active = self
            .store
            .snapshot()
            .await
            .iter()
            .filter(|job| !job.status.is_terminal())
            .count();
        metrics::gauge!("analysis_jobs_active").set(active as f64);
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("invalid submission: {0}")]
    Invalid(#[from] garde::Report),

    #[error("service rejected the submission ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("submission was accepted but no job id was returned")]
    MissingJobId,

    #[error("could not reach the analysis service: {0}")]
    Unreachable(#[source] ApiError),
}

impl SubmissionError {
    fn from_api(err: ApiError) -> Self {
        match err {
            ApiError::Rejected { status, detail } => Self::Rejected { status, detail },
            ApiError::NotFound => Self::Rejected {
                status: 404,
                detail: "submission endpoint not found".to_string(),
            },
            ApiError::Decode(_) => Self::MissingJobId,
            other => Self::Unreachable(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CancellationError {
    #[error("no such tracked job")]
    UnknownJob,

    #[error("job is already {0}")]
    AlreadyTerminal(JobStatus),

    #[error("service refused to cancel ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("could not reach the analysis service: {0}")]
    Unreachable(#[source] ApiError),
}

#[derive(Debug, thiserror::Error)]
pub enum DeletionError {
    #[error("no such tracked job")]
    UnknownJob,

    #[error("service refused to delete ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("could not reach the analysis service: {0}")]
    Unreachable(#[source] ApiError),
}

#[derive(Debug, thiserror::Error)]
pub enum ResultFetchError {
    #[error("no such tracked job")]
    UnknownJob,

    #[error("results are not available while the job is {0}")]
    NotReady(JobStatus),

    #[error("results could not be retrieved: {0}")]
    Unavailable(#[source] ApiError),
}
