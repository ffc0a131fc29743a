use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::outcome::ItemOutcome;

/// Status of an analysis job as tracked on the client.
///
/// The lifecycle is forward-only: `pending → processing → {completed,
/// failed}`, with `stopping` interposed when the user requests cancellation.
/// `completed`, `failed` and `cancelled` are absorbing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Position in the forward-only lifecycle ordering.
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Stopping => 2,
            Self::Completed | Self::Failed | Self::Cancelled => 3,
        }
    }

    /// Whether a merge from `self` to `next` is acceptable. Equal statuses
    /// are a no-op; anything that would move backwards is not.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Whether a job tracks one video URL or a spreadsheet of them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    Single,
    Batch,
}

/// Aggregate progress counters for a batch job.
///
/// Counters never decrease while the job is live, and
/// `processed + failed <= total` holds at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: u32,
    pub processed: u32,
    pub failed: u32,
}

impl BatchCounts {
    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.processed + self.failed)
    }

    /// Fold server-reported counters in, keeping them monotone and clamping
    /// anything that would overrun `total`. Returns (changed, clamped).
    pub(crate) fn absorb(
        &mut self,
        total: Option<u32>,
        processed: Option<u32>,
        failed: Option<u32>,
    ) -> (bool, bool) {
        let before = *self;
        if let Some(t) = total {
            self.total = self.total.max(t);
        }
        if let Some(p) = processed {
            self.processed = self.processed.max(p);
        }
        if let Some(f) = failed {
            self.failed = self.failed.max(f);
        }
        let mut clamped = false;
        if self.total > 0 && self.processed + self.failed > self.total {
            clamped = true;
            self.failed = self.failed.min(self.total);
            self.processed = self.total - self.failed;
        }
        (*self != before, clamped)
    }
}

/// Canonical merge payload produced by the service adapter from one status
/// response.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub total: Option<u32>,
    pub processed: Option<u32>,
    pub failed: Option<u32>,
    pub percent: Option<f32>,
    pub current_item: Option<String>,
}

/// What changed when a status response was merged onto a job.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeReport {
    pub changed: bool,
    /// A status the server reported that would have moved the job backwards.
    pub discarded_status: Option<JobStatus>,
    pub counts_clamped: bool,
}

/// A tracked analysis job (single video or spreadsheet batch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque identifier assigned by the service at creation. Never changes.
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub counts: BatchCounts,
    /// Server-supplied percentage, kept for jobs that report no counts.
    #[serde(default)]
    pub reported_percent: Option<f32>,
    /// URL currently being processed. Present only while `Processing`.
    #[serde(default)]
    pub current_item: Option<String>,
    /// Display name of the uploaded spreadsheet (batch jobs only).
    #[serde(default)]
    pub source_file: Option<String>,
    pub owner_id: String,
    #[serde(default)]
    pub target_language: Option<String>,
    /// Per-item outcomes, populated only after terminal success.
    #[serde(default)]
    pub results: Vec<ItemOutcome>,
}

impl Job {
    pub fn new_single(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        target_language: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: JobKind::Single,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            counts: BatchCounts::default(),
            reported_percent: None,
            current_item: None,
            source_file: None,
            owner_id: owner_id.into(),
            target_language,
            results: Vec::new(),
        }
    }

    pub fn new_batch(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        source_file: impl Into<String>,
        total: u32,
        target_language: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: JobKind::Batch,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            counts: BatchCounts {
                total,
                processed: 0,
                failed: 0,
            },
            reported_percent: None,
            current_item: None,
            source_file: Some(source_file.into()),
            owner_id: owner_id.into(),
            target_language,
            results: Vec::new(),
        }
    }

    /// Merge one status response onto this job. Status regressions are
    /// discarded, counters stay monotone and within bounds, and the current
    /// item survives only while the job is processing.
    pub fn apply_update(&mut self, update: &JobUpdate) -> MergeReport {
        let mut report = MergeReport::default();

        if let Some(next) = update.status {
            if self.status.can_advance_to(next) {
                if self.status != next {
                    self.status = next;
                    report.changed = true;
                }
            } else {
                report.discarded_status = Some(next);
            }
        }

        let (counts_changed, clamped) =
            self.counts
                .absorb(update.total, update.processed, update.failed);
        report.changed |= counts_changed;
        report.counts_clamped = clamped;

        if let Some(pct) = update.percent {
            if self.reported_percent != Some(pct) {
                self.reported_percent = Some(pct);
                report.changed = true;
            }
        }

        if self.status == JobStatus::Processing {
            if update.current_item.is_some() && self.current_item != update.current_item {
                self.current_item = update.current_item.clone();
                report.changed = true;
            }
        } else if self.current_item.take().is_some() {
            report.changed = true;
        }

        report
    }

    /// Completion percentage, derived from counts when the service reports
    /// them and falling back to the server-supplied figure otherwise.
    pub fn progress_percent(&self) -> f32 {
        if self.counts.total > 0 {
            (self.counts.processed + self.counts.failed) as f32 * 100.0
                / self.counts.total as f32
        } else if let Some(pct) = self.reported_percent {
            pct
        } else if self.status.is_terminal() {
            100.0
        } else {
            0.0
        }
    }
}
