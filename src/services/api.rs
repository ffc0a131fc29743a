use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Deserializer};

use crate::models::job::{BatchCounts, Job, JobKind, JobStatus, JobUpdate};
use crate::models::outcome::ItemOutcome;
use crate::models::submission::{BatchSubmission, SingleAnalysisRequest};

/// Acknowledgement returned by the service when a job is created.
#[derive(Debug, Clone)]
pub struct SubmitAck {
    pub job_id: String,
    pub total_items: u32,
}

/// Operations the tracker consumes from the remote analysis service.
///
/// The trait is the seam between lifecycle logic and the wire: everything
/// behind it speaks the service's vocabulary, everything in front of it only
/// ever sees canonical [`Job`] shapes.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn submit_single(&self, request: &SingleAnalysisRequest) -> Result<SubmitAck, ApiError>;
    async fn submit_batch(&self, submission: &BatchSubmission) -> Result<SubmitAck, ApiError>;
    async fn job_status(&self, kind: JobKind, id: &str) -> Result<JobUpdate, ApiError>;
    async fn job_results(&self, kind: JobKind, id: &str) -> Result<Vec<ItemOutcome>, ApiError>;
    async fn cancel(&self, kind: JobKind, id: &str) -> Result<(), ApiError>;
    async fn delete(&self, kind: JobKind, id: &str) -> Result<(), ApiError>;
    /// Jobs currently visible to `owner_id`, used for startup reconciliation.
    async fn list_jobs(&self, owner_id: &str) -> Result<Vec<Job>, ApiError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("job not found")]
    NotFound,

    #[error("service rejected the request ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("unexpected response shape: {0}")]
    Decode(String),
}

/// HTTP client for the dealer analysis REST API.
pub struct HttpAnalysisClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpAnalysisClient {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
            api_token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

/// Error body shape used by the service for rejections.
#[derive(Deserialize)]
struct ErrorReply {
    #[serde(default)]
    detail: Option<String>,
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound);
    }
    let detail = response
        .json::<ErrorReply>()
        .await
        .ok()
        .and_then(|e| e.detail)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    Err(ApiError::Rejected {
        status: status.as_u16(),
        detail,
    })
}

/// The service is inconsistent about identifier types (strings in some
/// deployments, numbers in others); fold both into strings here.
fn de_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

/// Timestamps arrive as RFC 3339 when they arrive at all; anything else is
/// treated as absent rather than failing the whole listing.
fn de_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

fn parse_status(raw: Option<&str>) -> Option<JobStatus> {
    let raw = raw?;
    match JobStatus::from_str(raw) {
        Ok(status) => Some(status),
        Err(_) => {
            tracing::warn!(status = raw, "unrecognized job status from service");
            None
        }
    }
}

#[derive(Deserialize)]
struct SingleSubmitReply {
    #[serde(default, alias = "taskId", deserialize_with = "de_id")]
    task_id: Option<String>,
}

#[derive(Deserialize)]
struct BatchSubmitReply {
    #[serde(default, alias = "batchId", deserialize_with = "de_id")]
    batch_id: Option<String>,
    #[serde(default, alias = "totalItems")]
    total_urls: u32,
}

/// One status poll as the service reports it. Field names are normalized
/// here and nowhere else.
#[derive(Debug, Default, Deserialize)]
struct StatusReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "totalItems")]
    total_urls: Option<u32>,
    #[serde(default, alias = "processed")]
    processed_urls: Option<u32>,
    #[serde(default)]
    failed_urls: Option<u32>,
    #[serde(default)]
    progress_percentage: Option<f32>,
    #[serde(default, alias = "currentUrl")]
    current_url: Option<String>,
}

impl StatusReply {
    fn into_update(self) -> JobUpdate {
        JobUpdate {
            status: parse_status(self.status.as_deref()),
            total: self.total_urls,
            processed: self.processed_urls,
            failed: self.failed_urls,
            percent: self.progress_percentage,
            current_item: self.current_url,
        }
    }
}

/// A batch entry from the listing endpoint.
#[derive(Debug, Deserialize)]
struct ListedBatch {
    #[serde(default, alias = "batchId", deserialize_with = "de_id")]
    batch_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "original_filename")]
    filename: Option<String>,
    #[serde(default, alias = "createdAt", deserialize_with = "de_timestamp")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "totalItems")]
    total_urls: Option<u32>,
    #[serde(default, alias = "processed")]
    processed_urls: Option<u32>,
    #[serde(default)]
    failed_urls: Option<u32>,
    #[serde(default)]
    progress_percentage: Option<f32>,
    #[serde(default, alias = "dealerId", deserialize_with = "de_id")]
    dealer_id: Option<String>,
    #[serde(default)]
    target_language: Option<String>,
}

impl ListedBatch {
    fn into_job(self, fallback_owner: &str) -> Option<Job> {
        let id = self.batch_id?;
        let mut counts = BatchCounts::default();
        counts.absorb(self.total_urls, self.processed_urls, self.failed_urls);
        Some(Job {
            id,
            kind: JobKind::Batch,
            status: parse_status(self.status.as_deref()).unwrap_or(JobStatus::Pending),
            created_at: self.created_at.unwrap_or_else(Utc::now),
            counts,
            reported_percent: self.progress_percentage,
            current_item: None,
            source_file: self.filename,
            owner_id: self.dealer_id.unwrap_or_else(|| fallback_owner.to_string()),
            target_language: self.target_language,
            results: Vec::new(),
        })
    }
}

/// A single-analysis entry from the listing endpoint.
#[derive(Debug, Deserialize)]
struct ListedTask {
    #[serde(default, alias = "taskId", deserialize_with = "de_id")]
    task_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "createdAt", deserialize_with = "de_timestamp")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "dealerId", deserialize_with = "de_id")]
    dealer_id: Option<String>,
    #[serde(default)]
    target_language: Option<String>,
}

impl ListedTask {
    fn into_job(self, fallback_owner: &str) -> Option<Job> {
        let id = self.task_id?;
        Some(Job {
            id,
            kind: JobKind::Single,
            status: parse_status(self.status.as_deref()).unwrap_or(JobStatus::Pending),
            created_at: self.created_at.unwrap_or_else(Utc::now),
            counts: BatchCounts::default(),
            reported_percent: None,
            current_item: None,
            source_file: None,
            owner_id: self.dealer_id.unwrap_or_else(|| fallback_owner.to_string()),
            target_language: self.target_language,
            results: Vec::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ResultsReply {
    #[serde(default)]
    results: Vec<ResultRow>,
}

#[derive(Debug, Deserialize)]
struct ResultRow {
    #[serde(default, alias = "citnow_url", alias = "url")]
    video_url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    transcription: Option<TranscriptionBlock>,
    #[serde(default)]
    summarization: Option<SummaryBlock>,
    #[serde(default)]
    translation: Option<TranslationBlock>,
    #[serde(default)]
    video_analysis: Option<VideoBlock>,
    #[serde(default)]
    audio_analysis: Option<AudioBlock>,
    #[serde(default)]
    overall_quality: Option<OverallBlock>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryBlock {
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranslationBlock {
    #[serde(default)]
    translated_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoBlock {
    #[serde(default)]
    quality_score: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct AudioBlock {
    #[serde(default)]
    score: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OverallBlock {
    #[serde(default)]
    overall_score: Option<f32>,
}

impl ResultRow {
    fn into_outcome(self) -> ItemOutcome {
        let succeeded =
            self.error.is_none() && self.status.as_deref().map_or(true, |s| s != "failed");
        ItemOutcome {
            video_url: self.video_url.unwrap_or_default(),
            succeeded,
            transcript: self.transcription.and_then(|b| b.text),
            summary: self.summarization.and_then(|b| b.summary),
            translation: self.translation.and_then(|b| b.translated_text),
            video_score: self.video_analysis.and_then(|b| b.quality_score),
            audio_score: self.audio_analysis.and_then(|b| b.score),
            overall_score: self.overall_quality.and_then(|b| b.overall_score),
            error: self.error,
        }
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisClient {
    async fn submit_single(&self, request: &SingleAnalysisRequest) -> Result<SubmitAck, ApiError> {
        let body = serde_json::json!({
            "citnow_url": request.video_url,
            "transcription_language": request.transcription_language,
            "target_language": request.target_language,
        });

        let response = self
            .request(Method::POST, "/analyze")
            .json(&body)
            .send()
            .await?;
        let reply: SingleSubmitReply = check(response).await?.json().await?;

        let job_id = reply
            .task_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::Decode("submit response carried no task id".into()))?;
        Ok(SubmitAck {
            job_id,
            total_items: 1,
        })
    }

    async fn submit_batch(&self, submission: &BatchSubmission) -> Result<SubmitAck, ApiError> {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(submission.payload.clone())
                    .file_name(submission.file_name.clone()),
            )
            .text("target_language", submission.target_language.clone());

        let response = self
            .request(Method::POST, "/bulk-analyze")
            .multipart(form)
            .send()
            .await?;
        let reply: BatchSubmitReply = check(response).await?.json().await?;

        let job_id = reply
            .batch_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::Decode("submit response carried no batch id".into()))?;
        Ok(SubmitAck {
            job_id,
            total_items: reply.total_urls,
        })
    }

    async fn job_status(&self, kind: JobKind, id: &str) -> Result<JobUpdate, ApiError> {
        let path = match kind {
            JobKind::Single => format!("/analyze-status/{id}"),
            JobKind::Batch => format!("/bulk-status/{id}"),
        };
        let response = self.request(Method::GET, &path).send().await?;
        let reply: StatusReply = check(response).await?.json().await?;
        Ok(reply.into_update())
    }

    async fn job_results(&self, kind: JobKind, id: &str) -> Result<Vec<ItemOutcome>, ApiError> {
        let path = match kind {
            JobKind::Single => format!("/analyze-results/{id}"),
            JobKind::Batch => format!("/bulk-results/{id}"),
        };
        let response = self.request(Method::GET, &path).send().await?;
        let reply: ResultsReply = check(response).await?.json().await?;
        Ok(reply.results.into_iter().map(ResultRow::into_outcome).collect())
    }

    async fn cancel(&self, kind: JobKind, id: &str) -> Result<(), ApiError> {
        let path = match kind {
            JobKind::Single => format!("/analyze-cancel/{id}"),
            JobKind::Batch => format!("/bulk-cancel/{id}"),
        };
        let response = self.request(Method::POST, &path).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn delete(&self, kind: JobKind, id: &str) -> Result<(), ApiError> {
        let path = match kind {
            JobKind::Single => format!("/analyze-task/{id}"),
            JobKind::Batch => format!("/bulk-job/{id}"),
        };
        let response = self.request(Method::DELETE, &path).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn list_jobs(&self, owner_id: &str) -> Result<Vec<Job>, ApiError> {
        let response = self.request(Method::GET, "/bulk-batches").send().await?;
        let batches: Vec<ListedBatch> = check(response).await?.json().await?;

        let mut jobs: Vec<Job> = batches
            .into_iter()
            .filter_map(|b| b.into_job(owner_id))
            .collect();

        // Single-analysis history lives behind a separate endpoint; its
        // absence degrades the listing rather than failing reconciliation.
        match self
            .request(Method::GET, "/dealer/my-analysis-tasks")
            .send()
            .await
        {
            Ok(response) => match check(response).await {
                Ok(ok) => {
                    let tasks: Vec<ListedTask> = ok.json().await?;
                    jobs.extend(tasks.into_iter().filter_map(|t| t.into_job(owner_id)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "single-analysis listing unavailable");
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "single-analysis listing unavailable");
            }
        }

        jobs.retain(|job| job.owner_id == owner_id);
        Ok(jobs)
    }
}
