//! Test helpers: an in-process, scriptable mock of the remote analysis
//! service, plus small wait utilities for driving the tracker against it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::time::sleep;
use uuid::Uuid;

use video_analysis_tracker::models::job::JobStatus;
use video_analysis_tracker::services::tracker::Tracker;

pub const OWNER: &str = "dealer-9";

/// One scripted job: status payloads are served in order, the last repeats.
pub struct MockJob {
    pub script: Vec<Value>,
    pub cursor: usize,
    pub results: Value,
}

impl MockJob {
    pub fn new(script: Vec<Value>) -> Self {
        Self {
            script,
            cursor: 0,
            results: json!({ "results": [] }),
        }
    }

    fn next_status(&mut self) -> Value {
        let index = self.cursor.min(self.script.len().saturating_sub(1));
        self.cursor += 1;
        self.script
            .get(index)
            .cloned()
            .unwrap_or_else(|| json!({ "status": "pending" }))
    }
}

#[derive(Default)]
pub struct MockState {
    pub batches: HashMap<String, MockJob>,
    pub tasks: HashMap<String, MockJob>,
    /// Reject every submission with 400 when set.
    pub reject_submissions: bool,
    /// Fail the listing endpoints with 500 when set.
    pub listing_down: bool,
    /// Refuse cancel requests with 409 when set.
    pub cancel_rejects: bool,
    /// When set, an accepted cancel rewrites the job's script to report
    /// `cancelled`; otherwise the script keeps serving whatever it had,
    /// simulating a server that has not stopped the job yet.
    pub cancel_settles: bool,
    /// Id handed to the next accepted submission.
    pub next_id: Option<String>,
    /// Script attached to the next accepted submission.
    pub next_script: Option<Vec<Value>>,
    /// `total_urls` reported for the next batch submission.
    pub next_total: u32,
    pub submissions: u32,
    pub status_polls: HashMap<String, u32>,
    pub batch_listing: Vec<Value>,
    pub task_listing: Vec<Value>,
}

/// Scripted stand-in for the remote analysis service.
#[derive(Clone)]
pub struct MockService {
    pub state: Arc<Mutex<MockState>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                cancel_settles: true,
                next_total: 3,
                ..MockState::default()
            })),
        }
    }

    /// Spin up the mock on an ephemeral port and return its base URL.
    pub async fn spawn(&self) -> String {
        let app = router(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock service");
        let addr = listener.local_addr().expect("mock service addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock service");
        });
        format!("http://{addr}")
    }

    /// Script the job created by the next submission.
    pub fn script_next(&self, id: &str, script: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        state.next_id = Some(id.to_string());
        state.next_script = Some(script);
    }

    /// Register a pre-existing batch, as if submitted in an earlier session.
    pub fn insert_batch(&self, id: &str, script: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .batches
            .insert(id.to_string(), MockJob::new(script));
    }

    pub fn remove_batch(&self, id: &str) {
        self.state.lock().unwrap().batches.remove(id);
    }

    pub fn set_results(&self, id: &str, results: Value) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.batches.get_mut(id) {
            job.results = results;
        } else if let Some(job) = state.tasks.get_mut(id) {
            job.results = results;
        }
    }

    pub fn set_batch_listing(&self, listing: Vec<Value>) {
        self.state.lock().unwrap().batch_listing = listing;
    }

    pub fn polls(&self, id: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .status_polls
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn submissions(&self) -> u32 {
        self.state.lock().unwrap().submissions
    }

    pub fn batch_exists(&self, id: &str) -> bool {
        self.state.lock().unwrap().batches.contains_key(id)
    }
}

pub fn router(service: MockService) -> Router {
    Router::new()
        .route("/analyze", post(submit_single))
        .route("/bulk-analyze", post(submit_batch))
        .route("/analyze-status/{id}", get(task_status))
        .route("/bulk-status/{id}", get(batch_status))
        .route("/analyze-results/{id}", get(task_results))
        .route("/bulk-results/{id}", get(batch_results))
        .route("/analyze-cancel/{id}", post(cancel_task))
        .route("/bulk-cancel/{id}", post(cancel_batch))
        .route("/analyze-task/{id}", delete(delete_task))
        .route("/bulk-job/{id}", delete(delete_batch))
        .route("/bulk-batches", get(list_batches))
        .route("/dealer/my-analysis-tasks", get(list_tasks))
        .with_state(service)
}

// ── status payload builders ──────────────────────────────────────────

pub fn processing(processed: u32, failed: u32) -> Value {
    json!({ "status": "processing", "processed_urls": processed, "failed_urls": failed })
}

pub fn processing_at(processed: u32, failed: u32, current_url: &str) -> Value {
    json!({
        "status": "processing",
        "processed_urls": processed,
        "failed_urls": failed,
        "current_url": current_url
    })
}

pub fn completed(processed: u32, failed: u32) -> Value {
    json!({ "status": "completed", "processed_urls": processed, "failed_urls": failed })
}

pub fn result_row(url: &str, transcript: &str) -> Value {
    json!({
        "citnow_url": url,
        "transcription": { "text": transcript },
        "video_analysis": { "quality_score": 8.0 }
    })
}

// ── wait utilities ───────────────────────────────────────────────────

const WAIT_TICK: Duration = Duration::from_millis(20);
const WAIT_ROUNDS: u32 = 400;

pub async fn wait_for_status(tracker: &Tracker, id: &str, status: JobStatus) {
    for _ in 0..WAIT_ROUNDS {
        if tracker.job(id).await.map(|j| j.status) == Some(status) {
            return;
        }
        sleep(WAIT_TICK).await;
    }
    panic!("job {id} never reached {status}");
}

pub async fn wait_until_gone(tracker: &Tracker, id: &str) {
    for _ in 0..WAIT_ROUNDS {
        if tracker.job(id).await.is_none() {
            return;
        }
        sleep(WAIT_TICK).await;
    }
    panic!("job {id} was never removed");
}

pub async fn wait_for_polls(service: &MockService, id: &str, at_least: u32) {
    for _ in 0..WAIT_ROUNDS {
        if service.polls(id) >= at_least {
            return;
        }
        sleep(WAIT_TICK).await;
    }
    panic!("job {id} was never polled {at_least} times");
}

// ── handlers ─────────────────────────────────────────────────────────

async fn submit_single(
    State(service): State<MockService>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let mut state = service.state.lock().unwrap();
    state.submissions += 1;
    if state.reject_submissions {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "invalid video url" })),
        );
    }
    assert!(body.get("citnow_url").is_some(), "missing video url field");
    let id = state
        .next_id
        .take()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let script = state
        .next_script
        .take()
        .unwrap_or_else(|| vec![json!({ "status": "processing" })]);
    state.tasks.insert(id.clone(), MockJob::new(script));
    (StatusCode::OK, Json(json!({ "task_id": id })))
}

async fn submit_batch(
    State(service): State<MockService>,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    let mut saw_file = false;
    while let Some(field) = multipart.next_field().await.unwrap_or(None) {
        if field.name() == Some("file") {
            let data = field.bytes().await.unwrap_or_default();
            saw_file = !data.is_empty();
        }
    }

    let mut state = service.state.lock().unwrap();
    state.submissions += 1;
    if state.reject_submissions || !saw_file {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "spreadsheet contained no video URLs" })),
        );
    }
    let id = state
        .next_id
        .take()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let script = state
        .next_script
        .take()
        .unwrap_or_else(|| vec![json!({ "status": "processing" })]);
    let total = state.next_total;
    state.batches.insert(id.clone(), MockJob::new(script));
    (
        StatusCode::OK,
        Json(json!({ "batch_id": id, "total_urls": total })),
    )
}

fn serve_status(state: &mut MockState, batch: bool, id: &str) -> Option<Value> {
    *state.status_polls.entry(id.to_string()).or_default() += 1;
    let jobs = if batch {
        &mut state.batches
    } else {
        &mut state.tasks
    };
    jobs.get_mut(id).map(MockJob::next_status)
}

async fn batch_status(
    State(service): State<MockService>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let mut state = service.state.lock().unwrap();
    serve_status(&mut state, true, &id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn task_status(
    State(service): State<MockService>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let mut state = service.state.lock().unwrap();
    serve_status(&mut state, false, &id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn batch_results(
    State(service): State<MockService>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let state = service.state.lock().unwrap();
    state
        .batches
        .get(&id)
        .map(|job| Json(job.results.clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn task_results(
    State(service): State<MockService>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let state = service.state.lock().unwrap();
    state
        .tasks
        .get(&id)
        .map(|job| Json(job.results.clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

fn serve_cancel(state: &mut MockState, batch: bool, id: &str) -> (StatusCode, Json<Value>) {
    let rejects = state.cancel_rejects;
    let settles = state.cancel_settles;
    let jobs = if batch {
        &mut state.batches
    } else {
        &mut state.tasks
    };
    let Some(job) = jobs.get_mut(id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "no such job" })),
        );
    };
    if rejects {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "detail": "job already finished" })),
        );
    }
    if settles {
        job.script = vec![json!({ "status": "cancelled" })];
        job.cursor = 0;
    }
    (StatusCode::OK, Json(json!({ "ok": true })))
}

async fn cancel_batch(
    State(service): State<MockService>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let mut state = service.state.lock().unwrap();
    serve_cancel(&mut state, true, &id)
}

async fn cancel_task(
    State(service): State<MockService>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let mut state = service.state.lock().unwrap();
    serve_cancel(&mut state, false, &id)
}

async fn delete_batch(
    State(service): State<MockService>,
    Path(id): Path<String>,
) -> StatusCode {
    let mut state = service.state.lock().unwrap();
    if state.batches.remove(&id).is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn delete_task(State(service): State<MockService>, Path(id): Path<String>) -> StatusCode {
    let mut state = service.state.lock().unwrap();
    if state.tasks.remove(&id).is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn list_batches(
    State(service): State<MockService>,
) -> Result<Json<Vec<Value>>, StatusCode> {
    let state = service.state.lock().unwrap();
    if state.listing_down {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(state.batch_listing.clone()))
}

async fn list_tasks(
    State(service): State<MockService>,
) -> Result<Json<Vec<Value>>, StatusCode> {
    let state = service.state.lock().unwrap();
    if state.listing_down {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(state.task_listing.clone()))
}
