use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::models::job::Job;

const STORE_KEY_PREFIX: &str = "video_portal:jobs";

/// Pluggable durable backing for the job cache.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn load(&self) -> Result<Vec<Job>, StoreError>;
    async fn save(&self, jobs: &[Job]) -> Result<(), StoreError>;
}

#[async_trait]
impl<B: StoreBackend + ?Sized> StoreBackend for std::sync::Arc<B> {
    async fn load(&self) -> Result<Vec<Job>, StoreError> {
        (**self).load().await
    }

    async fn save(&self, jobs: &[Job]) -> Result<(), StoreError> {
        (**self).save(jobs).await
    }
}

/// Volatile backend for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryBackend {
    slot: Mutex<Vec<Job>>,
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn load(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, jobs: &[Job]) -> Result<(), StoreError> {
        *self.slot.lock().await = jobs.to_vec();
        Ok(())
    }
}

/// Redis-backed durable job cache.
///
/// The whole owner-scoped job set is stored as one JSON document under a
/// single key, mirroring the one browser-storage slot it replaces.
pub struct RedisBackend {
    client: redis::Client,
    key: String,
}

impl RedisBackend {
    pub fn new(redis_url: &str, owner_id: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(StoreError::Redis)?;
        Ok(Self {
            client,
            key: format!("{STORE_KEY_PREFIX}:{owner_id}"),
        })
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn load(&self) -> Result<Vec<Job>, StoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::Redis)?;
        let payload: Option<String> = conn.get(&self.key).await.map_err(StoreError::Redis)?;
        match payload {
            Some(raw) => serde_json::from_str(&raw).map_err(StoreError::Serialize),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::Redis)?;
        let payload = serde_json::to_string(jobs).map_err(StoreError::Serialize)?;
        conn.set::<_, _, ()>(&self.key, payload)
            .await
            .map_err(StoreError::Redis)?;
        Ok(())
    }
}

/// Client-side cache of known jobs, persisted through a [`StoreBackend`] and
/// scoped to one owner.
///
/// Mutations apply to the in-memory map first and are then written through;
/// a failed durable write is logged and retried on the next mutation, so the
/// cache itself is never left half-updated.
pub struct JobStore {
    backend: Box<dyn StoreBackend>,
    owner_id: String,
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobStore {
    pub fn new(backend: impl StoreBackend + 'static, owner_id: impl Into<String>) -> Self {
        Self {
            backend: Box::new(backend),
            owner_id: owner_id.into(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Hydrate the cache from the durable backend, keeping only this owner's
    /// jobs. Returns how many were restored.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let loaded = self.backend.load().await?;
        let mut jobs = self.jobs.lock().await;
        jobs.clear();
        for job in loaded
            .into_iter()
            .filter(|job| job.owner_id == self.owner_id)
        {
            jobs.insert(job.id.clone(), job);
        }
        Ok(jobs.len())
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.lock().await.get(id).cloned()
    }

    /// Snapshot of all cached jobs, newest first.
    pub async fn snapshot(&self) -> Vec<Job> {
        let jobs = self.jobs.lock().await;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub async fn insert(&self, job: Job) {
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.id.clone(), job);
        self.persist(&jobs).await;
    }

    /// Apply `mutate` to the cached job, then write through. Returns the
    /// updated job, or `None` if the id is not tracked.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id)?;
        mutate(job);
        let updated = job.clone();
        self.persist(&jobs).await;
        Some(updated)
    }

    pub async fn remove(&self, id: &str) -> Option<Job> {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.remove(id);
        if removed.is_some() {
            self.persist(&jobs).await;
        }
        removed
    }

    /// Replace the whole cached set with an authoritative server listing.
    pub async fn replace_all(&self, incoming: Vec<Job>) -> usize {
        let mut jobs = self.jobs.lock().await;
        jobs.clear();
        for job in incoming
            .into_iter()
            .filter(|job| job.owner_id == self.owner_id)
        {
            jobs.insert(job.id.clone(), job);
        }
        let count = jobs.len();
        self.persist(&jobs).await;
        count
    }

    async fn persist(&self, jobs: &HashMap<String, Job>) {
        let all: Vec<Job> = jobs.values().cloned().collect();
        if let Err(e) = self.backend.save(&all).await {
            tracing::warn!(error = %e, "failed to persist job cache, keeping in-memory state");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
