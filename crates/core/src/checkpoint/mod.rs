//! Per-task checkpoint state, the only shared mutable object in a run.
//!
//! Every write replaces whole named fields; there is no merge logic. A task
//! is assumed to have a single active orchestrator.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::model::{
    Chapter, GenerationRequest, IssueReport, TaskId, TaskPhase, TaskProgress, TaskState,
};

mod blob;

pub use blob::{BlobError, BlobStore, MemoryBlobStore};

const INDEX_KEY: &str = "tasks/index.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("任务 {0} 不存在")]
    NotFound(TaskId),
    #[error("任务 {task_id} 的尝试次数 {attempt} 超过上限 {max_attempts}")]
    AttemptOverflow {
        task_id: TaskId,
        attempt: u32,
        max_attempts: u32,
    },
    #[error("读写 {key} 失败: {source}")]
    Blob {
        key: String,
        #[source]
        source: BlobError,
    },
    #[error("解析 {key} 失败: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("检查点存储锁已损坏")]
    Poisoned,
}

/// Fields of a run's result to replace. `None` leaves the field untouched.
#[derive(Clone, Debug, Default)]
pub struct PartialResult {
    pub chapters: Option<Vec<Chapter>>,
    pub last_score: Option<IssueReport>,
    pub attempt: Option<u32>,
}

impl PartialResult {
    pub fn chapters(chapters: Vec<Chapter>) -> Self {
        Self {
            chapters: Some(chapters),
            ..Self::default()
        }
    }

    pub fn score(report: IssueReport) -> Self {
        Self {
            last_score: Some(report),
            ..Self::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

#[async_trait]
pub trait TaskCheckpointStore: Send + Sync {
    async fn create(
        &self,
        request: GenerationRequest,
        max_attempts: u32,
    ) -> Result<TaskId, StoreError>;
    async fn get(&self, task_id: &str) -> Result<TaskState, StoreError>;
    async fn apply_progress(&self, task_id: &str, progress: TaskProgress) -> Result<(), StoreError>;
    async fn apply_result(&self, task_id: &str, result: PartialResult) -> Result<(), StoreError>;
    async fn set_status(
        &self,
        task_id: &str,
        phase: TaskPhase,
        error: Option<String>,
    ) -> Result<(), StoreError>;
    async fn set_paused(&self, task_id: &str, paused: bool) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<TaskState>, StoreError>;
    /// Returns whether a task was removed.
    async fn delete(&self, task_id: &str) -> Result<bool, StoreError>;
}

/// Fresh state for a submitted request. Existing chapters seed the resume
/// point.
pub fn new_task_state(request: GenerationRequest, max_attempts: u32) -> TaskState {
    let now = Utc::now();
    TaskState {
        task_id: uuid::Uuid::new_v4().to_string(),
        phase: TaskPhase::Init,
        attempt: 0,
        max_attempts,
        chapters: request.existing_chapters.clone(),
        last_score: None,
        progress: TaskProgress::new(
            request.existing_chapters.len() as u32,
            request.chapter_count,
        ),
        request,
        paused: false,
        error: None,
        created_at: now,
        updated_at: now,
    }
}

fn apply_partial(state: &mut TaskState, result: PartialResult) -> Result<(), StoreError> {
    if let Some(attempt) = result.attempt {
        if attempt > state.max_attempts {
            return Err(StoreError::AttemptOverflow {
                task_id: state.task_id.clone(),
                attempt,
                max_attempts: state.max_attempts,
            });
        }
        state.attempt = attempt;
    }
    if let Some(chapters) = result.chapters {
        state.chapters = chapters;
    }
    if let Some(report) = result.last_score {
        state.last_score = Some(report);
    }
    Ok(())
}

fn apply_status(state: &mut TaskState, phase: TaskPhase, error: Option<String>) {
    state.phase = phase;
    state.error = error;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    tasks: Mutex<HashMap<TaskId, TaskState>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<T>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut TaskState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut tasks = self.tasks.lock().map_err(|_| StoreError::Poisoned)?;
        let state = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        let value = f(state)?;
        state.updated_at = Utc::now();
        Ok(value)
    }
}

#[async_trait]
impl TaskCheckpointStore for InMemoryCheckpointStore {
    async fn create(
        &self,
        request: GenerationRequest,
        max_attempts: u32,
    ) -> Result<TaskId, StoreError> {
        let state = new_task_state(request, max_attempts);
        let task_id = state.task_id.clone();
        self.tasks
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(task_id.clone(), state);
        Ok(task_id)
    }

    async fn get(&self, task_id: &str) -> Result<TaskState, StoreError> {
        self.tasks
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    async fn apply_progress(
        &self,
        task_id: &str,
        progress: TaskProgress,
    ) -> Result<(), StoreError> {
        self.update(task_id, |state| {
            state.progress = progress;
            Ok(())
        })
    }

    async fn apply_result(&self, task_id: &str, result: PartialResult) -> Result<(), StoreError> {
        self.update(task_id, |state| apply_partial(state, result))
    }

    async fn set_status(
        &self,
        task_id: &str,
        phase: TaskPhase,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.update(task_id, |state| {
            apply_status(state, phase, error);
            Ok(())
        })
    }

    async fn set_paused(&self, task_id: &str, paused: bool) -> Result<(), StoreError> {
        self.update(task_id, |state| {
            state.paused = paused;
            Ok(())
        })
    }

    async fn list(&self) -> Result<Vec<TaskState>, StoreError> {
        let tasks = self.tasks.lock().map_err(|_| StoreError::Poisoned)?;
        let mut states: Vec<TaskState> = tasks.values().cloned().collect();
        states.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));
        Ok(states)
    }

    async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .tasks
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .remove(task_id)
            .is_some())
    }
}

/// Durable store: one JSON document per task plus an id index, on any
/// [`BlobStore`].
pub struct BlobCheckpointStore<B> {
    blobs: B,
    write_lock: tokio::sync::Mutex<()>,
}

impl<B: BlobStore> BlobCheckpointStore<B> {
    pub fn new(blobs: B) -> Self {
        Self {
            blobs,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    fn task_key(task_id: &str) -> String {
        format!("tasks/{task_id}.json")
    }

    async fn load_json<T: serde::de::DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let raw = self.blobs.load(key).await.map_err(|source| StoreError::Blob {
            key: key.to_string(),
            source,
        })?;
        raw.map(|text| {
            serde_json::from_str(&text).map_err(|source| StoreError::Serde {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
    }

    async fn save_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serde {
            key: key.to_string(),
            source,
        })?;
        self.blobs
            .save(key, &text)
            .await
            .map_err(|source| StoreError::Blob {
                key: key.to_string(),
                source,
            })
    }

    async fn index(&self) -> Result<Vec<TaskId>, StoreError> {
        Ok(self.load_json(INDEX_KEY).await?.unwrap_or_default())
    }

    async fn update<F>(&self, task_id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut TaskState) -> Result<(), StoreError> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let key = Self::task_key(task_id);
        let mut state: TaskState = self
            .load_json(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        f(&mut state)?;
        state.updated_at = Utc::now();
        self.save_json(&key, &state).await
    }
}

#[async_trait]
impl<B: BlobStore> TaskCheckpointStore for BlobCheckpointStore<B> {
    async fn create(
        &self,
        request: GenerationRequest,
        max_attempts: u32,
    ) -> Result<TaskId, StoreError> {
        let state = new_task_state(request, max_attempts);
        let task_id = state.task_id.clone();

        let _guard = self.write_lock.lock().await;
        self.save_json(&Self::task_key(&task_id), &state).await?;
        let mut index = self.index().await?;
        index.push(task_id.clone());
        self.save_json(INDEX_KEY, &index).await?;
        Ok(task_id)
    }

    async fn get(&self, task_id: &str) -> Result<TaskState, StoreError> {
        self.load_json(&Self::task_key(task_id))
            .await?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    async fn apply_progress(
        &self,
        task_id: &str,
        progress: TaskProgress,
    ) -> Result<(), StoreError> {
        self.update(task_id, move |state| {
            state.progress = progress;
            Ok(())
        })
        .await
    }

    async fn apply_result(&self, task_id: &str, result: PartialResult) -> Result<(), StoreError> {
        self.update(task_id, move |state| apply_partial(state, result))
            .await
    }

    async fn set_status(
        &self,
        task_id: &str,
        phase: TaskPhase,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.update(task_id, move |state| {
            apply_status(state, phase, error);
            Ok(())
        })
        .await
    }

    async fn set_paused(&self, task_id: &str, paused: bool) -> Result<(), StoreError> {
        self.update(task_id, move |state| {
            state.paused = paused;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<TaskState>, StoreError> {
        let mut states = Vec::new();
        for task_id in self.index().await? {
            if let Some(state) = self.load_json(&Self::task_key(&task_id)).await? {
                states.push(state);
            }
        }
        Ok(states)
    }

    async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.index().await?;
        let before = index.len();
        index.retain(|id| id != task_id);
        let removed = index.len() != before;
        if removed {
            self.save_json(INDEX_KEY, &index).await?;
        }
        let key = Self::task_key(task_id);
        self.blobs
            .remove(&key)
            .await
            .map_err(|source| StoreError::Blob { key, source })?;
        Ok(removed)
    }
}
