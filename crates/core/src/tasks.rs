//! Request/response control surface over checkpointed tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::checkpoint::{StoreError, TaskCheckpointStore};
use crate::config::PipelineConfig;
use crate::language_model::LanguageModel;
use crate::logging::{LogLevel, LogRecord, LogSink, SharedLogSink};
use crate::model::{Chapter, IssueReport, TaskId, TaskPhase, TaskState};
use crate::orchestrator::{BatchOrchestrator, OrchestratorError, RunOutcome};
use crate::progress::{ChannelProgressReporter, ProgressEvent};
use crate::prompts::{PromptError, PromptRegistry};
use crate::request::{GenerationRequestPayload, RequestError};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("请求无效: {0}")]
    Request(#[from] RequestError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("提示词加载失败: {0}")]
    Prompt(#[from] PromptError),
    #[error("任务 {0} 正在运行")]
    AlreadyRunning(TaskId),
    #[error("任务 {0} 已完成")]
    AlreadyDone(TaskId),
    #[error("任务 {task_id} 尚未结束（当前阶段：{phase}）")]
    NotFinished { task_id: TaskId, phase: TaskPhase },
}

/// A started run: the bounded event stream and the orchestrator's handle.
pub struct TaskRun {
    pub task_id: TaskId,
    pub events: mpsc::Receiver<ProgressEvent>,
    pub handle: JoinHandle<Result<RunOutcome, OrchestratorError>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub phase: TaskPhase,
    pub chapters: Vec<Chapter>,
    pub last_score: Option<IssueReport>,
    pub error: Option<String>,
}

impl From<TaskState> for TaskResult {
    fn from(state: TaskState) -> Self {
        Self {
            task_id: state.task_id,
            phase: state.phase,
            chapters: state.chapters,
            last_score: state.last_score,
            error: state.error,
        }
    }
}

/// A terminal task's result. Tasks still in progress are refused.
pub async fn finished_result(
    store: &dyn TaskCheckpointStore,
    task_id: &str,
) -> Result<TaskResult, TaskError> {
    let state = store.get(task_id).await?;
    if !state.phase.is_terminal() {
        return Err(TaskError::NotFinished {
            task_id: state.task_id,
            phase: state.phase,
        });
    }
    Ok(TaskResult::from(state))
}

/// Like [`finished_result`], then forgets the task. Unfinished tasks are kept.
pub async fn take_finished_result(
    store: &dyn TaskCheckpointStore,
    task_id: &str,
) -> Result<TaskResult, TaskError> {
    let result = finished_result(store, task_id).await?;
    store.delete(task_id).await?;
    Ok(result)
}

/// Takes effect at the next chapter boundary of a running task.
pub async fn request_pause(
    store: &dyn TaskCheckpointStore,
    task_id: &str,
) -> Result<(), TaskError> {
    store.set_paused(task_id, true).await?;
    Ok(())
}

pub struct TaskController {
    model: Arc<dyn LanguageModel>,
    store: Arc<dyn TaskCheckpointStore>,
    prompts: Arc<PromptRegistry>,
    sink: SharedLogSink,
    config: PipelineConfig,
    running: Mutex<HashMap<TaskId, AbortHandle>>,
}

impl TaskController {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn TaskCheckpointStore>,
        prompts: Arc<PromptRegistry>,
        sink: SharedLogSink,
        config: PipelineConfig,
    ) -> Self {
        Self {
            model,
            store,
            prompts,
            sink,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Validates before anything is stored.
    pub async fn create(&self, payload: GenerationRequestPayload) -> Result<TaskId, TaskError> {
        let request = payload.validate()?;
        let task_id = self
            .store
            .create(request, self.config.max_rewrite_attempts)
            .await?;
        self.log(LogLevel::Info, format!("已创建任务 {task_id}"));
        Ok(task_id)
    }

    pub async fn submit(&self, payload: GenerationRequestPayload) -> Result<TaskRun, TaskError> {
        let task_id = self.create(payload).await?;
        self.start(&task_id).await
    }

    pub async fn list(&self) -> Result<Vec<TaskState>, TaskError> {
        Ok(self.store.list().await?)
    }

    pub async fn get(&self, task_id: &str) -> Result<TaskState, TaskError> {
        Ok(self.store.get(task_id).await?)
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running
            .lock()
            .map(|running| {
                running
                    .get(task_id)
                    .is_some_and(|handle| !handle.is_finished())
            })
            .unwrap_or(false)
    }

    /// Spawns the orchestrator for a task, resuming from its checkpoint.
    pub async fn start(&self, task_id: &str) -> Result<TaskRun, TaskError> {
        let state = self.store.get(task_id).await?;
        if state.phase == TaskPhase::Done {
            return Err(TaskError::AlreadyDone(task_id.to_string()));
        }
        if self.is_running(task_id) {
            return Err(TaskError::AlreadyRunning(task_id.to_string()));
        }

        let (reporter, events) = ChannelProgressReporter::channel(self.config.event_buffer);
        let model = Arc::clone(&self.model);
        let store = Arc::clone(&self.store);
        let prompts = self.prompts_for_run()?;
        let sink = Arc::clone(&self.sink);
        let config = self.config.clone();
        let id = task_id.to_string();

        let handle = tokio::spawn(async move {
            let orchestrator = BatchOrchestrator::new(
                model.as_ref(),
                store.as_ref(),
                prompts.as_ref(),
                sink.as_ref(),
                config,
            );
            orchestrator.run(&id, &reporter).await
        });

        if let Ok(mut running) = self.running.lock() {
            running.retain(|_, tracked| !tracked.is_finished());
            running.insert(task_id.to_string(), handle.abort_handle());
        }
        Ok(TaskRun {
            task_id: task_id.to_string(),
            events,
            handle,
        })
    }

    /// Takes effect at the next chapter boundary of a running task.
    pub async fn pause(&self, task_id: &str) -> Result<(), TaskError> {
        request_pause(self.store.as_ref(), task_id).await?;
        self.log(LogLevel::Info, format!("任务 {task_id} 已请求暂停"));
        Ok(())
    }

    pub async fn resume(&self, task_id: &str) -> Result<TaskRun, TaskError> {
        self.store.set_paused(task_id, false).await?;
        self.start(task_id).await
    }

    /// Aborts a running job before removing its state.
    pub async fn delete(&self, task_id: &str) -> Result<bool, TaskError> {
        self.abort(task_id);
        Ok(self.store.delete(task_id).await?)
    }

    pub async fn get_result(&self, task_id: &str) -> Result<TaskResult, TaskError> {
        finished_result(self.store.as_ref(), task_id).await
    }

    /// Returns a terminal task's result and forgets the task.
    pub async fn take_result(&self, task_id: &str) -> Result<TaskResult, TaskError> {
        let result = take_finished_result(self.store.as_ref(), task_id).await?;
        if let Ok(mut running) = self.running.lock() {
            running.remove(task_id);
        }
        Ok(result)
    }

    /// Abort handles currently held for spawned runs.
    pub fn tracked_runs(&self) -> usize {
        self.running.lock().map(|running| running.len()).unwrap_or(0)
    }

    /// With hot reload on, each run renders from the prompt files as they
    /// are when it starts.
    fn prompts_for_run(&self) -> Result<Arc<PromptRegistry>, PromptError> {
        if !self.prompts.hot_reload_enabled() {
            return Ok(Arc::clone(&self.prompts));
        }
        let mut fresh = PromptRegistry::clone(&self.prompts);
        fresh.reload()?;
        self.log(LogLevel::Debug, "已重新加载提示词");
        Ok(Arc::new(fresh))
    }

    fn abort(&self, task_id: &str) {
        let handle = self
            .running
            .lock()
            .ok()
            .and_then(|mut running| running.remove(task_id));
        if let Some(handle) = handle {
            if !handle.is_finished() {
                handle.abort();
                self.log(LogLevel::Warn, format!("任务 {task_id} 已被中止"));
            }
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}
