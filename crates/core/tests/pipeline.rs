use std::fs;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use novelgate_core::{
    finished_result, take_finished_result, BatchOrchestrator, BlobCheckpointStore, BlobError,
    ErrorReason, ExistingChapterPayload, GenerationRequest, GenerationRequestPayload,
    InMemoryCheckpointStore, InvokeOptions, LanguageModel, LanguageModelError, MemoryBlobStore,
    NullLogSink, OrchestratorError, PartialResult, PipelineConfig, ProgressEvent, PromptConfig,
    PromptRegistry, RunOutcome, StoreError, TaskCheckpointStore, TaskController, TaskError,
    TaskId, TaskPhase, TaskProgress, TaskRun, TaskState, VecLogSink, VecProgressReporter,
};
use tempfile::tempdir;

/// Exactly 40 characters, seven words.
const FORTY_CHARS: &str = "alpha beta gamma delta epsilon zeta eta.";
const CLEAN_PROSE: &str = "林舟推开窗，看见远处的城门缓缓打开。";
const CLICHE_PROSE: &str = "他被当众退婚。\n众人都说他是废柴。\n他发誓要打脸。\n金手指终于觉醒。";

type Responder = dyn Fn(&str) -> Result<String, LanguageModelError> + Send + Sync;

struct MockLanguageModel {
    prompts: Mutex<Vec<String>>,
    responder: Box<Responder>,
    delay: Option<Duration>,
}

impl MockLanguageModel {
    fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, LanguageModelError> + Send + Sync + 'static,
    {
        Self {
            prompts: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            delay: None,
        }
    }

    fn replying(text: &'static str) -> Self {
        Self::new(move |_| Ok(text.to_string()))
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("mock mutex poisoned").clone()
    }

    fn prompts_containing(&self, needle: &str) -> usize {
        self.prompts()
            .iter()
            .filter(|prompt| prompt.contains(needle))
            .count()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn invoke(
        &self,
        prompt: &str,
        _options: &InvokeOptions,
    ) -> Result<String, LanguageModelError> {
        self.prompts
            .lock()
            .expect("mock mutex poisoned")
            .push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(prompt)
    }
}

fn unavailable() -> LanguageModelError {
    LanguageModelError::new(io::Error::new(io::ErrorKind::Other, "backend unavailable"))
}

fn payload(chapter_count: i64, target_word_count: i64) -> GenerationRequestPayload {
    GenerationRequestPayload {
        chapter_count,
        target_word_count,
        outline: "少年离开山村，前往王都寻找失踪的师父。".into(),
        ..GenerationRequestPayload::default()
    }
}

struct Finished {
    result: Result<RunOutcome, OrchestratorError>,
    events: Vec<ProgressEvent>,
    state: TaskState,
}

async fn run_task(
    model: &MockLanguageModel,
    payload: GenerationRequestPayload,
    config: PipelineConfig,
) -> Finished {
    let store = InMemoryCheckpointStore::new();
    let request = payload.validate().expect("valid request");
    let task_id = store
        .create(request, config.max_rewrite_attempts)
        .await
        .expect("create task");
    run_existing(model, &store, &task_id, config).await
}

async fn run_existing(
    model: &MockLanguageModel,
    store: &dyn TaskCheckpointStore,
    task_id: &str,
    config: PipelineConfig,
) -> Finished {
    let prompts = PromptRegistry::new().expect("built-in prompts");
    let reporter = VecProgressReporter::new();
    let orchestrator = BatchOrchestrator::new(model, store, &prompts, &NullLogSink, config);
    let result = orchestrator.run(task_id, &reporter).await;
    Finished {
        result,
        events: reporter.events(),
        state: store.get(task_id).await.expect("task state"),
    }
}

fn assert_single_terminal(events: &[ProgressEvent]) {
    let terminal: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, event)| event.is_terminal())
        .map(|(index, _)| index)
        .collect();
    assert_eq!(terminal, vec![events.len() - 1], "steps: {:?}", steps(events));
}

fn steps(events: &[ProgressEvent]) -> Vec<&'static str> {
    events.iter().map(ProgressEvent::step).collect()
}

async fn drain(mut run: TaskRun) -> (Vec<ProgressEvent>, Result<RunOutcome, OrchestratorError>) {
    let mut events = Vec::new();
    while let Some(event) = run.events.recv().await {
        events.push(event);
    }
    (events, run.handle.await.expect("join"))
}

fn controller_with(model: Arc<MockLanguageModel>, prompts: PromptRegistry) -> TaskController {
    TaskController::new(
        model,
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(prompts),
        Arc::new(NullLogSink),
        PipelineConfig::default(),
    )
}

/// Delegates to an in-memory store but refuses every result write.
struct ReadOnlyResults {
    inner: InMemoryCheckpointStore,
}

#[async_trait]
impl TaskCheckpointStore for ReadOnlyResults {
    async fn create(
        &self,
        request: GenerationRequest,
        max_attempts: u32,
    ) -> Result<TaskId, StoreError> {
        self.inner.create(request, max_attempts).await
    }

    async fn get(&self, task_id: &str) -> Result<TaskState, StoreError> {
        self.inner.get(task_id).await
    }

    async fn apply_progress(
        &self,
        task_id: &str,
        progress: TaskProgress,
    ) -> Result<(), StoreError> {
        self.inner.apply_progress(task_id, progress).await
    }

    async fn apply_result(&self, task_id: &str, _result: PartialResult) -> Result<(), StoreError> {
        Err(StoreError::Blob {
            key: format!("tasks/{task_id}.json"),
            source: BlobError::Backend("磁盘已满".into()),
        })
    }

    async fn set_status(
        &self,
        task_id: &str,
        phase: TaskPhase,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.inner.set_status(task_id, phase, error).await
    }

    async fn set_paused(&self, task_id: &str, paused: bool) -> Result<(), StoreError> {
        self.inner.set_paused(task_id, paused).await
    }

    async fn list(&self) -> Result<Vec<TaskState>, StoreError> {
        self.inner.list().await
    }

    async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        self.inner.delete(task_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn short_chapters_are_supplemented_and_flagged() {
    let model = MockLanguageModel::replying(FORTY_CHARS);
    let finished = run_task(&model, payload(3, 100), PipelineConfig::default()).await;

    let (chapters, summary) = match finished.result {
        Ok(RunOutcome::Completed {
            chapters, summary, ..
        }) => (chapters, summary),
        other => panic!("expected completion, got {other:?}"),
    };

    assert_eq!(chapters.len(), 3);
    for (index, chapter) in chapters.iter().enumerate() {
        assert_eq!(chapter.order, index as u32 + 1);
        assert_eq!(chapter.supplement_attempts, 3);
        assert!(chapter.below_target);
        assert_eq!(chapter.word_count, 4 * 7);
    }
    assert_eq!(model.prompts_containing("目前篇幅不足"), 9);
    assert_eq!(summary.below_target, vec![1, 2, 3]);
    assert!(summary.placeholders.is_empty());

    assert_single_terminal(&finished.events);
    assert_eq!(finished.events.last().map(ProgressEvent::step), Some("all-completed"));
    assert_eq!(finished.state.phase, TaskPhase::Done);
}

#[tokio::test(start_paused = true)]
async fn early_chapter_failure_aborts_the_batch() {
    let model = MockLanguageModel::new(|prompt| {
        if prompt.contains("第3章") {
            Err(unavailable())
        } else {
            Ok(FORTY_CHARS.to_string())
        }
    });
    let finished = run_task(&model, payload(15, 5), PipelineConfig::default()).await;

    assert!(matches!(
        finished.result,
        Err(OrchestratorError::Aborted { order: 3, .. })
    ));
    match finished.events.last() {
        Some(ProgressEvent::Error { reason, .. }) => assert_eq!(*reason, ErrorReason::Aborted),
        other => panic!("expected error event, got {other:?}"),
    }
    assert_single_terminal(&finished.events);
    assert_eq!(model.prompts_containing("第4章"), 0);
    assert_eq!(finished.state.phase, TaskPhase::Failed);
    assert_eq!(finished.state.chapters.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn late_chapter_failure_becomes_placeholder() {
    let model = MockLanguageModel::new(|prompt| {
        if prompt.contains("第11章") {
            Err(unavailable())
        } else {
            Ok(FORTY_CHARS.to_string())
        }
    });
    let finished = run_task(&model, payload(12, 5), PipelineConfig::default()).await;

    let (chapters, summary) = match finished.result {
        Ok(RunOutcome::Completed {
            chapters, summary, ..
        }) => (chapters, summary),
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(chapters.len(), 12);
    assert!(chapters[10].is_placeholder());
    assert_eq!(chapters[10].order, 11);
    assert!(!chapters[11].is_placeholder());
    assert_eq!(summary.placeholders, vec![11]);
    assert!(steps(&finished.events).contains(&"chapter-placeholder"));
    assert_single_terminal(&finished.events);
}

#[tokio::test(start_paused = true)]
async fn resume_generates_only_missing_chapters() {
    let existing: Vec<ExistingChapterPayload> = (1..=3)
        .map(|order| ExistingChapterPayload {
            id: Some(format!("kept-{order}")),
            title: format!("旧章{order}"),
            content: FORTY_CHARS.into(),
            outline: String::new(),
        })
        .collect();
    let model = MockLanguageModel::replying(FORTY_CHARS);
    let finished = run_task(
        &model,
        GenerationRequestPayload {
            existing_chapters: existing,
            ..payload(10, 5)
        },
        PipelineConfig::default(),
    )
    .await;

    let chapters = match finished.result {
        Ok(RunOutcome::Completed { chapters, .. }) => chapters,
        other => panic!("expected completion, got {other:?}"),
    };
    for order in 1..=3 {
        assert_eq!(model.prompts_containing(&format!("创作第{order}章")), 0);
        assert_eq!(chapters[order - 1].id, format!("kept-{order}"));
    }
    for order in 4..=10 {
        assert_eq!(model.prompts_containing(&format!("创作第{order}章")), 1);
    }
    let orders: Vec<u32> = chapters.iter().map(|c| c.order).collect();
    assert_eq!(orders, (1..=10).collect::<Vec<_>>());

    match finished.events.first() {
        Some(ProgressEvent::Init { resumed_from, .. }) => assert_eq!(*resumed_from, 3),
        other => panic!("expected init event, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_is_reported_as_timeout() {
    let model =
        MockLanguageModel::replying(FORTY_CHARS).with_delay(Duration::from_secs(2 * 60 * 60));
    let config = PipelineConfig {
        deadline_minutes: 1,
        ..PipelineConfig::default()
    };
    let finished = run_task(&model, payload(2, 5), config).await;

    assert!(matches!(
        finished.result,
        Err(OrchestratorError::Timeout { minutes: 1 })
    ));
    match finished.events.last() {
        Some(ProgressEvent::Error { reason, .. }) => assert_eq!(*reason, ErrorReason::Timeout),
        other => panic!("expected timeout error, got {other:?}"),
    }
    assert!(!steps(&finished.events).contains(&"quality-failed"));
    assert_single_terminal(&finished.events);
    assert_eq!(finished.state.phase, TaskPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn persistent_low_quality_fails_after_bounded_rewrites() {
    let model = MockLanguageModel::replying(CLICHE_PROSE);
    let finished = run_task(&model, payload(2, 5), PipelineConfig::default()).await;

    let (chapters, report) = match finished.result {
        Ok(RunOutcome::QualityFailed { chapters, report }) => (chapters, report),
        other => panic!("expected quality failure, got {other:?}"),
    };
    assert_eq!(chapters.len(), 2);
    assert!(!report.passes_threshold);

    let steps = steps(&finished.events);
    assert_eq!(steps.iter().filter(|s| **s == "rewriting").count(), 3);
    assert_eq!(steps.iter().filter(|s| **s == "rewrite-completed").count(), 3);
    assert_eq!(steps.last(), Some(&"quality-failed"));
    assert_single_terminal(&finished.events);

    // every chapter is rewritten on every pass
    assert_eq!(model.prompts_containing("未通过质量审核"), 3 * 2);
    assert_eq!(finished.state.phase, TaskPhase::Failed);
    assert_eq!(finished.state.attempt, 3);
    assert!(finished.state.last_score.is_some());
}

#[tokio::test(start_paused = true)]
async fn rewrite_recovers_a_failing_batch() {
    let model = MockLanguageModel::new(|prompt| {
        if prompt.contains("未通过质量审核") {
            Ok(CLEAN_PROSE.to_string())
        } else {
            Ok(CLICHE_PROSE.to_string())
        }
    });
    let finished = run_task(&model, payload(2, 5), PipelineConfig::default()).await;

    let (chapters, summary) = match finished.result {
        Ok(RunOutcome::Completed {
            chapters, summary, ..
        }) => (chapters, summary),
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(summary.rewrite_attempts, 1);
    assert!(chapters.iter().all(|c| c.content == CLEAN_PROSE));
    assert_eq!(finished.state.attempt, 1);
    assert_single_terminal(&finished.events);
}

#[tokio::test(start_paused = true)]
async fn passing_batch_with_errors_gets_one_fix_pass() {
    let model = MockLanguageModel::new(|prompt| {
        if prompt.contains("请修复第") {
            Ok(CLEAN_PROSE.to_string())
        } else {
            Ok("他终于突破境界，走出了山门。".to_string())
        }
    });
    let finished = run_task(&model, payload(2, 5), PipelineConfig::default()).await;

    let (chapters, report) = match finished.result {
        Ok(RunOutcome::Completed {
            chapters, report, ..
        }) => (chapters, report),
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(model.prompts_containing("请修复第"), 2);
    assert_eq!(model.prompts_containing("未通过质量审核"), 0);
    assert!(chapters.iter().all(|c| c.content == CLEAN_PROSE));
    assert!(report.violations.is_empty());
    match finished
        .events
        .iter()
        .find(|event| event.step() == "fix-completed")
    {
        Some(ProgressEvent::FixCompleted { kept, fixed, .. }) => {
            assert!(*kept);
            assert_eq!(fixed, &vec![1, 2]);
        }
        other => panic!("expected fix-completed, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn fix_mode_repairs_requested_chapters_only() {
    let model = MockLanguageModel::replying(CLEAN_PROSE);
    let request = GenerationRequestPayload {
        chapter_count: 2,
        target_word_count: 5,
        fix_mode: true,
        existing_chapters: vec![
            ExistingChapterPayload {
                content: CLEAN_PROSE.into(),
                ..ExistingChapterPayload::default()
            },
            ExistingChapterPayload {
                content: CLICHE_PROSE.into(),
                ..ExistingChapterPayload::default()
            },
        ],
        chapters_to_fix: vec![2],
        ..GenerationRequestPayload::default()
    };
    let finished = run_task(&model, request, PipelineConfig::default()).await;

    assert!(matches!(finished.result, Ok(RunOutcome::Completed { .. })));
    assert_eq!(model.prompts().len(), 1);
    assert_eq!(model.prompts_containing("请修复第2章"), 1);
    assert_eq!(model.prompts_containing("创作第"), 0);
    assert!(!steps(&finished.events).contains(&"rewriting"));
    assert_eq!(finished.state.chapters[1].content, CLEAN_PROSE);
    assert_single_terminal(&finished.events);
}

#[tokio::test(start_paused = true)]
async fn paused_task_stops_and_resumes_from_checkpoint() {
    let model = Arc::new(MockLanguageModel::replying(FORTY_CHARS));
    let store = Arc::new(InMemoryCheckpointStore::new());
    let sink = Arc::new(VecLogSink::new());
    let controller = TaskController::new(
        model.clone(),
        store.clone(),
        Arc::new(PromptRegistry::new().expect("built-in prompts")),
        sink.clone(),
        PipelineConfig::default(),
    );

    let rejected = controller.create(payload(0, 5)).await;
    assert!(matches!(rejected, Err(TaskError::Request(_))));
    assert!(controller.list().await.expect("list").is_empty());

    let task_id = controller.create(payload(3, 5)).await.expect("create");
    controller.pause(&task_id).await.expect("pause");

    let mut run = controller.start(&task_id).await.expect("start");
    let mut events = Vec::new();
    while let Some(event) = run.events.recv().await {
        events.push(event);
    }
    let outcome = run.handle.await.expect("join").expect("run");
    assert_eq!(outcome, RunOutcome::Paused { completed: 0 });
    match events.last() {
        Some(ProgressEvent::Error { reason, .. }) => assert_eq!(*reason, ErrorReason::Paused),
        other => panic!("expected paused error, got {other:?}"),
    }
    assert!(model.prompts().is_empty());
    assert!(matches!(
        controller.get_result(&task_id).await,
        Err(TaskError::NotFinished { .. })
    ));

    let mut run = controller.resume(&task_id).await.expect("resume");
    let mut events = Vec::new();
    while let Some(event) = run.events.recv().await {
        events.push(event);
    }
    assert!(matches!(
        run.handle.await.expect("join"),
        Ok(RunOutcome::Completed { .. })
    ));
    assert_single_terminal(&events);

    let result = controller.take_result(&task_id).await.expect("result");
    assert_eq!(result.phase, TaskPhase::Done);
    assert_eq!(result.chapters.len(), 3);
    assert!(matches!(
        controller.get(&task_id).await,
        Err(TaskError::Store(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn deleting_a_running_task_aborts_it() {
    let model = Arc::new(
        MockLanguageModel::replying(FORTY_CHARS).with_delay(Duration::from_secs(30)),
    );
    let controller = TaskController::new(
        model.clone(),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(PromptRegistry::new().expect("built-in prompts")),
        Arc::new(NullLogSink),
        PipelineConfig::default(),
    );

    let run = controller.submit(payload(3, 5)).await.expect("submit");
    tokio::task::yield_now().await;
    assert!(controller.is_running(&run.task_id));

    assert!(controller.delete(&run.task_id).await.expect("delete"));
    let joined = run.handle.await;
    assert!(joined.is_err_and(|err| err.is_cancelled()));
    assert!(controller.list().await.expect("list").is_empty());
}

#[tokio::test(start_paused = true)]
async fn interrupted_rewrite_restarts_from_the_first_attempt() {
    let existing: Vec<ExistingChapterPayload> = (1..=2)
        .map(|order| ExistingChapterPayload {
            id: None,
            title: format!("第{order}章"),
            content: CLICHE_PROSE.into(),
            outline: String::new(),
        })
        .collect();
    let request = GenerationRequestPayload {
        existing_chapters: existing,
        ..payload(2, 5)
    }
    .validate()
    .expect("valid request");

    let store = InMemoryCheckpointStore::new();
    let task_id = store.create(request, 3).await.expect("create task");
    store
        .apply_result(&task_id, PartialResult::default().with_attempt(2))
        .await
        .expect("seed attempt");
    store
        .set_status(&task_id, TaskPhase::Rewriting, None)
        .await
        .expect("seed phase");

    let model = MockLanguageModel::replying(CLICHE_PROSE);
    let finished = run_existing(&model, &store, &task_id, PipelineConfig::default()).await;

    assert!(matches!(
        finished.result,
        Ok(RunOutcome::QualityFailed { .. })
    ));
    let attempts: Vec<u32> = finished
        .events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Rewriting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(model.prompts_containing("创作第"), 0);
    assert_eq!(finished.state.attempt, 3);
    assert_single_terminal(&finished.events);
}

#[tokio::test(start_paused = true)]
async fn checkpoint_write_failure_is_reported_as_store_error() {
    let store = ReadOnlyResults {
        inner: InMemoryCheckpointStore::new(),
    };
    let request = payload(3, 5).validate().expect("valid request");
    let task_id = store.create(request, 3).await.expect("create task");

    let model = MockLanguageModel::replying(FORTY_CHARS);
    let finished = run_existing(&model, &store, &task_id, PipelineConfig::default()).await;

    assert!(matches!(finished.result, Err(OrchestratorError::Store(_))));
    match finished.events.last() {
        Some(ProgressEvent::Error { reason, .. }) => assert_eq!(*reason, ErrorReason::Store),
        other => panic!("expected store error, got {other:?}"),
    }
    assert_single_terminal(&finished.events);
    assert_eq!(model.prompts_containing("创作第2章"), 0);
    assert_eq!(finished.state.phase, TaskPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn durable_checkpoint_resumes_in_a_new_store_instance() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let first_store = BlobCheckpointStore::new(Arc::clone(&blobs));
    let request = payload(3, 5).validate().expect("valid request");
    let task_id = first_store.create(request, 3).await.expect("create task");

    let failing = MockLanguageModel::new(|prompt| {
        if prompt.contains("第3章") {
            Err(unavailable())
        } else {
            Ok(FORTY_CHARS.to_string())
        }
    });
    let interrupted =
        run_existing(&failing, &first_store, &task_id, PipelineConfig::default()).await;
    assert!(matches!(
        interrupted.result,
        Err(OrchestratorError::Aborted { order: 3, .. })
    ));
    let kept: Vec<String> = interrupted.state.chapters.iter().map(|c| c.id.clone()).collect();
    assert_eq!(kept.len(), 2);
    drop(first_store);

    let reopened = BlobCheckpointStore::new(Arc::clone(&blobs));
    let model = MockLanguageModel::replying(FORTY_CHARS);
    let finished = run_existing(&model, &reopened, &task_id, PipelineConfig::default()).await;

    assert!(matches!(finished.result, Ok(RunOutcome::Completed { .. })));
    match finished.events.first() {
        Some(ProgressEvent::Init { resumed_from, .. }) => assert_eq!(*resumed_from, 2),
        other => panic!("expected init event, got {other:?}"),
    }
    assert_eq!(model.prompts_containing("创作第1章"), 0);
    assert_eq!(model.prompts_containing("创作第2章"), 0);
    assert_eq!(model.prompts_containing("创作第3章"), 1);
    let ids: Vec<String> = finished.state.chapters[..2].iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids, kept);
    assert_eq!(finished.state.phase, TaskPhase::Done);
    assert_eq!(reopened.list().await.expect("list").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn hot_reload_picks_up_prompt_edits_between_runs() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("outline.toml");
    let write_outline = |version: &str| {
        let body = format!(
            "[prompts.scene_outline]\ntemplate = \"场景规划{version} 第{{chapter_number}}章\"\n"
        );
        fs::write(&path, body).expect("write prompt file");
    };
    write_outline("甲");

    let config = PromptConfig {
        custom_directories: vec![dir.path().to_path_buf()],
        enable_hot_reload: true,
    };
    let model = Arc::new(MockLanguageModel::replying(FORTY_CHARS));
    let prompts = PromptRegistry::from_prompt_config(&config).expect("prompts");
    let controller = controller_with(model.clone(), prompts);

    let (_, first) = drain(controller.submit(payload(1, 5)).await.expect("submit")).await;
    assert!(matches!(first, Ok(RunOutcome::Completed { .. })));
    assert_eq!(model.prompts_containing("场景规划甲 第1章"), 1);

    write_outline("乙");
    let (_, second) = drain(controller.submit(payload(1, 5)).await.expect("submit")).await;
    assert!(matches!(second, Ok(RunOutcome::Completed { .. })));
    assert_eq!(model.prompts_containing("场景规划甲 第1章"), 1);
    assert_eq!(model.prompts_containing("场景规划乙 第1章"), 1);
}

#[tokio::test(start_paused = true)]
async fn without_hot_reload_runs_keep_the_loaded_prompts() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("outline.toml");
    fs::write(
        &path,
        "[prompts.scene_outline]\ntemplate = \"场景规划甲 第{chapter_number}章\"\n",
    )
    .expect("write prompt file");

    let config = PromptConfig {
        custom_directories: vec![dir.path().to_path_buf()],
        enable_hot_reload: false,
    };
    let model = Arc::new(MockLanguageModel::replying(FORTY_CHARS));
    let prompts = PromptRegistry::from_prompt_config(&config).expect("prompts");
    let controller = controller_with(model.clone(), prompts);

    fs::write(
        &path,
        "[prompts.scene_outline]\ntemplate = \"场景规划乙 第{chapter_number}章\"\n",
    )
    .expect("write prompt file");
    let (_, outcome) = drain(controller.submit(payload(1, 5)).await.expect("submit")).await;
    assert!(matches!(outcome, Ok(RunOutcome::Completed { .. })));
    assert_eq!(model.prompts_containing("场景规划甲 第1章"), 1);
    assert_eq!(model.prompts_containing("场景规划乙"), 0);
}

#[tokio::test(start_paused = true)]
async fn finished_runs_are_not_tracked_forever() {
    let model = Arc::new(MockLanguageModel::replying(FORTY_CHARS));
    let controller = controller_with(model, PromptRegistry::new().expect("built-in prompts"));

    for _ in 0..3 {
        let run = controller.submit(payload(1, 5)).await.expect("submit");
        assert_eq!(controller.tracked_runs(), 1);
        let (_, outcome) = drain(run).await;
        assert!(matches!(outcome, Ok(RunOutcome::Completed { .. })));
    }
    assert_eq!(controller.list().await.expect("list").len(), 3);
}

#[tokio::test]
async fn result_helpers_refuse_unfinished_tasks() {
    let store = InMemoryCheckpointStore::new();
    let request = payload(2, 5).validate().expect("valid request");
    let task_id = store.create(request, 3).await.expect("create task");

    assert!(matches!(
        take_finished_result(&store, &task_id).await,
        Err(TaskError::NotFinished {
            phase: TaskPhase::Init,
            ..
        })
    ));
    assert!(store.get(&task_id).await.is_ok());

    store
        .set_status(&task_id, TaskPhase::Done, None)
        .await
        .expect("finish");
    let peeked = finished_result(&store, &task_id).await.expect("result");
    assert_eq!(peeked.phase, TaskPhase::Done);
    let taken = take_finished_result(&store, &task_id).await.expect("take");
    assert_eq!(taken, peeked);
    assert!(matches!(
        store.get(&task_id).await,
        Err(StoreError::NotFound(_))
    ));
}
