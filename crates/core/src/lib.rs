pub mod chapter;
pub mod checkpoint;
pub mod config;
pub mod invoker;
pub mod language_model;
pub mod length;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod request;
pub mod rewrite;
pub mod scoring;
pub mod tasks;
pub mod text;

pub use chapter::{ChapterContext, ChapterError, ChapterGenerator, ChapterStage, RewriteBrief};
pub use checkpoint::{
    BlobCheckpointStore, BlobError, BlobStore, InMemoryCheckpointStore, MemoryBlobStore,
    PartialResult, StoreError, TaskCheckpointStore,
};
pub use config::{
    Config, ConfigError, ConfigStore, LlmConfig, PipelineConfig, PromptConfig, RecentUsage,
};
pub use invoker::{InvokeError, InvokeFailure, Invoker, RetryPolicy};
pub use language_model::{InvokeOptions, LanguageModel, LanguageModelError};
pub use length::{LengthEnforcer, LengthOutcome, SupplementTarget};
pub use logging::{
    FacadeLogSink, LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, TaskLogSink,
    VecLogSink,
};
pub use model::{
    Chapter, ChapterScore, ChapterStatus, CharacterRef, FactRef, GenerationMode,
    GenerationRequest, IssueReport, Severity, TaskId, TaskPhase, TaskProgress, TaskState,
    Violation, ViolationCategory, VolumeRef,
};
pub use orchestrator::{BatchOrchestrator, OrchestratorError, RunOutcome};
pub use progress::{
    BatchSummary, ChannelProgressReporter, ErrorReason, EventStatus, NullProgressReporter,
    ProgressEvent, ProgressReporter, VecProgressReporter,
};
pub use prompts::{
    PromptArguments, PromptError, PromptKey, PromptRegistry, PromptSource, PromptTemplate,
};
pub use request::{ExistingChapterPayload, GenerationRequestPayload, RequestError};
pub use rewrite::{
    rewrite_until_passing, ChapterRewriter, NoopObserver, RewriteLoop, RewriteObserver,
    RewriteOutcome, RewritePass, RewriteStep,
};
pub use scoring::{BatchScorer, HeuristicScorer, QualityGate};
pub use tasks::{
    finished_result, request_pause, take_finished_result, TaskController, TaskError, TaskResult,
    TaskRun,
};
pub use text::count_words;
