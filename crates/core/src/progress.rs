//! Structured progress events and the sinks the orchestrator pushes them into.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{Chapter, GenerationMode, IssueReport, TaskId, TaskProgress};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Processing,
    Completed,
    Error,
    Failed,
}

/// Why a stream ended with an `error` event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorReason {
    Aborted,
    Timeout,
    Paused,
    Store,
    Validation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub chapter_count: usize,
    pub total_words: usize,
    pub below_target: Vec<u32>,
    pub placeholders: Vec<u32>,
    pub average_score: f64,
    pub rewrite_attempts: u32,
}

impl BatchSummary {
    pub fn new(chapters: &[Chapter], report: &IssueReport, rewrite_attempts: u32) -> Self {
        Self {
            chapter_count: chapters.len(),
            total_words: chapters.iter().map(|c| c.word_count).sum(),
            below_target: chapters
                .iter()
                .filter(|c| c.below_target)
                .map(|c| c.order)
                .collect(),
            placeholders: chapters
                .iter()
                .filter(|c| c.is_placeholder())
                .map(|c| c.order)
                .collect(),
            average_score: report.average_score,
            rewrite_attempts,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "step",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ProgressEvent {
    Init {
        status: EventStatus,
        message: String,
        task_id: TaskId,
        mode: GenerationMode,
        total: u32,
        resumed_from: u32,
    },
    ChapterGenerating {
        status: EventStatus,
        message: String,
        order: u32,
        progress: TaskProgress,
    },
    ChapterCompleted {
        status: EventStatus,
        message: String,
        progress: TaskProgress,
        chapter: Chapter,
    },
    ChapterPlaceholder {
        status: EventStatus,
        message: String,
        progress: TaskProgress,
        order: u32,
        cause: String,
    },
    Scoring {
        status: EventStatus,
        message: String,
    },
    ScoreCompleted {
        status: EventStatus,
        message: String,
        report: IssueReport,
    },
    Rewriting {
        status: EventStatus,
        message: String,
        attempt: u32,
        max_attempts: u32,
        current_score: f64,
    },
    RewriteCompleted {
        status: EventStatus,
        message: String,
        attempt: u32,
        max_attempts: u32,
        report: IssueReport,
    },
    Fixing {
        status: EventStatus,
        message: String,
        orders: Vec<u32>,
    },
    FixCompleted {
        status: EventStatus,
        message: String,
        fixed: Vec<u32>,
        kept: bool,
        report: IssueReport,
    },
    AllCompleted {
        status: EventStatus,
        message: String,
        chapters: Vec<Chapter>,
        summary: BatchSummary,
        report: IssueReport,
    },
    QualityFailed {
        status: EventStatus,
        message: String,
        chapters: Vec<Chapter>,
        report: IssueReport,
    },
    Error {
        status: EventStatus,
        message: String,
        reason: ErrorReason,
    },
}

impl ProgressEvent {
    pub fn error(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self::Error {
            status: EventStatus::Error,
            message: message.into(),
            reason,
        }
    }

    pub fn step(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::ChapterGenerating { .. } => "chapter-generating",
            Self::ChapterCompleted { .. } => "chapter-completed",
            Self::ChapterPlaceholder { .. } => "chapter-placeholder",
            Self::Scoring { .. } => "scoring",
            Self::ScoreCompleted { .. } => "score-completed",
            Self::Rewriting { .. } => "rewriting",
            Self::RewriteCompleted { .. } => "rewrite-completed",
            Self::Fixing { .. } => "fixing",
            Self::FixCompleted { .. } => "fix-completed",
            Self::AllCompleted { .. } => "all-completed",
            Self::QualityFailed { .. } => "quality-failed",
            Self::Error { .. } => "error",
        }
    }

    pub fn status(&self) -> EventStatus {
        match self {
            Self::Init { status, .. }
            | Self::ChapterGenerating { status, .. }
            | Self::ChapterCompleted { status, .. }
            | Self::ChapterPlaceholder { status, .. }
            | Self::Scoring { status, .. }
            | Self::ScoreCompleted { status, .. }
            | Self::Rewriting { status, .. }
            | Self::RewriteCompleted { status, .. }
            | Self::Fixing { status, .. }
            | Self::FixCompleted { status, .. }
            | Self::AllCompleted { status, .. }
            | Self::QualityFailed { status, .. }
            | Self::Error { status, .. } => *status,
        }
    }

    /// A stream ends with exactly one terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AllCompleted { .. } | Self::QualityFailed { .. } | Self::Error { .. }
        )
    }
}

#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct NullProgressReporter;

#[async_trait]
impl ProgressReporter for NullProgressReporter {
    async fn report(&self, _event: ProgressEvent) {}
}

/// Producer half of a bounded queue; the transport adapter owns the
/// receiver. A full queue suspends the orchestrator until the consumer
/// catches up.
#[derive(Clone, Debug)]
pub struct ChannelProgressReporter {
    sender: mpsc::Sender<ProgressEvent>,
}

impl ChannelProgressReporter {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ProgressReporter for ChannelProgressReporter {
    async fn report(&self, event: ProgressEvent) {
        if let Err(err) = self.sender.send(event).await {
            log::debug!("进度接收端已关闭，丢弃事件 {}", err.0.step());
        }
    }
}

#[derive(Debug, Default)]
pub struct VecProgressReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl VecProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn steps(&self) -> Vec<&'static str> {
        self.events().iter().map(ProgressEvent::step).collect()
    }
}

#[async_trait]
impl ProgressReporter for VecProgressReporter {
    async fn report(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
