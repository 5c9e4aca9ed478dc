use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::text::count_words;

pub type TaskId = String;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterStatus {
    #[default]
    Draft,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    pub order: u32,
    pub title: String,
    pub content: String,
    pub word_count: usize,
    /// Scene outline the prose was written from.
    #[serde(default)]
    pub outline: String,
    #[serde(default)]
    pub status: ChapterStatus,
    #[serde(default)]
    pub supplement_attempts: u32,
    #[serde(default)]
    pub below_target: bool,
}

impl Chapter {
    pub fn new(order: u32, title: impl Into<String>, outline: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            order,
            title: title.into(),
            content: String::new(),
            word_count: 0,
            outline: outline.into(),
            status: ChapterStatus::Draft,
            supplement_attempts: 0,
            below_target: false,
        }
    }

    /// Stand-in for a chapter whose generation failed late in a batch.
    pub fn placeholder(order: u32, outline: impl Into<String>) -> Self {
        let mut chapter = Self::new(order, format!("第{order}章（待补写）"), outline);
        chapter.below_target = true;
        chapter
    }

    pub fn is_placeholder(&self) -> bool {
        self.status == ChapterStatus::Draft && self.content.trim().is_empty()
    }

    pub fn set_content(&mut self, content: String) {
        self.word_count = count_words(&content);
        self.content = content;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterRef {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRef {
    pub title: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    #[default]
    Fresh,
    Fix,
}

/// Validated, immutable input to one orchestrator run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub outline: String,
    pub chapter_count: u32,
    pub target_word_count: u32,
    #[serde(default)]
    pub characters: Vec<CharacterRef>,
    #[serde(default)]
    pub world_facts: Vec<FactRef>,
    #[serde(default)]
    pub volumes: Vec<VolumeRef>,
    #[serde(default)]
    pub existing_chapters: Vec<Chapter>,
    #[serde(default)]
    pub mode: GenerationMode,
    /// Chapter orders targeted by fix mode; empty means every chapter.
    #[serde(default)]
    pub chapters_to_fix: Vec<u32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationCategory {
    AdjectiveDensity,
    ConnectiveDensity,
    ClichePlot,
    RomanceDensity,
    GrowthAsGoal,
    DialogueLength,
    MetaNarration,
    RepeatedPunctuation,
    AbruptTransition,
    LongParagraph,
}

impl ViolationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdjectiveDensity => "adjective-density",
            Self::ConnectiveDensity => "connective-density",
            Self::ClichePlot => "cliche-plot",
            Self::RomanceDensity => "romance-density",
            Self::GrowthAsGoal => "growth-as-goal",
            Self::DialogueLength => "dialogue-length",
            Self::MetaNarration => "meta-narration",
            Self::RepeatedPunctuation => "repeated-punctuation",
            Self::AbruptTransition => "abrupt-transition",
            Self::LongParagraph => "long-paragraph",
        }
    }
}

impl fmt::Display for ViolationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub category: ViolationCategory,
    pub severity: Severity,
    pub chapter_order: u32,
    /// 1-based line within the chapter.
    pub location: usize,
    pub weight: i32,
    pub message: String,
    pub suggestion: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterScore {
    pub order: u32,
    pub penalty: i32,
    pub score: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueReport {
    pub violations: Vec<Violation>,
    /// Sum of violation weights; zero or negative.
    pub penalty_score: i32,
    pub average_score: f64,
    pub average_penalty: f64,
    pub passes_threshold: bool,
    #[serde(default)]
    pub chapter_scores: Vec<ChapterScore>,
}

impl IssueReport {
    pub fn violations_for(&self, order: u32) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(move |violation| violation.chapter_order == order)
    }

    pub fn has_errors_for(&self, order: u32) -> bool {
        self.violations_for(order)
            .any(|violation| violation.severity == Severity::Error)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    #[default]
    Init,
    Generating,
    Scoring,
    Rewriting,
    Fixing,
    Done,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Init => "init",
            Self::Generating => "generating",
            Self::Scoring => "scoring",
            Self::Rewriting => "rewriting",
            Self::Fixing => "fixing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub current: u32,
    pub total: u32,
    pub percentage: f64,
}

impl TaskProgress {
    pub fn new(current: u32, total: u32) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            (f64::from(current) / f64::from(total) * 1000.0).round() / 10.0
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub task_id: TaskId,
    pub phase: TaskPhase,
    pub attempt: u32,
    pub max_attempts: u32,
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub last_score: Option<IssueReport>,
    pub request: GenerationRequest,
    #[serde(default)]
    pub progress: TaskProgress,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
