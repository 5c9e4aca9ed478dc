use std::fmt;

use thiserror::Error;

use crate::invoker::{InvokeError, Invoker};
use crate::language_model::InvokeOptions;
use crate::length::{LengthEnforcer, SupplementTarget};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::{Chapter, ChapterStatus, Violation};
use crate::prompts::{PromptError, PromptKey, PromptRegistry};
use crate::text::truncate_chars;

mod context;

pub use context::{outline_fragment, ChapterContext};

const MAX_LISTED_ISSUES: usize = 20;
const REWRITE_SOURCE_MAX_CHARS: usize = 6_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChapterStage {
    SceneOutline,
    Draft,
    Rewrite,
    Fix,
}

impl ChapterStage {
    fn label(&self) -> &'static str {
        match self {
            Self::SceneOutline => "场景大纲",
            Self::Draft => "章节正文",
            Self::Rewrite => "章节重写",
            Self::Fix => "章节修复",
        }
    }
}

impl fmt::Display for ChapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ChapterError {
    #[error("渲染第{chapter}章{stage}提示词失败: {source}")]
    Prompt {
        chapter: u32,
        stage: ChapterStage,
        #[source]
        source: PromptError,
    },
    #[error("第{chapter}章{stage}调用失败: {source}")]
    Invoke {
        chapter: u32,
        stage: ChapterStage,
        #[source]
        source: InvokeError,
    },
}

/// What the rewrite prompt is told about the failed review.
#[derive(Clone, Debug)]
pub struct RewriteBrief<'r> {
    pub current_score: f64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub issues: Vec<&'r Violation>,
}

pub struct ChapterGenerator<'a> {
    invoker: &'a Invoker<'a>,
    enforcer: &'a LengthEnforcer<'a>,
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    options: InvokeOptions,
    max_supplements: u32,
}

impl<'a> ChapterGenerator<'a> {
    pub fn new(
        invoker: &'a Invoker<'a>,
        enforcer: &'a LengthEnforcer<'a>,
        prompts: &'a PromptRegistry,
        sink: &'a dyn LogSink,
        options: InvokeOptions,
        max_supplements: u32,
    ) -> Self {
        Self {
            invoker,
            enforcer,
            prompts,
            sink,
            options,
            max_supplements,
        }
    }

    /// Scene outline, then prose, then length enforcement. A failed scene
    /// outline degrades to the raw outline fragment; a failed prose call is a
    /// chapter failure.
    pub async fn generate(
        &self,
        chapter_index: u32,
        context: &ChapterContext<'_>,
    ) -> Result<Chapter, ChapterError> {
        let number = chapter_index + 1;

        let outline_prompt = self
            .prompts
            .format_with(
                PromptKey::SceneOutline,
                [
                    ("chapter_number", number.to_string()),
                    ("chapter_count", context.chapter_count.to_string()),
                    ("outline", context.outline.to_string()),
                    ("outline_fragment", context.outline_fragment.clone()),
                    ("volumes", context.volumes_text()),
                    ("characters", context.characters_text()),
                    ("world_facts", context.world_facts_text()),
                ],
            )
            .map_err(|source| ChapterError::Prompt {
                chapter: number,
                stage: ChapterStage::SceneOutline,
                source,
            })?;

        let scene_outline = match self
            .invoker
            .call(&outline_prompt, &self.options, &format!("第{number}章场景大纲"))
            .await
        {
            Ok(text) => text,
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    format!("第{number}章场景大纲生成失败，改用原始大纲片段：{err}"),
                );
                context.outline_fragment.clone()
            }
        };
        let title = parse_title(&scene_outline).unwrap_or_else(|| format!("第{number}章"));

        let draft_prompt = self
            .prompts
            .format_with(
                PromptKey::ChapterDraft,
                [
                    ("chapter_number", number.to_string()),
                    ("chapter_title", title.clone()),
                    ("scene_outline", scene_outline.clone()),
                    ("previous_tail", context.previous_tail_text().to_string()),
                    ("characters", context.characters_text()),
                    ("world_facts", context.world_facts_text()),
                    ("target_word_count", context.target_word_count.to_string()),
                ],
            )
            .map_err(|source| ChapterError::Prompt {
                chapter: number,
                stage: ChapterStage::Draft,
                source,
            })?;

        self.log(LogLevel::Info, format!("调用模型生成第{number}章正文"));
        let draft = self
            .invoker
            .call(&draft_prompt, &self.options, &format!("第{number}章正文"))
            .await
            .map_err(|source| ChapterError::Invoke {
                chapter: number,
                stage: ChapterStage::Draft,
                source,
            })?;

        let mut chapter = Chapter::new(number, title, scene_outline);
        self.finish(&mut chapter, draft, context.target_word_count)
            .await;
        Ok(chapter)
    }

    /// Replaces the chapter's content with a full rewrite. Identity and
    /// order are kept.
    pub async fn rewrite(
        &self,
        chapter: &Chapter,
        brief: &RewriteBrief<'_>,
        context: &ChapterContext<'_>,
    ) -> Result<Chapter, ChapterError> {
        let number = chapter.order;
        let prompt = self
            .prompts
            .format_with(
                PromptKey::ChapterRewrite,
                [
                    ("chapter_number", number.to_string()),
                    ("chapter_title", chapter.title.clone()),
                    ("current_score", format!("{:.1}", brief.current_score)),
                    ("attempt", brief.attempt.to_string()),
                    ("max_attempts", brief.max_attempts.to_string()),
                    ("issues", format_issues(&brief.issues)),
                    ("scene_outline", chapter.outline.clone()),
                    ("previous_tail", context.previous_tail_text().to_string()),
                    (
                        "content",
                        truncate_chars(&chapter.content, REWRITE_SOURCE_MAX_CHARS).to_string(),
                    ),
                    ("target_word_count", context.target_word_count.to_string()),
                ],
            )
            .map_err(|source| ChapterError::Prompt {
                chapter: number,
                stage: ChapterStage::Rewrite,
                source,
            })?;

        let text = self
            .invoker
            .call(
                &prompt,
                &self.options,
                &format!("第{number}章重写#{}", brief.attempt),
            )
            .await
            .map_err(|source| ChapterError::Invoke {
                chapter: number,
                stage: ChapterStage::Rewrite,
                source,
            })?;

        let mut rewritten = chapter.clone();
        self.finish(&mut rewritten, text, context.target_word_count)
            .await;
        Ok(rewritten)
    }

    /// One targeted repair call for the listed violations.
    pub async fn fix(
        &self,
        chapter: &Chapter,
        issues: &[&Violation],
        target_word_count: u32,
    ) -> Result<Chapter, ChapterError> {
        let number = chapter.order;
        let issues_text = if issues.is_empty() {
            "- 整体润色：减少空洞形容词与套路化表达，保持情节不变".to_string()
        } else {
            format_issues(issues)
        };
        let prompt = self
            .prompts
            .format_with(
                PromptKey::ChapterFix,
                [
                    ("chapter_number", number.to_string()),
                    ("chapter_title", chapter.title.clone()),
                    ("issues", issues_text),
                    ("content", chapter.content.clone()),
                ],
            )
            .map_err(|source| ChapterError::Prompt {
                chapter: number,
                stage: ChapterStage::Fix,
                source,
            })?;

        let text = self
            .invoker
            .call(&prompt, &self.options, &format!("第{number}章修复"))
            .await
            .map_err(|source| ChapterError::Invoke {
                chapter: number,
                stage: ChapterStage::Fix,
                source,
            })?;

        let mut fixed = chapter.clone();
        fixed.set_content(text);
        fixed.status = ChapterStatus::Completed;
        fixed.below_target = fixed.word_count < target_word_count as usize;
        Ok(fixed)
    }

    async fn finish(&self, chapter: &mut Chapter, text: String, target_word_count: u32) {
        let target = SupplementTarget {
            chapter_number: chapter.order,
            chapter_title: &chapter.title,
        };
        let outcome = self
            .enforcer
            .ensure_length(target, text, target_word_count, self.max_supplements)
            .await;
        if outcome.below_target {
            self.log(
                LogLevel::Warn,
                format!(
                    "第{}章篇幅不足：{}/{}字（补写{}次）",
                    chapter.order,
                    outcome.actual_length,
                    target_word_count,
                    outcome.supplements_used
                ),
            );
        }
        chapter.set_content(outcome.text);
        chapter.supplement_attempts = outcome.supplements_used;
        chapter.below_target = outcome.below_target;
        chapter.status = ChapterStatus::Completed;
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

fn parse_title(scene_outline: &str) -> Option<String> {
    scene_outline.lines().find_map(|line| {
        let line = line.trim();
        ["标题：", "标题:", "Title:"]
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix))
            .map(|title| title.trim().trim_matches(['《', '》']).to_string())
            .filter(|title| !title.is_empty())
    })
}

pub(crate) fn format_issues(issues: &[&Violation]) -> String {
    let mut lines: Vec<String> = issues
        .iter()
        .take(MAX_LISTED_ISSUES)
        .map(|v| {
            format!(
                "- [{}] 第{}行：{}（建议：{}）",
                v.category, v.location, v.message, v.suggestion
            )
        })
        .collect();
    if issues.len() > MAX_LISTED_ISSUES {
        lines.push(format!("- ……另有{}处问题", issues.len() - MAX_LISTED_ISSUES));
    }
    if lines.is_empty() {
        lines.push("- 整体评分未达标，请提升文字质量".to_string());
    }
    lines.join("\n")
}
