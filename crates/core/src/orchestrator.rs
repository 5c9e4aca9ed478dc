//! Drives one task from its checkpoint to exactly one terminal event.

use async_trait::async_trait;
use thiserror::Error;

use crate::chapter::{ChapterContext, ChapterError, ChapterGenerator, RewriteBrief};
use crate::checkpoint::{PartialResult, StoreError, TaskCheckpointStore};
use crate::config::PipelineConfig;
use crate::invoker::{Invoker, RetryPolicy};
use crate::language_model::{InvokeOptions, LanguageModel};
use crate::length::LengthEnforcer;
use crate::logging::{LogLevel, LogRecord, LogSink, TaskLogSink};
use crate::model::{
    Chapter, GenerationMode, GenerationRequest, IssueReport, TaskPhase, TaskProgress, Violation,
};
use crate::progress::{BatchSummary, ErrorReason, EventStatus, ProgressEvent, ProgressReporter};
use crate::prompts::PromptRegistry;
use crate::rewrite::{rewrite_until_passing, ChapterRewriter, RewriteObserver, RewritePass};
use crate::scoring::{BatchScorer, HeuristicScorer};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("第{order}章生成失败，批次终止: {source}")]
    Aborted {
        order: u32,
        #[source]
        source: ChapterError,
    },
    #[error("批次运行超过时限（{minutes}分钟）")]
    Timeout { minutes: u64 },
    #[error("检查点存储失败: {0}")]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            Self::Aborted { .. } => ErrorReason::Aborted,
            Self::Timeout { .. } => ErrorReason::Timeout,
            Self::Store(_) => ErrorReason::Store,
        }
    }
}

/// How a run ended when it did not error.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Completed {
        chapters: Vec<Chapter>,
        report: IssueReport,
        summary: BatchSummary,
    },
    /// Delivered only as "failed, manual fix available".
    QualityFailed {
        chapters: Vec<Chapter>,
        report: IssueReport,
    },
    Paused {
        completed: u32,
    },
}

pub struct BatchOrchestrator<'a> {
    model: &'a dyn LanguageModel,
    store: &'a dyn TaskCheckpointStore,
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    config: PipelineConfig,
}

/// Per-run collaborators, built once the task id is known.
struct Pipeline<'p> {
    generator: ChapterGenerator<'p>,
    scorer: HeuristicScorer,
    sink: &'p dyn LogSink,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        model: &'a dyn LanguageModel,
        store: &'a dyn TaskCheckpointStore,
        prompts: &'a PromptRegistry,
        sink: &'a dyn LogSink,
        config: PipelineConfig,
    ) -> Self {
        Self {
            model,
            store,
            prompts,
            sink,
            config,
        }
    }

    /// Runs the task under the configured wall-clock deadline. Errors have
    /// already been checkpointed and reported when this returns.
    pub async fn run(
        &self,
        task_id: &str,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunOutcome, OrchestratorError> {
        let deadline = self.config.deadline();
        let result = match tokio::time::timeout(deadline, self.run_inner(task_id, reporter)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout {
                minutes: deadline.as_secs() / 60,
            }),
        };

        if let Err(err) = &result {
            self.fail(task_id, reporter, err).await;
        }
        result
    }

    async fn fail(&self, task_id: &str, reporter: &dyn ProgressReporter, err: &OrchestratorError) {
        let sink = TaskLogSink::new(self.sink, task_id);
        sink.log(LogRecord::new(LogLevel::Error, format!("任务失败：{err}")));
        if let Err(store_err) = self
            .store
            .set_status(task_id, TaskPhase::Failed, Some(err.to_string()))
            .await
        {
            sink.log(LogRecord::new(
                LogLevel::Error,
                format!("记录失败状态时出错：{store_err}"),
            ));
        }
        reporter
            .report(ProgressEvent::error(err.reason(), err.to_string()))
            .await;
    }

    async fn run_inner(
        &self,
        task_id: &str,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunOutcome, OrchestratorError> {
        let state = self.store.get(task_id).await?;
        let request = &state.request;

        let sink = TaskLogSink::new(self.sink, task_id);
        let invoker = Invoker::new(self.model, RetryPolicy::from(&self.config), &sink);
        let options = InvokeOptions::with_temperature(self.config.temperature);
        let enforcer = LengthEnforcer::new(
            &invoker,
            self.prompts,
            &sink,
            options,
            self.config.supplement_cap,
        );
        let pipeline = Pipeline {
            generator: ChapterGenerator::new(
                &invoker,
                &enforcer,
                self.prompts,
                &sink,
                options,
                self.config.max_supplements,
            ),
            scorer: HeuristicScorer::from_config(&self.config),
            sink: &sink,
        };

        let resumed_from = state.chapters.len() as u32;
        reporter
            .report(ProgressEvent::Init {
                status: EventStatus::Processing,
                message: match request.mode {
                    GenerationMode::Fresh if resumed_from > 0 => {
                        format!("从第{}章继续生成", resumed_from + 1)
                    }
                    GenerationMode::Fresh => "开始生成章节".to_string(),
                    GenerationMode::Fix => "开始修复章节".to_string(),
                },
                task_id: task_id.to_string(),
                mode: request.mode,
                total: request.chapter_count,
                resumed_from,
            })
            .await;

        match request.mode {
            GenerationMode::Fresh => {
                self.run_fresh(
                    task_id,
                    request,
                    state.chapters.clone(),
                    state.max_attempts,
                    &pipeline,
                    reporter,
                )
                .await
            }
            GenerationMode::Fix => {
                self.run_fix(task_id, request, state.chapters.clone(), &pipeline, reporter)
                    .await
            }
        }
    }

    async fn run_fresh(
        &self,
        task_id: &str,
        request: &GenerationRequest,
        mut chapters: Vec<Chapter>,
        max_attempts: u32,
        pipeline: &Pipeline<'_>,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunOutcome, OrchestratorError> {
        let total = request.chapter_count;
        if (chapters.len() as u32) < total {
            self.store
                .set_status(task_id, TaskPhase::Generating, None)
                .await?;
        }

        for index in chapters.len() as u32..total {
            if self.store.get(task_id).await?.paused {
                pipeline.log(LogLevel::Info, format!("任务已暂停，停在第{}章之前", index + 1));
                reporter
                    .report(ProgressEvent::error(
                        ErrorReason::Paused,
                        format!("任务已暂停，已完成{index}/{total}章"),
                    ))
                    .await;
                return Ok(RunOutcome::Paused { completed: index });
            }

            let order = index + 1;
            reporter
                .report(ProgressEvent::ChapterGenerating {
                    status: EventStatus::Processing,
                    message: format!("正在生成第{order}章"),
                    order,
                    progress: TaskProgress::new(index, total),
                })
                .await;

            let context = ChapterContext::build(
                request,
                chapters.last(),
                order,
                self.config.context_entries,
                self.config.previous_tail_chars,
            );
            let progress = TaskProgress::new(order, total);
            match pipeline.generator.generate(index, &context).await {
                Ok(chapter) => {
                    chapters.push(chapter.clone());
                    self.checkpoint_chapters(task_id, &chapters, progress).await?;
                    reporter
                        .report(ProgressEvent::ChapterCompleted {
                            status: EventStatus::Completed,
                            message: format!("第{order}章完成，共{}字", chapter.word_count),
                            progress,
                            chapter,
                        })
                        .await;
                }
                Err(source) if index < self.config.abort_threshold => {
                    return Err(OrchestratorError::Aborted { order, source });
                }
                Err(source) => {
                    pipeline.log(
                        LogLevel::Warn,
                        format!("第{order}章生成失败，以占位章节代替：{source}"),
                    );
                    chapters.push(Chapter::placeholder(order, context.outline_fragment.clone()));
                    self.checkpoint_chapters(task_id, &chapters, progress).await?;
                    reporter
                        .report(ProgressEvent::ChapterPlaceholder {
                            status: EventStatus::Error,
                            message: format!("第{order}章生成失败，已插入占位章节"),
                            progress,
                            order,
                            cause: source.to_string(),
                        })
                        .await;
                }
            }
        }

        let mut report = self.score(task_id, &chapters, pipeline, reporter).await?;
        let mut rewrite_attempts = 0;

        if !report.passes_threshold {
            self.store
                .set_status(task_id, TaskPhase::Rewriting, None)
                .await?;
            let rewriter = GeneratorRewriter {
                generator: &pipeline.generator,
                request,
                config: &self.config,
                sink: pipeline.sink,
            };
            let mut observer = CheckpointObserver {
                store: self.store,
                reporter,
                task_id,
            };
            let outcome = rewrite_until_passing(
                chapters,
                &pipeline.scorer,
                &rewriter,
                max_attempts,
                &mut observer,
            )
            .await?;

            chapters = outcome.chapters;
            report = outcome.report;
            rewrite_attempts = outcome.attempts;
            if !outcome.succeeded {
                return self
                    .quality_failed(task_id, chapters, report, reporter)
                    .await;
            }
        }

        let targets: Vec<u32> = chapters
            .iter()
            .filter(|c| !c.is_placeholder() && report.has_errors_for(c.order))
            .map(|c| c.order)
            .collect();
        if !targets.is_empty() {
            self.store.set_status(task_id, TaskPhase::Fixing, None).await?;
            reporter
                .report(ProgressEvent::Fixing {
                    status: EventStatus::Processing,
                    message: format!("自动修复{}个仍有严重问题的章节", targets.len()),
                    orders: targets.clone(),
                })
                .await;

            let (candidate, fixed) = self
                .fix_chapters(&chapters, &report, &targets, request.target_word_count, pipeline)
                .await;
            let candidate_report = pipeline.scorer.score(&candidate);
            let kept = candidate_report.passes_threshold;
            if kept {
                chapters = candidate;
                report = candidate_report;
                self.store
                    .apply_result(
                        task_id,
                        PartialResult {
                            chapters: Some(chapters.clone()),
                            last_score: Some(report.clone()),
                            attempt: None,
                        },
                    )
                    .await?;
            } else {
                pipeline.log(LogLevel::Warn, "修复后的批次未通过质量门，保留修复前版本");
            }
            reporter
                .report(ProgressEvent::FixCompleted {
                    status: EventStatus::Completed,
                    message: if kept {
                        format!("已修复{}章", fixed.len())
                    } else {
                        "修复结果未采用".to_string()
                    },
                    fixed,
                    kept,
                    report: report.clone(),
                })
                .await;
        }

        self.complete(task_id, chapters, report, rewrite_attempts, reporter)
            .await
    }

    async fn run_fix(
        &self,
        task_id: &str,
        request: &GenerationRequest,
        chapters: Vec<Chapter>,
        pipeline: &Pipeline<'_>,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunOutcome, OrchestratorError> {
        let targets: Vec<u32> = if request.chapters_to_fix.is_empty() {
            chapters.iter().map(|c| c.order).collect()
        } else {
            request.chapters_to_fix.clone()
        };

        self.store.set_status(task_id, TaskPhase::Fixing, None).await?;
        reporter
            .report(ProgressEvent::Fixing {
                status: EventStatus::Processing,
                message: format!("修复{}个章节", targets.len()),
                orders: targets.clone(),
            })
            .await;

        let before = pipeline.scorer.score(&chapters);
        let (chapters, fixed) = self
            .fix_chapters(&chapters, &before, &targets, request.target_word_count, pipeline)
            .await;
        self.checkpoint_chapters(
            task_id,
            &chapters,
            TaskProgress::new(chapters.len() as u32, chapters.len() as u32),
        )
        .await?;
        let after = pipeline.scorer.score(&chapters);
        reporter
            .report(ProgressEvent::FixCompleted {
                status: EventStatus::Completed,
                message: format!("已修复{}/{}章", fixed.len(), targets.len()),
                fixed,
                kept: true,
                report: after,
            })
            .await;

        let report = self.score(task_id, &chapters, pipeline, reporter).await?;
        if report.passes_threshold {
            self.complete(task_id, chapters, report, 0, reporter).await
        } else {
            self.quality_failed(task_id, chapters, report, reporter)
                .await
        }
    }

    async fn score(
        &self,
        task_id: &str,
        chapters: &[Chapter],
        pipeline: &Pipeline<'_>,
        reporter: &dyn ProgressReporter,
    ) -> Result<IssueReport, OrchestratorError> {
        self.store.set_status(task_id, TaskPhase::Scoring, None).await?;
        reporter
            .report(ProgressEvent::Scoring {
                status: EventStatus::Processing,
                message: format!("正在评估{}章", chapters.len()),
            })
            .await;

        let report = pipeline.scorer.score(chapters);
        self.store
            .apply_result(task_id, PartialResult::score(report.clone()))
            .await?;
        pipeline.log(
            LogLevel::Info,
            format!(
                "评分完成：平均分{:.1}，问题{}处，{}",
                report.average_score,
                report.violations.len(),
                if report.passes_threshold { "通过" } else { "未通过" }
            ),
        );
        reporter
            .report(ProgressEvent::ScoreCompleted {
                status: EventStatus::Completed,
                message: format!("平均分 {:.1}", report.average_score),
                report: report.clone(),
            })
            .await;
        Ok(report)
    }

    /// One fix call per targeted chapter. Failed calls keep the chapter.
    async fn fix_chapters(
        &self,
        chapters: &[Chapter],
        report: &IssueReport,
        targets: &[u32],
        target_word_count: u32,
        pipeline: &Pipeline<'_>,
    ) -> (Vec<Chapter>, Vec<u32>) {
        let mut fixed = Vec::new();
        let mut result = Vec::with_capacity(chapters.len());
        for chapter in chapters {
            if !targets.contains(&chapter.order) {
                result.push(chapter.clone());
                continue;
            }
            let issues: Vec<&Violation> = report.violations_for(chapter.order).collect();
            match pipeline
                .generator
                .fix(chapter, &issues, target_word_count)
                .await
            {
                Ok(repaired) => {
                    fixed.push(chapter.order);
                    result.push(repaired);
                }
                Err(err) => {
                    pipeline.log(LogLevel::Warn, format!("修复失败，保留原文：{err}"));
                    result.push(chapter.clone());
                }
            }
        }
        (result, fixed)
    }

    async fn checkpoint_chapters(
        &self,
        task_id: &str,
        chapters: &[Chapter],
        progress: TaskProgress,
    ) -> Result<(), OrchestratorError> {
        self.store
            .apply_result(task_id, PartialResult::chapters(chapters.to_vec()))
            .await?;
        self.store.apply_progress(task_id, progress).await?;
        Ok(())
    }

    async fn complete(
        &self,
        task_id: &str,
        chapters: Vec<Chapter>,
        report: IssueReport,
        rewrite_attempts: u32,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunOutcome, OrchestratorError> {
        self.store.set_status(task_id, TaskPhase::Done, None).await?;
        let summary = BatchSummary::new(&chapters, &report, rewrite_attempts);
        let mut message = format!(
            "全部完成：{}章，共{}字，平均分{:.1}",
            summary.chapter_count, summary.total_words, summary.average_score
        );
        if !summary.below_target.is_empty() {
            message.push_str(&format!("；{}章篇幅不足", summary.below_target.len()));
        }
        if !summary.placeholders.is_empty() {
            message.push_str(&format!("；{}章待补写", summary.placeholders.len()));
        }

        reporter
            .report(ProgressEvent::AllCompleted {
                status: EventStatus::Completed,
                message,
                chapters: chapters.clone(),
                summary: summary.clone(),
                report: report.clone(),
            })
            .await;
        Ok(RunOutcome::Completed {
            chapters,
            report,
            summary,
        })
    }

    async fn quality_failed(
        &self,
        task_id: &str,
        chapters: Vec<Chapter>,
        report: IssueReport,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunOutcome, OrchestratorError> {
        let message = format!(
            "质量门未通过：平均分{:.1}，可手动修复后重试",
            report.average_score
        );
        self.store
            .apply_result(
                task_id,
                PartialResult {
                    chapters: Some(chapters.clone()),
                    last_score: Some(report.clone()),
                    attempt: None,
                },
            )
            .await?;
        self.store
            .set_status(task_id, TaskPhase::Failed, Some(message.clone()))
            .await?;
        reporter
            .report(ProgressEvent::QualityFailed {
                status: EventStatus::Failed,
                message,
                chapters: chapters.clone(),
                report: report.clone(),
            })
            .await;
        Ok(RunOutcome::QualityFailed { chapters, report })
    }
}

impl Pipeline<'_> {
    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

struct GeneratorRewriter<'g> {
    generator: &'g ChapterGenerator<'g>,
    request: &'g GenerationRequest,
    config: &'g PipelineConfig,
    sink: &'g dyn LogSink,
}

#[async_trait]
impl<'g> ChapterRewriter for GeneratorRewriter<'g> {
    async fn rewrite(
        &self,
        chapter: &Chapter,
        previous: Option<&Chapter>,
        pass: RewritePass<'_>,
    ) -> Chapter {
        let context = ChapterContext::build(
            self.request,
            previous,
            chapter.order,
            self.config.context_entries,
            self.config.previous_tail_chars,
        );
        let brief = RewriteBrief {
            current_score: pass.report.average_score,
            attempt: pass.attempt,
            max_attempts: pass.max_attempts,
            issues: pass.report.violations_for(chapter.order).collect(),
        };
        match self.generator.rewrite(chapter, &brief, &context).await {
            Ok(rewritten) => rewritten,
            Err(err) => {
                self.sink.log(LogRecord::new(
                    LogLevel::Warn,
                    format!("第{}章重写失败，保留原文：{err}", chapter.order),
                ));
                chapter.clone()
            }
        }
    }
}

/// Checkpoints and reports every rewrite pass.
struct CheckpointObserver<'o> {
    store: &'o dyn TaskCheckpointStore,
    reporter: &'o dyn ProgressReporter,
    task_id: &'o str,
}

#[async_trait]
impl<'o> RewriteObserver for CheckpointObserver<'o> {
    type Error = StoreError;

    async fn pass_started(&mut self, pass: RewritePass<'_>) -> Result<(), StoreError> {
        self.reporter
            .report(ProgressEvent::Rewriting {
                status: EventStatus::Processing,
                message: format!(
                    "平均分{:.1}未达标，第{}/{}次整批重写",
                    pass.report.average_score, pass.attempt, pass.max_attempts
                ),
                attempt: pass.attempt,
                max_attempts: pass.max_attempts,
                current_score: pass.report.average_score,
            })
            .await;
        Ok(())
    }

    async fn pass_finished(
        &mut self,
        pass: RewritePass<'_>,
        chapters: &[Chapter],
        report: &IssueReport,
    ) -> Result<(), StoreError> {
        self.store
            .apply_result(
                self.task_id,
                PartialResult {
                    chapters: Some(chapters.to_vec()),
                    last_score: Some(report.clone()),
                    attempt: Some(pass.attempt),
                },
            )
            .await?;
        self.reporter
            .report(ProgressEvent::RewriteCompleted {
                status: EventStatus::Completed,
                message: format!(
                    "第{}次重写完成，平均分{:.1}",
                    pass.attempt, report.average_score
                ),
                attempt: pass.attempt,
                max_attempts: pass.max_attempts,
                report: report.clone(),
            })
            .await;
        Ok(())
    }
}
