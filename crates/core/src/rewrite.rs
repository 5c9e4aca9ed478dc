//! Bounded quality-gate retry over a whole chapter batch.
//!
//! `Scoring -> Done` when the gate passes, `Scoring -> Rewriting -> Scoring`
//! while attempts remain, `Scoring -> Failed` once the ceiling is reached.
//! Every rewrite pass regenerates every chapter and the whole batch is
//! re-scored afterwards.

use std::convert::Infallible;

use async_trait::async_trait;

use crate::model::{Chapter, IssueReport};
use crate::scoring::BatchScorer;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RewriteStep {
    Done,
    Rewrite { attempt: u32 },
    Failed,
}

#[derive(Clone, Copy, Debug)]
pub struct RewriteLoop {
    max_attempts: u32,
    attempt: u32,
}

impl RewriteLoop {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempt: 0,
        }
    }

    /// Rewrite passes started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The transition out of `Scoring` for a freshly computed report.
    pub fn next(&mut self, report: &IssueReport) -> RewriteStep {
        if report.passes_threshold {
            RewriteStep::Done
        } else if self.attempt < self.max_attempts {
            self.attempt += 1;
            RewriteStep::Rewrite {
                attempt: self.attempt,
            }
        } else {
            RewriteStep::Failed
        }
    }
}

/// What a rewriter is told about the pass it runs in.
#[derive(Clone, Copy, Debug)]
pub struct RewritePass<'r> {
    pub attempt: u32,
    pub max_attempts: u32,
    pub report: &'r IssueReport,
}

#[async_trait]
pub trait ChapterRewriter: Send + Sync {
    /// Produces the replacement for one chapter. `previous` is the already
    /// rewritten predecessor. Implementations keep the old chapter when they
    /// cannot produce a new one.
    async fn rewrite(
        &self,
        chapter: &Chapter,
        previous: Option<&Chapter>,
        pass: RewritePass<'_>,
    ) -> Chapter;
}

/// Hooks around each rewrite pass, used to checkpoint and report.
#[async_trait]
pub trait RewriteObserver: Send {
    type Error: Send;

    async fn pass_started(&mut self, pass: RewritePass<'_>) -> Result<(), Self::Error>;

    /// Called once the rewritten batch has been re-scored.
    async fn pass_finished(
        &mut self,
        pass: RewritePass<'_>,
        chapters: &[Chapter],
        report: &IssueReport,
    ) -> Result<(), Self::Error>;
}

#[derive(Debug, Default)]
pub struct NoopObserver;

#[async_trait]
impl RewriteObserver for NoopObserver {
    type Error = Infallible;

    async fn pass_started(&mut self, _pass: RewritePass<'_>) -> Result<(), Infallible> {
        Ok(())
    }

    async fn pass_finished(
        &mut self,
        _pass: RewritePass<'_>,
        _chapters: &[Chapter],
        _report: &IssueReport,
    ) -> Result<(), Infallible> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RewriteOutcome {
    pub chapters: Vec<Chapter>,
    pub report: IssueReport,
    pub succeeded: bool,
    pub attempts: u32,
}

pub async fn rewrite_until_passing<O: RewriteObserver>(
    chapters: Vec<Chapter>,
    scorer: &dyn BatchScorer,
    rewriter: &dyn ChapterRewriter,
    max_attempts: u32,
    observer: &mut O,
) -> Result<RewriteOutcome, O::Error> {
    let mut state = RewriteLoop::new(max_attempts);
    let mut chapters = chapters;
    let mut report = scorer.score(&chapters);

    loop {
        match state.next(&report) {
            RewriteStep::Done => {
                return Ok(RewriteOutcome {
                    chapters,
                    report,
                    succeeded: true,
                    attempts: state.attempt(),
                })
            }
            RewriteStep::Failed => {
                return Ok(RewriteOutcome {
                    chapters,
                    report,
                    succeeded: false,
                    attempts: state.attempt(),
                })
            }
            RewriteStep::Rewrite { attempt } => {
                let pass = RewritePass {
                    attempt,
                    max_attempts,
                    report: &report,
                };
                observer.pass_started(pass).await?;

                let mut rewritten: Vec<Chapter> = Vec::with_capacity(chapters.len());
                for chapter in &chapters {
                    let next = rewriter.rewrite(chapter, rewritten.last(), pass).await;
                    rewritten.push(next);
                }

                let rescored = scorer.score(&rewritten);
                observer.pass_finished(pass, &rewritten, &rescored).await?;
                chapters = rewritten;
                report = rescored;
            }
        }
    }
}
