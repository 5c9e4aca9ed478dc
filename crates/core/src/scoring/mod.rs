//! Pure, deterministic quality scoring of a chapter batch.

use crate::config::PipelineConfig;
use crate::model::{Chapter, ChapterScore, IssueReport, Violation};

mod rules;

use rules::RULES;

/// Scores a whole batch. The rewrite loop only ever sees batches through
/// this seam.
pub trait BatchScorer: Send + Sync {
    fn score(&self, chapters: &[Chapter]) -> IssueReport;
}

/// Both legs are required independently: the average score must reach the
/// floor and the per-chapter penalty magnitude must stay under the ceiling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityGate {
    pub min_average_score: f64,
    pub max_average_penalty: f64,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_average_score: 80.0,
            max_average_penalty: 80.0,
        }
    }
}

impl From<&PipelineConfig> for QualityGate {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            min_average_score: config.min_average_score,
            max_average_penalty: config.max_average_penalty,
        }
    }
}

impl QualityGate {
    pub fn evaluate(&self, average_score: f64, average_penalty: f64) -> bool {
        average_score >= self.min_average_score && average_penalty.abs() < self.max_average_penalty
    }
}

#[derive(Clone, Debug, Default)]
pub struct HeuristicScorer {
    gate: QualityGate,
    fast: bool,
}

impl HeuristicScorer {
    pub fn new(gate: QualityGate) -> Self {
        Self { gate, fast: false }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(QualityGate::from(config)).with_fast_mode(config.fast_scoring)
    }

    /// Fast mode drops the skippable low-severity rules.
    pub fn with_fast_mode(mut self, fast: bool) -> Self {
        self.fast = fast;
        self
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn score_chapter(&self, chapter: &Chapter) -> Vec<Violation> {
        let mut violations = Vec::new();
        for (index, line) in chapter.content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            for rule in RULES.iter().filter(|rule| !(self.fast && rule.skippable)) {
                for finding in rule.check_line(line) {
                    violations.push(Violation {
                        category: rule.category,
                        severity: rule.severity,
                        chapter_order: chapter.order,
                        location: index + 1,
                        weight: rule.weight,
                        message: finding.message,
                        suggestion: rule.suggestion.to_string(),
                    });
                }
            }
        }
        violations
    }
}

impl BatchScorer for HeuristicScorer {
    fn score(&self, chapters: &[Chapter]) -> IssueReport {
        let mut violations = Vec::new();
        let mut chapter_scores = Vec::with_capacity(chapters.len());

        for chapter in chapters {
            let found = self.score_chapter(chapter);
            let penalty: i32 = found.iter().map(|v| v.weight).sum();
            chapter_scores.push(ChapterScore {
                order: chapter.order,
                penalty,
                score: 100.0 + f64::from(penalty),
            });
            violations.extend(found);
        }

        let penalty_score: i32 = violations.iter().map(|v| v.weight).sum();
        if chapters.is_empty() {
            return IssueReport {
                violations,
                penalty_score,
                average_score: 0.0,
                average_penalty: 0.0,
                passes_threshold: false,
                chapter_scores,
            };
        }

        let average_penalty = f64::from(penalty_score) / chapters.len() as f64;
        let average_score = 100.0 + average_penalty;
        IssueReport {
            passes_threshold: self.gate.evaluate(average_score, average_penalty),
            violations,
            penalty_score,
            average_score,
            average_penalty,
            chapter_scores,
        }
    }
}
