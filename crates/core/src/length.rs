use crate::invoker::Invoker;
use crate::language_model::InvokeOptions;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{PromptKey, PromptRegistry};
use crate::text::{count_words, tail_chars};

const SUPPLEMENT_SEED_CHARS: usize = 600;

#[derive(Clone, Debug, PartialEq)]
pub struct LengthOutcome {
    pub text: String,
    pub actual_length: usize,
    pub supplements_used: u32,
    pub below_target: bool,
}

/// Identifies the chapter being topped up, for prompts and logs.
#[derive(Clone, Copy, Debug)]
pub struct SupplementTarget<'t> {
    pub chapter_number: u32,
    pub chapter_title: &'t str,
}

pub struct LengthEnforcer<'a> {
    invoker: &'a Invoker<'a>,
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    options: InvokeOptions,
    supplement_cap: u32,
}

impl<'a> LengthEnforcer<'a> {
    pub fn new(
        invoker: &'a Invoker<'a>,
        prompts: &'a PromptRegistry,
        sink: &'a dyn LogSink,
        options: InvokeOptions,
        supplement_cap: u32,
    ) -> Self {
        Self {
            invoker,
            prompts,
            sink,
            options,
            supplement_cap: supplement_cap.max(1),
        }
    }

    /// Size of the next supplement request: `min(deficit * 1.5, cap)`.
    pub fn supplement_size(&self, deficit: usize) -> u32 {
        let scaled = (deficit as u64).saturating_mul(3) / 2;
        scaled.min(u64::from(self.supplement_cap)) as u32
    }

    pub async fn ensure_length(
        &self,
        target: SupplementTarget<'_>,
        text: String,
        target_word_count: u32,
        max_supplements: u32,
    ) -> LengthOutcome {
        let target_len = target_word_count as usize;
        let mut text = text;
        let mut actual = count_words(&text);
        let mut used = 0u32;

        while actual < target_len && used < max_supplements {
            let deficit = target_len - actual;
            let size = self.supplement_size(deficit);
            used += 1;

            let prompt = match self.prompts.format_with(
                PromptKey::ChapterSupplement,
                [
                    ("chapter_number", target.chapter_number.to_string()),
                    ("chapter_title", target.chapter_title.to_string()),
                    ("supplement_size", size.to_string()),
                    ("target_word_count", target_word_count.to_string()),
                    ("tail", tail_chars(&text, SUPPLEMENT_SEED_CHARS).to_string()),
                ],
            ) {
                Ok(prompt) => prompt,
                Err(err) => {
                    self.log(
                        LogLevel::Error,
                        format!("第{}章补写提示词渲染失败：{err}", target.chapter_number),
                    );
                    break;
                }
            };

            let label = format!("第{}章补写#{used}", target.chapter_number);
            match self.invoker.call(&prompt, &self.options, &label).await {
                Ok(extra) => {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&extra);
                    actual = count_words(&text);
                    self.log(
                        LogLevel::Info,
                        format!(
                            "第{}章补写第{used}次完成，当前{actual}/{target_len}字",
                            target.chapter_number
                        ),
                    );
                }
                Err(err) => {
                    self.log(
                        LogLevel::Warn,
                        format!("第{}章补写失败，停止补写：{err}", target.chapter_number),
                    );
                    break;
                }
            }
        }

        LengthOutcome {
            below_target: actual < target_len,
            text,
            actual_length: actual,
            supplements_used: used,
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::RetryPolicy;
    use crate::language_model::{LanguageModel, LanguageModelError};
    use crate::logging::NullLogSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        reply: Option<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for Echo {
        async fn invoke(
            &self,
            _prompt: &str,
            _options: &InvokeOptions,
        ) -> Result<String, LanguageModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(str::to_string)
                .ok_or_else(|| LanguageModelError::msg("backend down"))
        }
    }

    const TARGET: SupplementTarget<'static> = SupplementTarget {
        chapter_number: 1,
        chapter_title: "序章",
    };

    #[test]
    fn supplement_size_is_capped() {
        let prompts = PromptRegistry::new().unwrap();
        let model = Echo {
            reply: None,
            calls: AtomicUsize::new(0),
        };
        let invoker = Invoker::new(&model, RetryPolicy::default(), &NullLogSink);
        let enforcer =
            LengthEnforcer::new(&invoker, &prompts, &NullLogSink, InvokeOptions::default(), 2_000);
        assert_eq!(enforcer.supplement_size(100), 150);
        assert_eq!(enforcer.supplement_size(5_000), 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn met_target_is_a_no_op() {
        let prompts = PromptRegistry::new().unwrap();
        let model = Echo {
            reply: Some("one two three four five six"),
            calls: AtomicUsize::new(0),
        };
        let invoker = Invoker::new(&model, RetryPolicy::default(), &NullLogSink);
        let enforcer =
            LengthEnforcer::new(&invoker, &prompts, &NullLogSink, InvokeOptions::default(), 2_000);

        let outcome = enforcer
            .ensure_length(TARGET, "alpha beta gamma".to_string(), 3, 3)
            .await;
        assert_eq!(outcome.supplements_used, 0);
        assert!(!outcome.below_target);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_budget_and_flags_deficit() {
        let prompts = PromptRegistry::new().unwrap();
        let model = Echo {
            reply: Some("one two three four five six"),
            calls: AtomicUsize::new(0),
        };
        let invoker = Invoker::new(&model, RetryPolicy::default(), &NullLogSink);
        let enforcer =
            LengthEnforcer::new(&invoker, &prompts, &NullLogSink, InvokeOptions::default(), 2_000);

        let outcome = enforcer
            .ensure_length(TARGET, "start".to_string(), 1_000, 3)
            .await;
        assert_eq!(outcome.supplements_used, 3);
        assert_eq!(outcome.actual_length, 1 + 3 * 6);
        assert!(outcome.below_target);
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn supplement_failure_returns_accumulated_text() {
        let prompts = PromptRegistry::new().unwrap();
        let model = Echo {
            reply: None,
            calls: AtomicUsize::new(0),
        };
        let invoker = Invoker::new(&model, RetryPolicy::default(), &NullLogSink);
        let enforcer =
            LengthEnforcer::new(&invoker, &prompts, &NullLogSink, InvokeOptions::default(), 2_000);

        let outcome = enforcer
            .ensure_length(TARGET, "only a few words".to_string(), 50, 3)
            .await;
        assert_eq!(outcome.text, "only a few words");
        assert_eq!(outcome.supplements_used, 1);
        assert!(outcome.below_target);
        // one supplement request, retried by the invoker
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }
}
