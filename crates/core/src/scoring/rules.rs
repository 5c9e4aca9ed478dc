//! The fixed rule table behind the heuristic scorer.
//!
//! Which rules are skippable in fast mode is part of the table, never
//! configuration.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{Severity, ViolationCategory};

static ADJECTIVES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)美丽|漂亮|绝美|璀璨|耀眼|深邃|精致|优雅|华丽|灿烂|无比|极其|非常|十分|异常|",
        r"\b(?:beautiful|gorgeous|stunning|magnificent|incredibly|extremely)\b",
    ))
    .expect("valid adjective regex")
});

static CONNECTIVES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)紧接着|然后|接着|随后|于是|\b(?:then|next|afterwards)\b")
        .expect("valid connective regex")
});

static CLICHE_PLOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"退婚|废柴|打脸|金手指|系统激活|重生回到|穿越到|叮！")
        .expect("valid cliche regex")
});

static ROMANCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)心跳加速|脸红|脸颊微红|心动|暧昧|拥抱|亲吻|深情|宠溺|",
        r"\b(?:kiss(?:ed)?|blush(?:ed)?|embrace[sd]?)\b",
    ))
    .expect("valid romance regex")
});

static GROWTH_AS_GOAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)变得更强|成长为|提升实力|突破境界|成为最强|\bbecome stronger\b")
        .expect("valid growth regex")
});

static META_NARRATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)作为一个AI|作为AI|以下是|本章完|\bas an ai\b")
        .expect("valid meta narration regex")
});

static DIALOGUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"“([^”]*)”|「([^」]*)」|"([^"]*)""#).expect("valid dialogue regex"));

static REPEATED_PUNCTUATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[！？!?]{3,}|[。，,]{2,}|\.{4,}").expect("valid punctuation regex")
});

static ABRUPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)突然|忽然|猛然|\bsuddenly\b").expect("valid transition regex")
});

const DIALOGUE_MAX_CHARS: usize = 150;
const PARAGRAPH_MAX_CHARS: usize = 600;

#[derive(Clone, Copy, Debug)]
pub(crate) enum Check {
    /// Any match on the line is a violation.
    Presence(&'static Lazy<Regex>),
    /// More than `max` matches on one line is a violation.
    Density {
        pattern: &'static Lazy<Regex>,
        max: usize,
    },
    /// Each quoted utterance longer than the limit is a violation.
    DialogueLength,
    LineLength,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Rule {
    pub category: ViolationCategory,
    pub severity: Severity,
    pub weight: i32,
    pub skippable: bool,
    pub check: Check,
    pub suggestion: &'static str,
}

pub(crate) static RULES: [Rule; 10] = [
    Rule {
        category: ViolationCategory::AdjectiveDensity,
        severity: Severity::Warning,
        weight: -3,
        skippable: false,
        check: Check::Density {
            pattern: &ADJECTIVES,
            max: 3,
        },
        suggestion: "用具体的动作和细节替代堆砌的形容词",
    },
    Rule {
        category: ViolationCategory::ConnectiveDensity,
        severity: Severity::Warning,
        weight: -3,
        skippable: false,
        check: Check::Density {
            pattern: &CONNECTIVES,
            max: 2,
        },
        suggestion: "减少流水账式的顺序连接词，让情节自然衔接",
    },
    Rule {
        category: ViolationCategory::ClichePlot,
        severity: Severity::Error,
        weight: -10,
        skippable: false,
        check: Check::Presence(&CLICHE_PLOT),
        suggestion: "替换为贴合人物动机的原创冲突",
    },
    Rule {
        category: ViolationCategory::RomanceDensity,
        severity: Severity::Warning,
        weight: -5,
        skippable: false,
        check: Check::Density {
            pattern: &ROMANCE,
            max: 2,
        },
        suggestion: "感情描写点到为止，以情节推动关系",
    },
    Rule {
        category: ViolationCategory::GrowthAsGoal,
        severity: Severity::Error,
        weight: -8,
        skippable: false,
        check: Check::Presence(&GROWTH_AS_GOAL),
        suggestion: "让人物追求具体目标，成长只是结果",
    },
    Rule {
        category: ViolationCategory::DialogueLength,
        severity: Severity::Warning,
        weight: -3,
        skippable: false,
        check: Check::DialogueLength,
        suggestion: "拆分长对白，穿插动作与反应",
    },
    Rule {
        category: ViolationCategory::MetaNarration,
        severity: Severity::Error,
        weight: -10,
        skippable: false,
        check: Check::Presence(&META_NARRATION),
        suggestion: "删除与故事无关的说明性文字",
    },
    Rule {
        category: ViolationCategory::RepeatedPunctuation,
        severity: Severity::Warning,
        weight: -1,
        skippable: true,
        check: Check::Presence(&REPEATED_PUNCTUATION),
        suggestion: "标点只保留一个",
    },
    Rule {
        category: ViolationCategory::AbruptTransition,
        severity: Severity::Warning,
        weight: -1,
        skippable: true,
        check: Check::Density {
            pattern: &ABRUPT,
            max: 1,
        },
        suggestion: "为转折铺垫，少用「突然」",
    },
    Rule {
        category: ViolationCategory::LongParagraph,
        severity: Severity::Warning,
        weight: -1,
        skippable: true,
        check: Check::LineLength,
        suggestion: "按场景或视角切分段落",
    },
];

/// One finding of one rule on one line, before it is tied to a chapter.
pub(crate) struct Finding {
    pub message: String,
}

impl Rule {
    pub(crate) fn check_line(&self, line: &str) -> Vec<Finding> {
        match self.check {
            Check::Presence(pattern) => {
                let markers: Vec<&str> = pattern.find_iter(line).map(|m| m.as_str()).collect();
                if markers.is_empty() {
                    Vec::new()
                } else {
                    vec![Finding {
                        message: format!("出现「{}」", markers.join("、")),
                    }]
                }
            }
            Check::Density { pattern, max } => {
                let count = pattern.find_iter(line).count();
                if count > max {
                    vec![Finding {
                        message: format!("单行出现{count}次（上限{max}）"),
                    }]
                } else {
                    Vec::new()
                }
            }
            Check::DialogueLength => DIALOGUE
                .captures_iter(line)
                .filter_map(|caps| {
                    let spoken = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3))?;
                    let length = spoken.as_str().chars().count();
                    (length > DIALOGUE_MAX_CHARS).then(|| Finding {
                        message: format!("对白长达{length}字（上限{DIALOGUE_MAX_CHARS}）"),
                    })
                })
                .collect(),
            Check::LineLength => {
                let length = line.chars().count();
                if length > PARAGRAPH_MAX_CHARS {
                    vec![Finding {
                        message: format!("段落长达{length}字（上限{PARAGRAPH_MAX_CHARS}）"),
                    }]
                } else {
                    Vec::new()
                }
            }
        }
    }
}
