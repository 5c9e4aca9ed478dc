//! Inbound generation request: wire payload and its validation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    Chapter, ChapterStatus, CharacterRef, FactRef, GenerationMode, GenerationRequest, VolumeRef,
};

pub const MAX_CHAPTER_COUNT: i64 = 100;

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("章节数 {0} 超出范围 [1, {MAX_CHAPTER_COUNT}]")]
    ChapterCountOutOfRange(i64),
    #[error("目标字数必须为正数，实际为 {0}")]
    InvalidTargetWordCount(i64),
    #[error("大纲不能为空")]
    EmptyOutline,
    #[error("修复模式需要已有章节")]
    NothingToFix,
    #[error("待修复章节 {0} 不存在")]
    UnknownChapter(u32),
    #[error("已有章节数 {existing} 超过章节总数 {chapter_count}")]
    TooManyExistingChapters { existing: usize, chapter_count: i64 },
    #[error("请求格式错误: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingChapterPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub outline: String,
}

/// The request exactly as a client sends it. Numbers are signed so that
/// out-of-range values reach validation instead of failing to parse.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequestPayload {
    pub chapter_count: i64,
    pub target_word_count: i64,
    #[serde(default)]
    pub outline: String,
    #[serde(default)]
    pub characters: Vec<CharacterRef>,
    #[serde(default)]
    pub world_settings: Vec<FactRef>,
    #[serde(default)]
    pub existing_chapters: Vec<ExistingChapterPayload>,
    #[serde(default)]
    pub existing_volumes: Vec<VolumeRef>,
    #[serde(default)]
    pub fix_mode: bool,
    #[serde(default)]
    pub chapters_to_fix: Vec<u32>,
}

impl GenerationRequestPayload {
    pub fn from_json_str(input: &str) -> Result<Self, RequestError> {
        serde_json::from_str(input).map_err(|err| RequestError::Malformed(err.to_string()))
    }

    pub fn validate(self) -> Result<GenerationRequest, RequestError> {
        if !(1..=MAX_CHAPTER_COUNT).contains(&self.chapter_count) {
            return Err(RequestError::ChapterCountOutOfRange(self.chapter_count));
        }
        if self.target_word_count <= 0 || self.target_word_count > i64::from(u32::MAX) {
            return Err(RequestError::InvalidTargetWordCount(self.target_word_count));
        }
        let mode = if self.fix_mode {
            GenerationMode::Fix
        } else {
            GenerationMode::Fresh
        };
        if mode == GenerationMode::Fresh && self.outline.trim().is_empty() {
            return Err(RequestError::EmptyOutline);
        }
        if mode == GenerationMode::Fix && self.existing_chapters.is_empty() {
            return Err(RequestError::NothingToFix);
        }
        let existing = self.existing_chapters.len() as i64;
        if mode == GenerationMode::Fresh && existing > self.chapter_count {
            return Err(RequestError::TooManyExistingChapters {
                existing: self.existing_chapters.len(),
                chapter_count: self.chapter_count,
            });
        }

        let existing_chapters = normalize_chapters(self.existing_chapters);
        if let Some(unknown) = self
            .chapters_to_fix
            .iter()
            .find(|order| **order == 0 || **order as usize > existing_chapters.len())
        {
            return Err(RequestError::UnknownChapter(*unknown));
        }

        let mut chapters_to_fix = self.chapters_to_fix;
        chapters_to_fix.sort_unstable();
        chapters_to_fix.dedup();

        Ok(GenerationRequest {
            outline: self.outline,
            chapter_count: self.chapter_count as u32,
            target_word_count: self.target_word_count as u32,
            characters: self.characters,
            world_facts: self.world_settings,
            volumes: self.existing_volumes,
            existing_chapters,
            mode,
            chapters_to_fix,
        })
    }
}

/// Orders become dense 1..N in the given order, word counts are recomputed
/// and every chapter gets a unique id.
fn normalize_chapters(chapters: Vec<ExistingChapterPayload>) -> Vec<Chapter> {
    let mut seen = HashSet::new();
    chapters
        .into_iter()
        .enumerate()
        .map(|(index, payload)| {
            let order = index as u32 + 1;
            let title = if payload.title.trim().is_empty() {
                format!("第{order}章")
            } else {
                payload.title
            };
            let mut chapter = Chapter::new(order, title, payload.outline);
            if let Some(id) = payload.id.filter(|id| !id.trim().is_empty()) {
                if seen.insert(id.clone()) {
                    chapter.id = id;
                }
            }
            if !payload.content.trim().is_empty() {
                chapter.status = ChapterStatus::Completed;
            }
            chapter.set_content(payload.content);
            chapter
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> GenerationRequestPayload {
        GenerationRequestPayload {
            chapter_count: 3,
            target_word_count: 100,
            outline: "少年离乡，踏上旅途".into(),
            ..GenerationRequestPayload::default()
        }
    }

    #[test]
    fn parses_camel_case_json() {
        let json = r#"{
            "chapterCount": 2,
            "targetWordCount": 3000,
            "outline": "第1章 出发\n第2章 归来",
            "characters": [{ "name": "林舟", "description": "少年剑客" }],
            "worldSettings": [{ "name": "青岚宗", "content": "山门" }],
            "existingVolumes": [{ "title": "卷一" }],
            "fixMode": false
        }"#;
        let request = GenerationRequestPayload::from_json_str(json)
            .unwrap()
            .validate()
            .unwrap();
        assert_eq!(request.chapter_count, 2);
        assert_eq!(request.characters[0].name, "林舟");
        assert_eq!(request.world_facts[0].name, "青岚宗");
        assert_eq!(request.volumes.len(), 1);
        assert_eq!(request.mode, GenerationMode::Fresh);
    }

    #[test]
    fn chapter_count_is_bounded() {
        for count in [0, -1, 101] {
            let result = GenerationRequestPayload {
                chapter_count: count,
                ..payload()
            }
            .validate();
            assert_eq!(result, Err(RequestError::ChapterCountOutOfRange(count)));
        }
        assert!(GenerationRequestPayload {
            chapter_count: 100,
            ..payload()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn rejects_missing_outline_and_zero_target() {
        let empty = GenerationRequestPayload {
            outline: "  ".into(),
            ..payload()
        };
        assert_eq!(empty.validate(), Err(RequestError::EmptyOutline));

        let zero = GenerationRequestPayload {
            target_word_count: 0,
            ..payload()
        };
        assert_eq!(zero.validate(), Err(RequestError::InvalidTargetWordCount(0)));
    }

    #[test]
    fn fix_mode_needs_known_chapters() {
        let nothing = GenerationRequestPayload {
            fix_mode: true,
            ..payload()
        };
        assert_eq!(nothing.validate(), Err(RequestError::NothingToFix));

        let unknown = GenerationRequestPayload {
            fix_mode: true,
            outline: String::new(),
            existing_chapters: vec![ExistingChapterPayload {
                content: "正文".into(),
                ..ExistingChapterPayload::default()
            }],
            chapters_to_fix: vec![2],
            ..payload()
        };
        assert_eq!(unknown.validate(), Err(RequestError::UnknownChapter(2)));
    }

    #[test]
    fn existing_chapters_are_normalized() {
        let request = GenerationRequestPayload {
            existing_chapters: vec![
                ExistingChapterPayload {
                    id: Some("a".into()),
                    content: "夜色渐深".into(),
                    ..ExistingChapterPayload::default()
                },
                ExistingChapterPayload {
                    id: Some("a".into()),
                    title: "重逢".into(),
                    content: "one two".into(),
                    ..ExistingChapterPayload::default()
                },
            ],
            ..payload()
        }
        .validate()
        .unwrap();

        let chapters = &request.existing_chapters;
        assert_eq!(chapters[0].id, "a");
        assert_ne!(chapters[1].id, "a");
        assert_eq!(chapters[0].order, 1);
        assert_eq!(chapters[1].order, 2);
        assert_eq!(chapters[0].title, "第1章");
        assert_eq!(chapters[0].word_count, 4);
        assert_eq!(chapters[1].word_count, 2);
        assert_eq!(chapters[1].status, ChapterStatus::Completed);
    }
}
