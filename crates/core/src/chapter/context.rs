use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{Chapter, CharacterRef, FactRef, GenerationRequest, VolumeRef};
use crate::text::{tail_chars, truncate_chars};

const OUTLINE_FRAGMENT_MAX_CHARS: usize = 1_500;
const ENTRY_MAX_CHARS: usize = 200;

static CHAPTER_HEADING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:第\s*(\d+)\s*章|(?i:chapter)\s+(\d+))")
        .expect("valid chapter heading regex")
});

/// Everything one chapter prompt may see. Built per chapter so prompt size
/// stays bounded no matter how large the request is.
#[derive(Clone, Debug)]
pub struct ChapterContext<'c> {
    pub chapter_count: u32,
    pub target_word_count: u32,
    pub outline: &'c str,
    pub outline_fragment: String,
    pub previous_tail: String,
    pub characters: Vec<&'c CharacterRef>,
    pub world_facts: Vec<&'c FactRef>,
    pub volumes: &'c [VolumeRef],
}

impl<'c> ChapterContext<'c> {
    pub fn build(
        request: &'c GenerationRequest,
        previous: Option<&Chapter>,
        chapter_number: u32,
        entries: usize,
        tail_len: usize,
    ) -> Self {
        let outline_fragment = outline_fragment(&request.outline, chapter_number);
        let characters =
            select_entries(&request.characters, entries, |c| &c.name, &outline_fragment);
        let world_facts =
            select_entries(&request.world_facts, entries, |f| &f.name, &outline_fragment);
        Self {
            chapter_count: request.chapter_count,
            target_word_count: request.target_word_count,
            outline: &request.outline,
            previous_tail: previous
                .map(|chapter| tail_chars(&chapter.content, tail_len).to_string())
                .unwrap_or_default(),
            outline_fragment,
            characters,
            world_facts,
            volumes: &request.volumes,
        }
    }

    pub fn characters_text(&self) -> String {
        render_list(self.characters.iter().map(|c| {
            let description = truncate_chars(&c.description, ENTRY_MAX_CHARS);
            format!("{}：{}", c.name, description)
        }))
    }

    pub fn world_facts_text(&self) -> String {
        render_list(
            self.world_facts
                .iter()
                .map(|f| format!("{}：{}", f.name, truncate_chars(&f.content, ENTRY_MAX_CHARS))),
        )
    }

    pub fn volumes_text(&self) -> String {
        render_list(
            self.volumes
                .iter()
                .map(|v| format!("{}：{}", v.title, truncate_chars(&v.summary, ENTRY_MAX_CHARS))),
        )
    }

    pub fn previous_tail_text(&self) -> &str {
        if self.previous_tail.trim().is_empty() {
            "（本章为开篇，无上一章内容）"
        } else {
            &self.previous_tail
        }
    }
}

fn render_list(items: impl Iterator<Item = String>) -> String {
    let lines: Vec<String> = items.map(|item| format!("- {item}")).collect();
    if lines.is_empty() {
        "（无）".to_string()
    } else {
        lines.join("\n")
    }
}

/// Entries mentioned in the fragment come first, then the rest in request
/// order, capped at `limit`.
fn select_entries<'c, T>(
    entries: &'c [T],
    limit: usize,
    name: impl Fn(&T) -> &String,
    fragment: &str,
) -> Vec<&'c T> {
    let (mut mentioned, rest): (Vec<&T>, Vec<&T>) = entries
        .iter()
        .partition(|entry| {
            let name = name(*entry);
            !name.trim().is_empty() && fragment.contains(name.as_str())
        });
    mentioned.extend(rest);
    mentioned.truncate(limit);
    mentioned
}

/// The outline section headed `第N章` / `Chapter N`, or a bounded prefix of
/// the whole outline when it has no per-chapter headings.
pub fn outline_fragment(outline: &str, chapter_number: u32) -> String {
    let mut collecting = false;
    let mut saw_heading = false;
    let mut section = Vec::new();

    for line in outline.lines() {
        if let Some(number) = heading_number(line) {
            saw_heading = true;
            if collecting {
                break;
            }
            collecting = number == chapter_number;
        }
        if collecting {
            section.push(line);
        }
    }

    let text = if !section.is_empty() {
        section.join("\n")
    } else if saw_heading {
        String::new()
    } else {
        outline.trim().to_string()
    };
    truncate_chars(&text, OUTLINE_FRAGMENT_MAX_CHARS).to_string()
}

fn heading_number(line: &str) -> Option<u32> {
    let caps = CHAPTER_HEADING_RE.captures(line)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}
