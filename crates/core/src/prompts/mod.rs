use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::PromptConfig;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

pub type PromptArguments = HashMap<String, String>;

/// Templates the pipeline renders. Wording lives in TOML; only the keys and
/// their placeholders are fixed here.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PromptKey {
    SceneOutline,
    ChapterDraft,
    ChapterSupplement,
    ChapterRewrite,
    ChapterFix,
}

impl PromptKey {
    pub const ALL: [PromptKey; 5] = [
        Self::SceneOutline,
        Self::ChapterDraft,
        Self::ChapterSupplement,
        Self::ChapterRewrite,
        Self::ChapterFix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SceneOutline => "scene_outline",
            Self::ChapterDraft => "chapter_draft",
            Self::ChapterSupplement => "chapter_supplement",
            Self::ChapterRewrite => "chapter_rewrite",
            Self::ChapterFix => "chapter_fix",
        }
    }
}

impl fmt::Display for PromptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptSource {
    BuiltIn,
    File(PathBuf),
}

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    segments: Vec<TemplateSegment>,
    required: BTreeSet<String>,
    source: PromptSource,
}

impl PromptTemplate {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn source(&self) -> &PromptSource {
        &self.source
    }

    pub fn required_arguments(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        if let Some(missing) = self
            .required
            .iter()
            .find(|name| !arguments.contains_key(*name))
        {
            return Err(PromptError::MissingArgument {
                key: self.key.clone(),
                argument: missing.clone(),
            });
        }

        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => output.push_str(text),
                TemplateSegment::Placeholder(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }
        Ok(output)
    }

    fn from_raw(key: String, raw: RawPrompt, source: PromptSource) -> Result<Self, PromptError> {
        let (segments, placeholders) = parse_template(&raw.template);
        let required = if raw.required.is_empty() {
            placeholders
        } else {
            let mut set = BTreeSet::new();
            for argument in raw.required {
                let trimmed = argument.trim().to_string();
                if !placeholders.contains(&trimmed) {
                    return Err(PromptError::InvalidRequired {
                        key: key.clone(),
                        argument: trimmed,
                    });
                }
                set.insert(trimmed);
            }
            set
        };

        Ok(Self {
            key,
            segments,
            required,
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}` as TOML: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("required key `{argument}` declared for prompt `{key}` has no matching placeholder")]
    InvalidRequired { key: String, argument: String },
}

#[derive(Clone, Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
    directories: Vec<PathBuf>,
    hot_reload: bool,
}

impl PromptRegistry {
    pub fn new() -> Result<Self, PromptError> {
        Self::from_prompt_config(&PromptConfig::default())
    }

    pub fn from_prompt_config(config: &PromptConfig) -> Result<Self, PromptError> {
        let mut registry = Self {
            prompts: BTreeMap::new(),
            directories: config.custom_directories.clone(),
            hot_reload: config.enable_hot_reload,
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn hot_reload_enabled(&self) -> bool {
        self.hot_reload
    }

    pub fn reload(&mut self) -> Result<(), PromptError> {
        let mut prompts = BTreeMap::new();
        for template in parse_document(BUILT_IN_PROMPTS, PromptSource::BuiltIn)? {
            prompts.insert(template.key().to_string(), template);
        }
        for dir in &self.directories {
            load_directory(dir, &mut prompts)?;
        }
        self.prompts = prompts;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn format(&self, key: PromptKey, args: &PromptArguments) -> Result<String, PromptError> {
        self.get(key.as_str())
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?
            .render(args)
    }

    pub fn format_with<I, K, V>(&self, key: PromptKey, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let args: PromptArguments = arguments
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.format(key, &args)
    }
}

fn load_directory(
    dir: &Path,
    prompts: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let read_dir = fs::read_dir(dir).map_err(|source| PromptError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in read_dir {
        let path = entry
            .map_err(|source| PromptError::Io {
                path: dir.to_path_buf(),
                source,
            })?
            .path();
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if path.is_file() && is_toml {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let contents = fs::read_to_string(&path).map_err(|source| PromptError::Io {
            path: path.clone(),
            source,
        })?;
        let templates =
            parse_document(&contents, PromptSource::File(path.clone())).map_err(|err| match err {
                PromptError::ParseBuiltIn(source) => PromptError::ParseToml {
                    path: path.clone(),
                    source,
                },
                other => other,
            })?;
        for template in templates {
            prompts.insert(template.key().to_string(), template);
        }
    }

    Ok(())
}

fn parse_document(source: &str, origin: PromptSource) -> Result<Vec<PromptTemplate>, PromptError> {
    let document: PromptDocument = toml::from_str(source).map_err(PromptError::ParseBuiltIn)?;
    document
        .prompts
        .into_iter()
        .map(|(key, raw)| PromptTemplate::from_raw(key, raw, origin.clone()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    required: Vec<String>,
}

#[derive(Clone, Debug)]
enum TemplateSegment {
    Literal(String),
    Placeholder(String),
}

/// Splits `{name}` placeholders from literal text; `{{` and `}}` are
/// literal braces and an unclosed `{` stays literal.
fn parse_template(template: &str) -> (Vec<TemplateSegment>, BTreeSet<String>) {
    let mut segments = Vec::new();
    let mut placeholders = BTreeSet::new();
    let mut buffer = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                buffer.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                buffer.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    name.push(next);
                }
                let trimmed = name.trim();
                if closed && !trimmed.is_empty() {
                    if !buffer.is_empty() {
                        segments.push(TemplateSegment::Literal(std::mem::take(&mut buffer)));
                    }
                    placeholders.insert(trimmed.to_string());
                    segments.push(TemplateSegment::Placeholder(trimmed.to_string()));
                } else {
                    buffer.push('{');
                    buffer.push_str(&name);
                    if closed {
                        buffer.push('}');
                    }
                }
            }
            _ => buffer.push(ch),
        }
    }

    if !buffer.is_empty() {
        segments.push(TemplateSegment::Literal(buffer));
    }

    (segments, placeholders)
}
