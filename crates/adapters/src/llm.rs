use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use novelgate_core::config::{Config, LlmConfig};
use novelgate_core::{InvokeOptions, LanguageModel, LanguageModelError};

use crate::error::AdapterError;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEEPSEEK_SYSTEM_PROMPT: &str = "你是DeepSeek，是一个 AI 人工智能助手";

static VERSION_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/v\d+$").expect("valid version suffix regex"));

/// Interface formats spoken over the OpenAI chat-completions wire shape:
/// `(name, default base url, system prompt)`.
const OPENAI_LIKE: &[(&str, &str, &str)] = &[
    ("openai", "https://api.openai.com/v1", DEFAULT_SYSTEM_PROMPT),
    ("deepseek", "https://api.deepseek.com/v1", DEFAULT_SYSTEM_PROMPT),
    ("ollama", "http://localhost:11434/v1", DEFAULT_SYSTEM_PROMPT),
    ("ml studio", "http://localhost:5000/v1", DEFAULT_SYSTEM_PROMPT),
    ("阿里云百炼", "", DEFAULT_SYSTEM_PROMPT),
    ("火山引擎", "", DEEPSEEK_SYSTEM_PROMPT),
    ("硅基流动", "", DEEPSEEK_SYSTEM_PROMPT),
    ("grok", "https://api.x.ai/v1", "You are Grok, created by xAI."),
];

pub fn create_llm_adapter(
    config: &Config,
    profile_name: &str,
) -> Result<Arc<dyn LanguageModel>, AdapterError> {
    let profile = config.get_llm_profile(profile_name).ok_or_else(|| {
        AdapterError::InvalidConfig(format!("unknown LLM profile `{}`", profile_name))
    })?;
    create_llm_adapter_from_profile(profile)
}

pub fn create_llm_adapter_from_profile(
    profile: &LlmConfig,
) -> Result<Arc<dyn LanguageModel>, AdapterError> {
    let format = profile.interface_format.trim().to_lowercase();
    let client = Client::builder()
        .timeout(Duration::from_secs(profile.timeout.max(1)))
        .build()?;

    if format == "gemini" {
        return Ok(Arc::new(GeminiAdapter::new(client, profile)?));
    }

    let &(_, default_url, system_prompt) = OPENAI_LIKE
        .iter()
        .find(|(name, _, _)| *name == format)
        .ok_or_else(|| {
            AdapterError::InvalidConfig(format!("unknown interface_format: {}", format))
        })?;
    let base_url = if profile.base_url.trim().is_empty() {
        default_url.to_string()
    } else {
        profile.base_url.clone()
    };
    Ok(Arc::new(OpenAiLikeAdapter::new(
        client,
        &normalize_base_url(&base_url),
        profile,
        system_prompt,
    )?))
}

/// Appends `/v1` unless the url already carries a version segment. A
/// trailing `#` opts out and is stripped.
pub fn normalize_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(verbatim) = trimmed.strip_suffix('#') {
        return verbatim.to_string();
    }
    if VERSION_SUFFIX_RE.is_match(trimmed) || trimmed.contains("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed.trim_end_matches('/'))
    }
}

fn non_zero(value: u32) -> Option<u32> {
    (value != 0).then_some(value)
}

struct OpenAiLikeAdapter {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    max_tokens: Option<u32>,
    temperature: f32,
    system_prompt: &'static str,
}

impl OpenAiLikeAdapter {
    fn new(
        client: Client,
        base_url: &str,
        profile: &LlmConfig,
        system_prompt: &'static str,
    ) -> Result<Self, AdapterError> {
        if base_url.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "base_url must not be empty".to_string(),
            ));
        }
        if profile.model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model_name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: Some(profile.api_key.trim().to_string()).filter(|key| !key.is_empty()),
            model_name: profile.model_name.clone(),
            max_tokens: non_zero(profile.max_tokens),
            temperature: profile.temperature,
            system_prompt,
        })
    }

    async fn invoke_once(
        &self,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<String, AdapterError> {
        let body = ChatCompletionRequest {
            model: &self.model_name,
            messages: vec![
                ChatMessageRequest {
                    role: "system",
                    content: self.system_prompt,
                },
                ChatMessageRequest {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: options.max_tokens.or(self.max_tokens),
            temperature: options.temperature.unwrap_or(self.temperature),
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)
    }
}

#[async_trait]
impl LanguageModel for OpenAiLikeAdapter {
    async fn invoke(
        &self,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<String, LanguageModelError> {
        self.invoke_once(prompt, options).await.map_err(|err| {
            if err.is_rate_limited() {
                warn!("{} 触发限流: {}", self.url, err);
            }
            LanguageModelError::from(err)
        })
    }
}

struct GeminiAdapter {
    client: Client,
    url: String,
    temperature: f32,
    max_tokens: u32,
}

impl GeminiAdapter {
    fn new(client: Client, profile: &LlmConfig) -> Result<Self, AdapterError> {
        if profile.api_key.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini api_key must not be empty".to_string(),
            ));
        }
        if profile.model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini model_name must not be empty".to_string(),
            ));
        }

        let base = if profile.base_url.trim().is_empty() {
            "https://generativelanguage.googleapis.com/v1beta"
        } else {
            profile.base_url.trim().trim_end_matches('/')
        };

        Ok(Self {
            client,
            url: format!(
                "{base}/models/{model}:generateContent?key={key}",
                model = profile.model_name.trim(),
                key = profile.api_key.trim()
            ),
            temperature: profile.temperature,
            max_tokens: profile.max_tokens,
        })
    }

    async fn invoke_once(
        &self,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<String, AdapterError> {
        let request = GeminiRequest {
            contents: vec![GeminiRequestContent {
                role: "user",
                parts: vec![GeminiRequestPart { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: options.max_tokens.unwrap_or(self.max_tokens),
                temperature: options.temperature.unwrap_or(self.temperature),
            },
        };

        let response = self.client.post(&self.url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: GeminiResponse = response.json().await?;
        parse_gemini_response(parsed)
    }
}

#[async_trait]
impl LanguageModel for GeminiAdapter {
    async fn invoke(
        &self,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<String, LanguageModelError> {
        self.invoke_once(prompt, options).await.map_err(|err| {
            if let AdapterError::HttpStatus { body, .. } = &err {
                if err.is_rate_limited() {
                    match parse_retry_delay(body) {
                        Some(secs) => warn!("Gemini 触发限流，服务端建议 {secs} 秒后重试"),
                        None => warn!("Gemini 触发限流"),
                    }
                }
            }
            LanguageModelError::from(err)
        })
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// First non-blank choice, whether the gateway answers in chat (`message`)
/// or legacy completion (`text`) shape.
fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    response.choices.into_iter().find_map(|choice| {
        choice
            .message
            .and_then(|message| message.content)
            .or(choice.text)
            .filter(|content| !content.trim().is_empty())
    })
}

#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiRequestContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiRequestContent<'a> {
    role: &'static str,
    parts: Vec<GeminiRequestPart<'a>>,
}

#[derive(Serialize)]
struct GeminiRequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Other(serde_json::Value),
}

fn parse_gemini_response(response: GeminiResponse) -> Result<String, AdapterError> {
    for candidate in response.candidates {
        match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => warn!("Gemini 输出因 max_tokens 被截断"),
            Some("SAFETY") => warn!("Gemini 输出被安全策略拦截"),
            Some("RECITATION") => warn!("Gemini 输出因引用限制被拦截"),
            _ => {}
        }

        let text: String = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| match part {
                        GeminiPart::Text { text } => Some(text),
                        GeminiPart::Other(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !text.trim().is_empty() {
            return Ok(text);
        }
    }

    Err(AdapterError::EmptyResponse)
}

/// Seconds the server asks us to wait, from `error.details[].retryDelay`
/// (`"30s"` or `30`) or a loose `retry delay: N` in plain text.
fn parse_retry_delay(body: &str) -> Option<u64> {
    static RETRY_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"retry[_ ]?delay[^0-9]*(\d+)").expect("valid regex for retry delay")
    });

    let structured = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/details")
                .and_then(|details| details.as_array())
                .and_then(|details| {
                    details.iter().find_map(|detail| {
                        detail
                            .get("retryDelay")
                            .or_else(|| detail.get("retry_delay"))
                            .and_then(parse_delay_value)
                    })
                })
        });

    structured.or_else(|| {
        RETRY_RE
            .captures(body)
            .and_then(|caps| caps.get(1))
            .and_then(|matched| matched.as_str().parse().ok())
    })
}

fn parse_delay_value(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str()?.trim_end_matches('s').parse().ok())
}
