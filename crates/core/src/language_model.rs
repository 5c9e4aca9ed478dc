use async_trait::async_trait;
use std::error::Error as StdError;
use std::fmt;

/// Opaque failure from a text-generation backend.
#[derive(Debug)]
pub struct LanguageModelError {
    inner: Box<dyn StdError + Send + Sync>,
}

impl LanguageModelError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(error),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self {
            inner: message.into(),
        }
    }
}

impl fmt::Display for LanguageModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for LanguageModelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InvokeOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl InvokeOptions {
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            max_tokens: None,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn invoke(
        &self,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<String, LanguageModelError>;
}
