mod blob;
mod error;
mod llm;

pub use blob::FileBlobStore;
pub use error::AdapterError;
pub use llm::{create_llm_adapter, create_llm_adapter_from_profile, normalize_base_url};

pub use novelgate_core::config::{Config, ConfigStore, LlmConfig};
pub use novelgate_core::{BlobStore, LanguageModel, LanguageModelError};
