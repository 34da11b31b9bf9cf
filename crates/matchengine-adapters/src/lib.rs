//! Collaborator contracts for the pipeline and their network-backed implementations.

use async_trait::async_trait;
use matchengine_core::{Posting, SearchHit};
use matchengine_storage::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod channels;
mod openai;
pub mod scripted;
mod tavily;

pub use channels::{MailRelayChannel, MailRelayConfig, TelegramChannel};
pub use openai::{strip_code_fence, OpenAiClassifier, OpenAiClient, OpenAiConfig, OpenAiExtractor};
pub use tavily::{TavilyConfig, TavilySearchProvider};

pub const CRATE_NAME: &str = "matchengine-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("{service} response could not be decoded: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Tag stored as the posting source when a hit carries none.
    fn provider_id(&self) -> &'static str;

    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchHit>, AdapterError>;
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Free-text verdict; callers decode it with `Relevance::from_classifier_output`.
    async fn classify(&self, text: &str) -> Result<String, AdapterError>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// `Ok(None)` is an expected outcome for unusable model output.
    async fn extract(&self, posting: &Posting) -> Result<Option<JsonValue>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Chat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// One notification channel. Delivery failures are reported as `false`, never raised.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn send(&self, destination: &str, message: &RenderedMessage) -> bool;
}

fn decode_error(service: &'static str, message: impl Into<String>) -> AdapterError {
    AdapterError::Decode {
        service,
        message: message.into(),
    }
}
