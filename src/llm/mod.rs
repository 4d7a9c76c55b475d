//! LLM Provider Module
//!
//! Unified client interface for OpenAI-compatible chat endpoints plus the
//! budget guard and prompt template version guard that gate every call.

pub mod budget;
pub mod client;
pub mod config;
pub mod promptmeta;
pub mod types;

pub use budget::{BudgetGuard, BudgetSnapshot};
pub use client::ZenmuxClient;
pub use config::{BudgetConfig, LlmConfig, ModelConfig};
pub use promptmeta::{extract_template_version, TemplateVersionGuard};
pub use types::{parse_structured, ChatMessage, ChatRequest, ChatResponse, MessageRole, Usage};

use crate::errors::FleetError;
use async_trait::async_trait;

/// Unified interface for LLM backends.
///
/// Implementations are plain structs. The journal replay stub only
/// implements `chat_structured`, returning the recorded payload.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Free-form chat completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, FleetError>;

    /// Streaming chat completion. Backends without streaming keep the
    /// default, which refuses the call.
    async fn chat_stream(
        &self,
        _request: &ChatRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<ChatResponse>, FleetError> {
        Err(FleetError::Llm("streaming not supported by this client".into()))
    }

    /// Chat completion under the structured-output contract: the response
    /// content is a JSON document matching the caller's schema.
    async fn chat_structured(&self, request: &ChatRequest) -> Result<ChatResponse, FleetError>;

    /// Runtime configuration, when the backend has one.
    fn config(&self) -> Option<&LlmConfig> {
        None
    }

    /// Release any held resources.
    async fn close(&self) -> Result<(), FleetError> {
        Ok(())
    }
}
