//! OpenAI-compatible HTTP client for the Zenmux gateway.

use crate::errors::FleetError;
use crate::llm::config::LlmConfig;
use crate::llm::types::{ChatRequest, ChatResponse, Usage};
use crate::llm::LlmClient;
use crate::logger::{self, LogTag};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub struct ZenmuxClient {
    cfg: LlmConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl ZenmuxClient {
    pub fn new(cfg: LlmConfig) -> Result<Self, FleetError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(|e| FleetError::Llm(format!("build http client: {}", e)))?;
        Ok(Self { cfg, http })
    }

    async fn call(&self, request: &ChatRequest) -> Result<ChatResponse, FleetError> {
        let url = format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'));
        let mut body = json!({
            "model": self.resolve_model(&request.model),
            "messages": request.messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_completion_tokens {
            body["max_completion_tokens"] = json!(max);
        }
        if request.json_output {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut last_err = FleetError::Llm("no attempts made".into());
        let attempts = self.cfg.max_retries.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
            match self.send_once(&url, &body).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    logger::warn(
                        LogTag::Executor,
                        &format!("llm attempt {}/{} failed: {}", attempt + 1, attempts, err),
                    );
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn send_once(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<ChatResponse, FleetError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| FleetError::Llm(format!("request: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(FleetError::Llm(format!("status {}: {}", status, text)));
        }
        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| FleetError::Llm(format!("decode response: {}", e)))?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| FleetError::Llm("response contained no choices".into()))?;
        if logger::is_verbose_logging_enabled() {
            logger::debug(LogTag::Executor, &format!("llm response: {}", choice.message.content));
        }
        Ok(ChatResponse {
            model: wire.model,
            content: choice.message.content,
            reasoning: choice.message.reasoning_content,
            usage: wire.usage.unwrap_or_default(),
        })
    }

    fn resolve_model(&self, alias: &str) -> String {
        if alias.trim().is_empty() {
            return self.cfg.default_model.clone();
        }
        match self.cfg.model(alias) {
            Some(model_cfg) => model_cfg.model_name.clone(),
            None => alias.to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for ZenmuxClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, FleetError> {
        self.call(request).await
    }

    async fn chat_structured(&self, request: &ChatRequest) -> Result<ChatResponse, FleetError> {
        let mut structured = request.clone();
        structured.json_output = true;
        self.call(&structured).await
    }

    fn config(&self) -> Option<&LlmConfig> {
        Some(&self.cfg)
    }
}
