use crate::errors::FleetError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_completion_tokens: Option<u32>,
    /// Ask the backend for a JSON-object response format.
    pub json_output: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            temperature: None,
            max_completion_tokens: None,
            json_output: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub model: String,
    /// Assistant message content. Under the structured contract this is a
    /// JSON document.
    pub content: String,
    /// Chain-of-thought trace when the backend exposes one.
    pub reasoning: Option<String>,
    pub usage: Usage,
}

/// Parses a structured-output payload into a typed value.
///
/// Tolerates markdown code fences and leading prose around the JSON body,
/// which some backends emit despite the response-format hint.
pub fn parse_structured<T: DeserializeOwned>(payload: &str) -> Result<T, FleetError> {
    let body = extract_json_body(payload);
    serde_json::from_str(body)
        .map_err(|e| FleetError::Llm(format!("structured payload decode: {}", e)))
}

/// Returns the JSON object or array embedded in `payload`.
pub fn extract_json_body(payload: &str) -> &str {
    let trimmed = payload.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();
    let obj = unfenced.find('{');
    let arr = unfenced.find('[');
    let start = match (obj, arr) {
        (Some(o), Some(a)) => o.min(a),
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return unfenced,
    };
    let close = if unfenced.as_bytes()[start] == b'{' { '}' } else { ']' };
    match unfenced.rfind(close) {
        Some(end) if end > start => &unfenced[start..=end],
        _ => &unfenced[start..],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Probe {
        foo: String,
    }

    #[test]
    fn parses_plain_json() {
        let p: Probe = parse_structured(r#"{"foo":"bar"}"#).unwrap();
        assert_eq!(p.foo, "bar");
    }

    #[test]
    fn parses_fenced_json() {
        let p: Probe = parse_structured("```json\n{\"foo\":\"bar\"}\n```").unwrap();
        assert_eq!(p.foo, "bar");
    }

    #[test]
    fn parses_json_with_leading_prose() {
        let p: Probe = parse_structured("Here is the result: {\"foo\":\"bar\"}").unwrap();
        assert_eq!(p.foo, "bar");
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_structured::<Probe>("no json here").is_err());
    }
}
