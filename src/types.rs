use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    /// Fills in the defaults the upstream expects; a zero `n` counts as unset.
    pub fn apply_defaults(&mut self) {
        if matches!(self.n, None | Some(0)) {
            self.n = Some(1);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_defaults_sets_n_when_missing_or_zero() {
        let mut req: ChatRequest =
            serde_json::from_value(json!({"model": "m", "messages": [], "n": 0})).unwrap();
        req.apply_defaults();
        assert_eq!(req.n, Some(1));

        let mut req: ChatRequest =
            serde_json::from_value(json!({"model": "m", "messages": [], "n": 3})).unwrap();
        req.apply_defaults();
        assert_eq!(req.n, Some(3));
    }

    #[test]
    fn chat_request_keeps_unknown_fields_and_omits_unset_ones() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "llama-3.1-8b-instant",
            "messages": [{"role": "user", "content": "hi", "name": "bob"}],
            "response_format": {"type": "json_object"},
            "stop": "END"
        }))
        .unwrap();

        assert_eq!(req.stop, Some(StopSequences::One("END".to_string())));

        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["response_format"], json!({"type": "json_object"}));
        assert_eq!(out["messages"][0]["name"], json!("bob"));
        assert!(out.get("stream").is_none());
        assert!(out.get("temperature").is_none());
    }

    #[test]
    fn chat_request_requires_model_and_messages() {
        assert!(serde_json::from_value::<ChatRequest>(json!({"messages": []})).is_err());
        assert!(serde_json::from_value::<ChatRequest>(json!({"model": "m"})).is_err());
    }

    #[test]
    fn message_without_role_is_forwarded_as_sent() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"content": "hi"}]
        }))
        .unwrap();
        assert_eq!(req.messages[0].role, "");

        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["messages"][0], json!({"content": "hi"}));
    }

    #[test]
    fn completion_response_parses_usage() {
        let resp: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "llama-3.1-8b-instant",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8}
        }))
        .unwrap();

        assert_eq!(resp.usage.unwrap().total_tokens, 8);
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
    }
}
