// OpenAI ↔ upstream protocol conversion

pub mod streaming;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub const DEFAULT_MODEL: &str = "chat-model-reasoning";
pub const THINKING_MODEL: &str = "chat-model-reasoning-thinking";

/// 思考模式默认 token 预算
const DEFAULT_BUDGET_TOKENS: u32 = 7999;

const THINKING_SYSTEM_PROMPT: &str =
    "你是一个AI助手。请在回答前进行深度思考分析，展示你的推理过程。";
const DEFAULT_SYSTEM_PROMPT: &str = "你是一个有用的AI助手。";

/// Inbound chat-completion request (OpenAI wire format subset the upstream
/// can express).
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIRequest {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<OpenAIMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub thinking: Option<bool>,
    #[serde(default)]
    pub budget_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(default)]
    pub content: OpenAIContent,
}

/// Message content, either a bare string or an array of text blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OpenAIContent {
    String(String),
    Array(Vec<ContentBlock>),
}

impl Default for OpenAIContent {
    fn default() -> Self {
        OpenAIContent::String(String::new())
    }
}

impl OpenAIContent {
    pub fn as_text(&self) -> String {
        match self {
            OpenAIContent::String(s) => s.clone(),
            OpenAIContent::Array(blocks) => blocks
                .iter()
                .filter(|b| b.kind == "text")
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

/// 可用模型列表 (id, 描述)
pub fn available_models() -> Vec<(&'static str, &'static str)> {
    vec![
        (DEFAULT_MODEL, "UnlimitedAI reasoning chat model"),
        (THINKING_MODEL, "Reasoning chat model with visible thinking"),
    ]
}

pub fn is_known_model(model: &str) -> bool {
    available_models().iter().any(|(id, _)| *id == model)
}

/// 请求是否启用思考模式
pub fn thinking_enabled(request: &OpenAIRequest) -> bool {
    request.model == THINKING_MODEL || request.thinking.unwrap_or(false)
}

/// 将 OpenAI 请求转换为上游聊天请求体
///
/// Every message gains the envelope the upstream expects (id, createdAt,
/// parts). Reasoning requests without a system message get the default
/// thinking prompt injected; `budget_tokens` falls back to the stock
/// budget.
pub fn transform_chat_request(request: &OpenAIRequest) -> Value {
    let thinking = thinking_enabled(request);

    let mut messages: Vec<(String, String)> = request
        .messages
        .iter()
        .map(|m| (m.role.clone(), m.content.as_text()))
        .collect();

    let has_system = messages.iter().any(|(role, _)| role == "system");
    if !has_system {
        let prompt = if thinking {
            THINKING_SYSTEM_PROMPT
        } else {
            DEFAULT_SYSTEM_PROMPT
        };
        messages.insert(0, ("system".to_string(), prompt.to_string()));
    } else if thinking {
        // 系统消息已有时补充思考提示
        if let Some((_, content)) = messages.iter_mut().find(|(role, _)| role == "system") {
            if !content.contains("深度思考") && !content.contains("思考分析") {
                content.push_str("\n请在回答前进行深度思考分析，展示你的推理过程。");
            }
        }
    }

    let formatted: Vec<Value> = messages
        .iter()
        .map(|(role, content)| wrap_message(role, content))
        .collect();

    let mut body = json!({
        "id": Uuid::new_v4().to_string(),
        "messages": formatted,
        "selectedChatModel": DEFAULT_MODEL,
    });

    if thinking {
        body["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": request.budget_tokens.unwrap_or(DEFAULT_BUDGET_TOKENS),
        });
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["maxOutputTokens"] = json!(max_tokens);
    }

    body
}

fn wrap_message(role: &str, content: &str) -> Value {
    json!({
        "id": Uuid::new_v4().to_string(),
        "createdAt": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "role": role,
        "content": content,
        "parts": [{ "type": "text", "text": content }],
    })
}

/// 构造非流式 chat.completion 响应
pub fn build_completion_response(model: &str, content: &str, thinking: Option<&str>) -> Value {
    let mut response = json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": content,
            },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": 0,
            "total_tokens": 0,
        },
    });

    if let Some(thinking) = thinking {
        if !thinking.is_empty() {
            response["thinking"] = json!(thinking);
        }
    }

    response
}

/// 模型列表响应 (OpenAI /v1/models 格式)
pub fn build_models_response() -> Value {
    let models: Vec<Value> = available_models()
        .iter()
        .map(|(id, description)| {
            json!({
                "id": id,
                "object": "model",
                "created": chrono::Utc::now().timestamp(),
                "owned_by": "unlimited-ai",
                "permission": [],
                "root": id,
                "parent": null,
                "description": description,
            })
        })
        .collect();

    json!({
        "object": "list",
        "data": models,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json_body: Value) -> OpenAIRequest {
        serde_json::from_value(json_body).unwrap()
    }

    #[test]
    fn test_default_model_applied() {
        let req = request(json!({"messages": [{"role": "user", "content": "hi"}]}));
        assert_eq!(req.model, DEFAULT_MODEL);
        assert!(!req.stream);
    }

    #[test]
    fn test_thinking_enabled_by_model_or_flag() {
        let by_model = request(json!({"model": THINKING_MODEL, "messages": []}));
        assert!(thinking_enabled(&by_model));

        let by_flag = request(json!({"model": DEFAULT_MODEL, "thinking": true, "messages": []}));
        assert!(thinking_enabled(&by_flag));

        let neither = request(json!({"model": DEFAULT_MODEL, "messages": []}));
        assert!(!thinking_enabled(&neither));
    }

    #[test]
    fn test_transform_wraps_messages() {
        let req = request(json!({
            "model": DEFAULT_MODEL,
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hello"},
            ],
        }));
        let body = transform_chat_request(&req);

        assert_eq!(body["selectedChatModel"], DEFAULT_MODEL);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "hello");
        assert_eq!(messages[1]["parts"][0]["text"], "hello");
        assert!(messages[1]["id"].as_str().is_some());
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn test_transform_injects_system_prompt_for_thinking() {
        let req = request(json!({
            "model": THINKING_MODEL,
            "messages": [{"role": "user", "content": "why is the sky blue"}],
        }));
        let body = transform_chat_request(&req);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"].as_str().unwrap().contains("深度思考"));
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], DEFAULT_BUDGET_TOKENS);
    }

    #[test]
    fn test_transform_respects_budget_and_sampling_params() {
        let req = request(json!({
            "model": DEFAULT_MODEL,
            "thinking": true,
            "budget_tokens": 512,
            "temperature": 0.3,
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let body = transform_chat_request(&req);

        assert_eq!(body["thinking"]["budget_tokens"], 512);
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["maxOutputTokens"], 1024);
    }

    #[test]
    fn test_content_blocks_flatten_to_text() {
        let req = request(json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "part one"},
                    {"type": "image_url", "text": ""},
                    {"type": "text", "text": "part two"},
                ],
            }],
        }));
        assert_eq!(req.messages[0].content.as_text(), "part one\npart two");
    }

    #[test]
    fn test_completion_response_shape() {
        let resp = build_completion_response(DEFAULT_MODEL, "answer", Some("chain"));
        assert_eq!(resp["object"], "chat.completion");
        assert_eq!(resp["choices"][0]["message"]["content"], "answer");
        assert_eq!(resp["choices"][0]["finish_reason"], "stop");
        assert_eq!(resp["thinking"], "chain");

        let no_thinking = build_completion_response(DEFAULT_MODEL, "answer", None);
        assert!(no_thinking.get("thinking").is_none());
    }

    #[test]
    fn test_known_models() {
        assert!(is_known_model(DEFAULT_MODEL));
        assert!(is_known_model(THINKING_MODEL));
        assert!(!is_known_model("gpt-4o"));

        let models = build_models_response();
        assert_eq!(models["data"].as_array().unwrap().len(), 2);
    }
}
