use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{Message, Model, ModelEvent, ModelRequest, ModelTurn, Part, Role};
use crate::error::CuaError;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str) -> Result<Self, CuaError> {
        if api_key.trim().is_empty() {
            return Err(CuaError::NoApiKey);
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CuaError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn generate(&self, body: &Value) -> Result<Value> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .context("request to Gemini failed")?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Gemini error {}: {}", status, text);
        }
        serde_json::from_str(&text).context("failed to parse Gemini response JSON")
    }
}

#[async_trait]
impl Model for GeminiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn step(&self, request: &ModelRequest) -> Result<ModelTurn, CuaError> {
        let body = build_request(request);
        let v = self.generate(&body).await.map_err(|e| {
            let text = format!("{e:#}");
            if CuaError::is_model_rate_limit(&text) {
                CuaError::ModelRateLimited(text)
            } else {
                CuaError::Model(text)
            }
        })?;
        let turn = parse_response(&v).map_err(|e| CuaError::Model(format!("{e:#}")))?;
        debug!(model = %self.model, events = turn.events.len(), "model turn");
        Ok(turn)
    }
}

fn encode_part(part: &Part) -> Value {
    match part {
        Part::Text(t) => json!({ "text": t }),
        Part::Image { mime_type, data_base64 } => json!({
            "inlineData": { "mimeType": mime_type, "data": data_base64 }
        }),
        Part::FunctionCall { name, args, signature } => {
            let mut v = json!({ "functionCall": { "name": name, "args": args } });
            if let Some(sig) = signature {
                v["thoughtSignature"] = Value::String(sig.clone());
            }
            v
        }
        Part::FunctionResponse { name, response } => json!({
            "functionResponse": { "name": name, "response": response }
        }),
    }
}

fn encode_message(m: &Message) -> Value {
    let role = match m.role {
        Role::User => "user",
        Role::Model => "model",
    };
    json!({ "role": role, "parts": m.parts.iter().map(encode_part).collect::<Vec<_>>() })
}

pub fn build_request(req: &ModelRequest) -> Value {
    let declarations: Vec<Value> = req.tools.iter().map(|t| t.to_function_declaration()).collect();
    json!({
        "systemInstruction": { "parts": [{ "text": req.system_prompt }] },
        "contents": req.messages.iter().map(encode_message).collect::<Vec<_>>(),
        "tools": [{ "functionDeclarations": declarations }],
        "toolConfig": { "functionCallingConfig": { "mode": "AUTO" } },
        "generationConfig": { "thinkingConfig": { "includeThoughts": true } },
    })
}

pub fn parse_response(v: &Value) -> Result<ModelTurn> {
    let Some(candidate) = v.pointer("/candidates/0") else {
        if let Some(reason) = v.pointer("/promptFeedback/blockReason").and_then(|x| x.as_str()) {
            bail!("prompt blocked: {reason}");
        }
        bail!("response has no candidates");
    };

    let parts = candidate
        .pointer("/content/parts")
        .and_then(|x| x.as_array())
        .cloned()
        .unwrap_or_default();

    let mut events = Vec::with_capacity(parts.len());
    for p in &parts {
        if let Some(call) = p.get("functionCall") {
            let name = call
                .get("name")
                .and_then(|x| x.as_str())
                .context("functionCall without name")?
                .to_string();
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            let signature = p.get("thoughtSignature").and_then(|x| x.as_str()).map(str::to_string);
            events.push(ModelEvent::ToolCall { name, args, signature });
        } else if let Some(text) = p.get("text").and_then(|x| x.as_str()) {
            if p.get("thought").and_then(|x| x.as_bool()).unwrap_or(false) {
                events.push(ModelEvent::Thinking(text.to_string()));
            } else if !text.trim().is_empty() {
                events.push(ModelEvent::Content(text.to_string()));
            }
        }
    }

    if events.is_empty() {
        if let Some(reason) = candidate.get("finishReason").and_then(|x| x.as_str()) {
            // e.g. MALFORMED_FUNCTION_CALL when the model invents a tool
            if reason != "STOP" {
                bail!("model stopped: {reason}");
            }
        }
    }
    Ok(ModelTurn { events })
}
