//! Provider-neutral model interface plus the conversation the loop keeps.

pub mod gemini;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CuaError;
use crate::tools::ToolDescriptor;

pub use gemini::GeminiClient;

/// Screenshots beyond this many (newest first) are replaced by a placeholder.
pub const DEFAULT_KEEP_IMAGES: usize = 2;
/// History beyond this is trimmed from the front; the task message stays.
pub const DEFAULT_MAX_HISTORY: usize = 40;

const IMAGE_PLACEHOLDER: &str = "[older screenshot omitted]";

// ===== Messages =====

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Part {
    Text(String),
    Image { mime_type: String, data_base64: String },
    FunctionCall { name: String, args: Value, signature: Option<String> },
    FunctionResponse { name: String, response: Value },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self { role: Role::User, parts: vec![Part::Text(text.into())] }
    }

    fn image_count(&self) -> usize {
        self.parts.iter().filter(|p| matches!(p, Part::Image { .. })).count()
    }
}

// ===== Model contract =====

#[derive(Clone, Debug, PartialEq)]
pub enum ModelEvent {
    /// Reasoning text; forwarded to progress subscribers only.
    Thinking(String),
    Content(String),
    ToolCall { name: String, args: Value, signature: Option<String> },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelTurn {
    pub events: Vec<ModelEvent>,
}

impl ModelTurn {
    pub fn tool_calls(&self) -> impl Iterator<Item = &ModelEvent> {
        self.events.iter().filter(|e| matches!(e, ModelEvent::ToolCall { .. }))
    }

    /// The model's own message for the history: text and the first call.
    pub fn to_message(&self) -> Message {
        let mut parts = Vec::new();
        let mut call_seen = false;
        for e in &self.events {
            match e {
                ModelEvent::Content(t) => parts.push(Part::Text(t.clone())),
                ModelEvent::ToolCall { name, args, signature } if !call_seen => {
                    call_seen = true;
                    parts.push(Part::FunctionCall {
                        name: name.clone(),
                        args: args.clone(),
                        signature: signature.clone(),
                    });
                }
                _ => {}
            }
        }
        Message { role: Role::Model, parts }
    }
}

#[derive(Clone, Debug)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
}

/// One upstream model. `step` asks for the next turn of the conversation.
///
/// Implementations report throttling as [`CuaError::ModelRateLimited`] and
/// everything else as [`CuaError::Model`].
#[async_trait]
pub trait Model: Send + Sync {
    fn name(&self) -> &str;
    async fn step(&self, request: &ModelRequest) -> Result<ModelTurn, CuaError>;
}

// ===== Conversation =====

/// Message history with context pruning applied on every append.
#[derive(Clone, Debug)]
pub struct Conversation {
    messages: Vec<Message>,
    keep_images: usize,
    max_history: usize,
}

impl Conversation {
    pub fn new(task: &str) -> Self {
        Self::with_limits(task, DEFAULT_KEEP_IMAGES, DEFAULT_MAX_HISTORY)
    }

    pub fn with_limits(task: &str, keep_images: usize, max_history: usize) -> Self {
        Self {
            messages: vec![Message::user_text(task)],
            keep_images,
            max_history: max_history.max(2),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        if message.parts.is_empty() {
            return;
        }
        self.messages.push(message);
        self.prune();
    }

    /// Tool result as the user turn answering a function call. A screenshot
    /// in the payload travels as an inline image instead of JSON text.
    pub fn push_observation(&mut self, tool: &str, mut wire: Value) {
        let mut parts = Vec::with_capacity(2);
        let image = wire.as_object_mut().and_then(|o| o.remove("image_base64"));
        parts.push(Part::FunctionResponse { name: tool.to_string(), response: wire });
        if let Some(Value::String(data)) = image {
            parts.push(Part::Image { mime_type: "image/jpeg".into(), data_base64: data });
        }
        self.push(Message { role: Role::User, parts });
    }

    pub fn push_screen(&mut self, caption: &str, jpeg_base64: String) {
        self.push(Message {
            role: Role::User,
            parts: vec![
                Part::Text(caption.to_string()),
                Part::Image { mime_type: "image/jpeg".into(), data_base64: jpeg_base64 },
            ],
        });
    }

    fn prune(&mut self) {
        while self.messages.len() > self.max_history {
            self.messages.remove(1);
            // a user turn right after the task would answer a call that is gone
            while self.messages.len() > 1 && self.messages[1].role == Role::User {
                self.messages.remove(1);
            }
        }

        // images: newest `keep_images` stay inline
        let mut seen = 0;
        for msg in self.messages.iter_mut().rev() {
            if msg.image_count() == 0 {
                continue;
            }
            for part in msg.parts.iter_mut().rev() {
                if let Part::Image { .. } = part {
                    seen += 1;
                    if seen > self.keep_images {
                        *part = Part::Text(IMAGE_PLACEHOLDER.to_string());
                    }
                }
            }
        }
    }
}
