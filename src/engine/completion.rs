//! Chat completion wire format
//!
//! Requests arrive as OpenAI-style chat payloads (or bare prompt text).
//! Streamed output leaves as server-sent-event lines: one
//! `data: {chat.completion.chunk}` per text piece, a closing chunk with the
//! finish reason, then `data: [DONE]`. A request that did not ask to stream
//! gets a single bare `chat.completion` object. Failures are reported as an
//! `{"code", "message", "type"}` object without the `data:` prefix.

use std::sync::mpsc::Sender;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EngineError, StreamToken};
use crate::codec::{CodecError, Utf8Assembler};
use crate::config::SamplerParams;

/// Prefix of every streamed chunk
pub const STREAM_PREFIX: &str = "data: ";

/// Last streamed chunk before the stream ends
pub const STREAM_END: &str = "data: [DONE]";

/// One message of a chat request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// The parts of a chat request an engine acts on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<RequestMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

impl CompletionRequest {
    /// Reads a request payload.
    ///
    /// A payload starting with `{` must be a chat request object with at least
    /// one message. Anything else is taken as the text of a single user message.
    pub fn parse(payload: &str) -> Result<Self, EngineError> {
        if !payload.trim_start().starts_with('{') {
            return Ok(Self::from_prompt(payload));
        }

        let request: Self =
            serde_json::from_str(payload).map_err(|e| EngineError::Request(e.to_string()))?;
        if request.messages.is_empty() {
            return Err(EngineError::Request("request has no messages".to_string()));
        }
        Ok(request)
    }

    pub fn from_prompt(prompt: &str) -> Self {
        Self {
            model: None,
            messages: vec![RequestMessage {
                role: "user".to_string(),
                content: Some(prompt.to_string()),
            }],
            max_tokens: None,
            temperature: None,
            top_p: None,
            presence_penalty: None,
            frequency_penalty: None,
            stream: true,
        }
    }

    /// Session sampler settings with this request's overrides applied.
    pub fn sampling(&self, defaults: &SamplerParams) -> SamplerParams {
        let mut params = defaults.clone();
        if let Some(temperature) = self.temperature {
            params.temperature = temperature.clamp(0.0, 2.0);
        }
        if let Some(top_p) = self.top_p {
            params.top_p = top_p.clamp(0.0, 1.0);
        }
        if let Some(presence) = self.presence_penalty {
            params.penalty_present = presence.clamp(-2.0, 2.0);
        }
        if let Some(frequency) = self.frequency_penalty {
            params.penalty_freq = frequency.clamp(-2.0, 2.0);
        }
        params
    }

    /// Message contents joined by newlines, for models without a chat template.
    pub fn plain_prompt(&self) -> String {
        self.messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Why generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-generation token
    Stop,
    /// `max_tokens` reached or the context window is full
    Length,
}

/// Settles text still held by `assembler` when generation ends.
///
/// A generation cut off by a length limit may stop inside a multi-byte
/// character; that partial character is dropped. Ending inside a character
/// on an end-of-generation token is malformed output and an error.
pub fn settle_text(
    assembler: Utf8Assembler,
    reason: FinishReason,
) -> Result<FinishReason, CodecError> {
    match reason {
        FinishReason::Length => {
            let dropped = assembler.discard_pending();
            if dropped > 0 {
                tracing::debug!(
                    "Dropped {} byte(s) of an incomplete character at length limit",
                    dropped
                );
            }
        }
        FinishReason::Stop => assembler.finish()?,
    }
    Ok(reason)
}

impl FinishReason {
    fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }
}

#[derive(Serialize)]
struct Delta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

#[derive(Serialize)]
struct ChunkChoice<'a> {
    index: u32,
    delta: Delta<'a>,
    finish_reason: Option<&'static str>,
}

#[derive(Serialize)]
struct ChunkBody<'a> {
    id: &'a str,
    object: &'static str,
    created: i64,
    model: &'a str,
    choices: [ChunkChoice<'a>; 1],
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: u16,
    message: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct AssistantMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionChoice<'a> {
    index: u32,
    message: AssistantMessage<'a>,
    finish_reason: &'static str,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    id: &'a str,
    object: &'static str,
    created: i64,
    model: &'a str,
    choices: [CompletionChoice<'a>; 1],
}

/// Turns generated text into wire chunks and sends them down a token channel.
pub struct ChunkEmitter {
    tx: Sender<StreamToken>,
    id: String,
    created: i64,
    model: String,
    stream: bool,
    first: bool,
    collected: String,
}

impl ChunkEmitter {
    pub fn new(tx: Sender<StreamToken>, model: impl Into<String>, stream: bool) -> Self {
        Self {
            tx,
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            model: model.into(),
            stream,
            first: true,
            collected: String::new(),
        }
    }

    /// Emits one piece of text. Returns false once nobody is listening.
    pub fn text(&mut self, piece: &str) -> bool {
        if piece.is_empty() {
            return true;
        }
        if !self.stream {
            self.collected.push_str(piece);
            return true;
        }

        let role = if self.first { Some("assistant") } else { None };
        self.first = false;
        let chunk = self.chunk(role, Some(piece), None);
        self.send(chunk)
    }

    /// Emits the closing chunk (or the whole completion) and `Done`.
    pub fn finish(self, reason: FinishReason) {
        let body = if self.stream {
            self.chunk(None, None, Some(reason))
        } else {
            to_json(&CompletionBody {
                id: &self.id,
                object: "chat.completion",
                created: self.created,
                model: &self.model,
                choices: [CompletionChoice {
                    index: 0,
                    message: AssistantMessage {
                        role: "assistant",
                        content: &self.collected,
                    },
                    finish_reason: reason.as_str(),
                }],
            })
        };

        if !self.send(body) {
            return;
        }
        if self.stream && self.tx.send(StreamToken::Token(STREAM_END.to_string())).is_err() {
            return;
        }
        let _ = self.tx.send(StreamToken::Done);
    }

    /// Ends the stream with an error object; nothing else follows.
    pub fn fail(self, error: &EngineError) {
        let (code, kind) = match error {
            EngineError::Request(_) => (400, "invalid_request_error"),
            _ => (500, "server_error"),
        };
        let _ = self.tx.send(StreamToken::Error(error_body(code, kind, &error.to_string())));
    }

    fn chunk(
        &self,
        role: Option<&'static str>,
        content: Option<&str>,
        reason: Option<FinishReason>,
    ) -> Result<String, EngineError> {
        let json = to_json(&ChunkBody {
            id: &self.id,
            object: "chat.completion.chunk",
            created: self.created,
            model: &self.model,
            choices: [ChunkChoice {
                index: 0,
                delta: Delta { role, content },
                finish_reason: reason.map(FinishReason::as_str),
            }],
        })?;
        Ok(format!("{STREAM_PREFIX}{json}"))
    }

    fn send(&self, body: Result<String, EngineError>) -> bool {
        let token = match body {
            Ok(json) => StreamToken::Token(json),
            Err(e) => {
                let body = error_body(500, "server_error", &e.to_string());
                let _ = self.tx.send(StreamToken::Error(body));
                return false;
            }
        };
        self.tx.send(token).is_ok()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, EngineError> {
    serde_json::to_string(value).map_err(|e| EngineError::Inference(e.to_string()))
}

fn error_body(code: u16, kind: &'static str, message: &str) -> String {
    let body = ErrorBody { code, message, kind };
    // Plain strings and numbers cannot fail to serialize.
    serde_json::to_string(&body).unwrap_or_else(|_| message.to_string())
}
