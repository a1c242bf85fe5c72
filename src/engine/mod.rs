//! Inference engine seam
//!
//! The bridge never drives generation itself. A session owns one
//! `InferenceEngine`, built by the bridge's `EngineLoader`, and every request
//! becomes a `Generation`: a channel of `StreamToken`s plus a stop flag.

pub mod completion;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod streaming;

#[cfg(test)]
pub(crate) mod scripted;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use thiserror::Error;

use crate::config::SessionConfig;

pub use completion::{ChunkEmitter, CompletionRequest, RequestMessage};
#[cfg(feature = "llama")]
pub use llama::{LlamaEngine, LlamaLoader, LoadedModelInfo};
pub use model::{resolve_model_file, validate_gguf, GgufMetadata, ModelError, GGUF_MAGIC};
pub use streaming::StreamToken;

/// Errors that can occur inside an engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid request: {0}")]
    Request(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),

    #[error("No inference engine available: {0}")]
    Unavailable(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// One chat-completion request payload, carried byte-exact.
///
/// The bridge does not look inside; engines decide how to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    payload: String,
}

impl ChatRequest {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl From<&str> for ChatRequest {
    fn from(payload: &str) -> Self {
        Self::new(payload)
    }
}

impl From<String> for ChatRequest {
    fn from(payload: String) -> Self {
        Self::new(payload)
    }
}

/// A running generation task as seen from the bridge.
pub struct Generation {
    tokens: Receiver<StreamToken>,
    stop: Arc<AtomicBool>,
}

impl Generation {
    pub fn new(tokens: Receiver<StreamToken>, stop: Arc<AtomicBool>) -> Self {
        Self { tokens, stop }
    }

    /// Asks the engine to stop producing tokens.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn tokens(&self) -> &Receiver<StreamToken> {
        &self.tokens
    }
}

/// An inference engine owned by exactly one session.
///
/// `submit` must return without waiting for generation; output is delivered
/// through the returned `Generation`. Engines must stop producing tokens once
/// the stop flag is set or the receiver is gone.
pub trait InferenceEngine: Send + Sync {
    fn submit(&self, request: &ChatRequest) -> Result<Generation, EngineError>;
}

/// Builds the engine for a new session.
pub trait EngineLoader: Send + Sync {
    fn load(&self, config: &SessionConfig) -> Result<Box<dyn InferenceEngine>, EngineError>;
}

/// Loader used when the crate is built without an engine backend.
pub struct UnavailableLoader;

impl EngineLoader for UnavailableLoader {
    fn load(&self, _config: &SessionConfig) -> Result<Box<dyn InferenceEngine>, EngineError> {
        Err(EngineError::Unavailable(
            "serve-bridge was built without the `llama` feature".to_string(),
        ))
    }
}

/// The loader used by the process-wide bridge.
pub fn default_loader() -> Box<dyn EngineLoader> {
    #[cfg(feature = "llama")]
    {
        Box::new(LlamaLoader)
    }
    #[cfg(not(feature = "llama"))]
    {
        Box::new(UnavailableLoader)
    }
}
