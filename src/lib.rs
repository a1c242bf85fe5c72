//! serve-bridge
//!
//! Boundary bridge between a managed host runtime and a native streaming
//! chat-completion engine. The host opens sessions on a model folder, submits
//! chat requests and polls each response for text chunks. Every entry point
//! is reached through opaque numeric handles and never lets a native panic
//! cross into the host.
//!
//! Rust callers use [`Bridge`] directly; the host runtime links the C ABI in
//! [`ffi`].

pub mod boundary;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod handle;
pub mod logging;
pub mod response;
pub mod session;

pub use bridge::{global, Bridge};
pub use codec::{CodecError, Utf8Assembler};
pub use config::{HyperParams, SamplerParams, SessionConfig, Workspace};
pub use engine::{ChatRequest, EngineError, EngineLoader, Generation, InferenceEngine, StreamToken};
pub use error::{BridgeError, BridgeStatus, HandleFault, HandleKind};
pub use handle::{Handle, HandleTable, INVALID_HANDLE};
pub use response::{Phase, Poll, ResponseChunk};
