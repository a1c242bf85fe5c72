//! Response slots
//!
//! A slot is the bridge-side record of one chat-completion task. Polling
//! samples whatever the engine has produced so far and never waits.

use std::sync::mpsc::TryRecvError;
use std::sync::{Mutex, TryLockError};

use crate::engine::{Generation, StreamToken};
use crate::error::BridgeError;
use crate::handle::Handle;

/// Lifecycle of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Submitted, nothing delivered yet
    Pending,
    /// At least one chunk delivered, more may follow
    Streaming,
    /// Terminal
    Finished,
}

/// One increment of output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseChunk {
    Text(String),
    /// The task failed; this is the last chunk of the slot.
    Error(String),
}

impl ResponseChunk {
    pub fn text(&self) -> &str {
        match self {
            ResponseChunk::Text(s) | ResponseChunk::Error(s) => s,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResponseChunk::Error(_))
    }
}

/// Result of a single poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Chunk(ResponseChunk),
    /// Nothing new yet; the task is still running
    NotReady,
    /// The stream is exhausted
    Finished,
}

struct SlotState {
    phase: Phase,
    generation: Generation,
    delivered: usize,
}

pub struct ResponseSlot {
    session: Handle,
    state: Mutex<SlotState>,
}

impl ResponseSlot {
    pub fn new(session: Handle, generation: Generation) -> Self {
        Self {
            session,
            state: Mutex::new(SlotState {
                phase: Phase::Pending,
                generation,
                delivered: 0,
            }),
        }
    }

    /// The session this slot belongs to
    pub fn session(&self) -> Handle {
        self.session
    }

    /// Takes the next chunk if there is one.
    ///
    /// A concurrent poll holding the slot is reported as `NotReady` rather
    /// than waited for.
    pub fn poll(&self) -> Result<Poll, BridgeError> {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return Ok(Poll::NotReady),
            Err(TryLockError::Poisoned(_)) => {
                return Err(BridgeError::EngineFault(
                    "response state poisoned by an earlier panic".to_string(),
                ))
            }
        };

        if state.phase == Phase::Finished {
            return Ok(Poll::Finished);
        }

        loop {
            let next = state.generation.tokens().try_recv();
            match next {
                Ok(StreamToken::Token(text)) if text.is_empty() => continue,
                Ok(StreamToken::Token(text)) => {
                    state.phase = Phase::Streaming;
                    state.delivered += 1;
                    return Ok(Poll::Chunk(ResponseChunk::Text(text)));
                }
                Ok(StreamToken::Done) => {
                    state.phase = Phase::Finished;
                    tracing::debug!("Response finished after {} chunk(s)", state.delivered);
                    return Ok(Poll::Finished);
                }
                Ok(StreamToken::Error(message)) => {
                    state.phase = Phase::Finished;
                    tracing::warn!("Generation failed: {}", message);
                    return Ok(Poll::Chunk(ResponseChunk::Error(message)));
                }
                Err(TryRecvError::Empty) => return Ok(Poll::NotReady),
                Err(TryRecvError::Disconnected) => {
                    state.phase = Phase::Finished;
                    let message = "generation worker exited without completing".to_string();
                    tracing::warn!("{}", message);
                    return Ok(Poll::Chunk(ResponseChunk::Error(message)));
                }
            }
        }
    }

    /// Current phase; `None` if another thread is polling right now.
    pub fn phase(&self) -> Option<Phase> {
        self.state.try_lock().ok().map(|state| state.phase)
    }

    /// Asks the engine to stop this task.
    pub fn cancel(&self) {
        match self.state.lock() {
            Ok(state) => state.generation.cancel(),
            Err(poisoned) => poisoned.into_inner().generation.cancel(),
        }
    }
}

impl Drop for ResponseSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
