//! Server sessions
//!
//! A session owns one engine instance and the response slots created through it.

use std::path::Path;

use crate::config::SessionConfig;
use crate::engine::{ChatRequest, EngineLoader, InferenceEngine};
use crate::error::{BridgeError, HandleFault, HandleKind};
use crate::handle::{Handle, HandleTable};
use crate::response::{Poll, ResponseSlot};

pub struct Session {
    handle: Handle,
    config: SessionConfig,
    engine: Box<dyn InferenceEngine>,
    responses: HandleTable<ResponseSlot>,
}

impl Session {
    /// Reads the session configuration and loads the engine.
    ///
    /// Every failure here is an `InitializationFailure`.
    pub fn open(
        handle: Handle,
        model_folder: &Path,
        lib_folder: &Path,
        loader: &dyn EngineLoader,
    ) -> Result<Self, BridgeError> {
        let config = SessionConfig::load(model_folder, lib_folder)
            .map_err(|e| BridgeError::InitializationFailure(e.to_string()))?;
        let engine = loader
            .load(&config)
            .map_err(|e| BridgeError::InitializationFailure(e.to_string()))?;

        tracing::info!(
            "Session {} ready (models: {}, libs: {})",
            handle,
            config.model_folder.display(),
            config.lib_folder.display()
        );

        Ok(Self {
            handle,
            config,
            engine,
            responses: HandleTable::new(),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts a generation task and returns the handle of its slot.
    pub fn submit(&self, request: &ChatRequest) -> Result<Handle, BridgeError> {
        let generation = self
            .engine
            .submit(request)
            .map_err(|e| BridgeError::TaskCreationFailure(e.to_string()))?;

        let handle = self
            .responses
            .insert(ResponseSlot::new(self.handle, generation));
        tracing::debug!("Session {} started response {}", self.handle, handle);
        Ok(handle)
    }

    pub fn poll(&self, response: u64) -> Result<Poll, BridgeError> {
        self.slot(response)?.poll()
    }

    /// Releases a slot; an unfinished task is cancelled.
    pub fn destroy_response(&self, response: u64) -> Result<(), BridgeError> {
        let handle = Handle::from_raw(response).ok_or_else(|| stale_response(response))?;
        let slot = self
            .responses
            .remove(handle)
            .ok_or_else(|| stale_response(response))?;
        slot.cancel();
        tracing::debug!("Session {} destroyed response {}", self.handle, handle);
        Ok(())
    }

    /// True if `response` is a live slot of this session.
    pub fn owns(&self, response: Handle) -> bool {
        self.responses.contains(response)
    }

    pub fn live_responses(&self) -> usize {
        self.responses.len()
    }

    /// Cancels and forgets every live slot.
    pub fn close(&self) -> usize {
        let slots = self.responses.drain();
        for (_, slot) in &slots {
            slot.cancel();
        }
        slots.len()
    }

    fn slot(&self, response: u64) -> Result<std::sync::Arc<ResponseSlot>, BridgeError> {
        Handle::from_raw(response)
            .and_then(|handle| self.responses.get(handle))
            .ok_or_else(|| stale_response(response))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn stale_response(response: u64) -> BridgeError {
    BridgeError::invalid_handle(HandleKind::Response, response, HandleFault::Stale)
}
