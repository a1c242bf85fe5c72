//! The bridge
//!
//! Holds the live session table and the loader that builds engines. Each public
//! method is one boundary operation and runs through [`boundary::call`].

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::boundary::{self, Op};
use crate::engine::{self, ChatRequest, EngineLoader};
use crate::error::{BridgeError, HandleFault, HandleKind};
use crate::handle::{Handle, HandleTable};
use crate::response::Poll;
use crate::session::Session;

static GLOBAL: Lazy<Bridge> = Lazy::new(|| Bridge::new(engine::default_loader()));

/// The process-wide bridge used by the C entry points.
pub fn global() -> &'static Bridge {
    &GLOBAL
}

pub struct Bridge {
    sessions: HandleTable<Session>,
    loader: Box<dyn EngineLoader>,
}

impl Bridge {
    pub fn new(loader: Box<dyn EngineLoader>) -> Self {
        Self {
            sessions: HandleTable::new(),
            loader,
        }
    }

    /// Creates a session over the model assets in `model_folder`.
    pub fn create_session(
        &self,
        model_folder: &Path,
        lib_folder: &Path,
    ) -> Result<Handle, BridgeError> {
        boundary::call(Op::CreateSession, || {
            self.sessions.try_insert_with(|handle| {
                Session::open(handle, model_folder, lib_folder, &*self.loader)
            })
        })
    }

    /// Destroys a session; its live responses are cancelled and invalidated.
    pub fn destroy_session(&self, session: u64) -> Result<(), BridgeError> {
        boundary::call(Op::DestroySession, || {
            let handle = Handle::from_raw(session).ok_or_else(|| stale_session(session))?;
            let removed = self
                .sessions
                .remove(handle)
                .ok_or_else(|| stale_session(session))?;
            let cancelled = removed.close();
            if cancelled > 0 {
                tracing::warn!(
                    "Session {} destroyed with {} live response(s); they are now invalid",
                    handle,
                    cancelled
                );
            }
            tracing::info!("Session {} destroyed", handle);
            Ok(())
        })
    }

    /// Submits a chat-completion request and returns the new response handle.
    pub fn chat_completion(
        &self,
        session: u64,
        request: ChatRequest,
    ) -> Result<Handle, BridgeError> {
        boundary::call(Op::ChatCompletion, || self.session(session)?.submit(&request))
    }

    /// Releases a response owned by `session`.
    pub fn destroy_response(&self, session: u64, response: u64) -> Result<(), BridgeError> {
        boundary::call(Op::DestroyResponse, || {
            let owner = self.session(session)?;
            owner
                .destroy_response(response)
                .map_err(|e| self.classify_response_error(&owner, response, e))
        })
    }

    /// Polls a response without blocking.
    pub fn try_fetch_result(&self, session: u64, response: u64) -> Result<Poll, BridgeError> {
        boundary::call(Op::TryFetchResult, || {
            let owner = self.session(session)?;
            owner
                .poll(response)
                .map_err(|e| self.classify_response_error(&owner, response, e))
        })
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn session(&self, session: u64) -> Result<Arc<Session>, BridgeError> {
        Handle::from_raw(session)
            .and_then(|handle| self.sessions.get(handle))
            .ok_or_else(|| stale_session(session))
    }

    /// Upgrades a stale-response error to `Foreign` when another session owns it.
    fn classify_response_error(
        &self,
        owner: &Session,
        response: u64,
        err: BridgeError,
    ) -> BridgeError {
        let Some(handle) = Handle::from_raw(response) else {
            return err;
        };
        if !err.is_invalid_handle() || owner.owns(handle) {
            return err;
        }
        match self.sessions.find(|other| other.owns(handle)) {
            Some(_) => {
                BridgeError::invalid_handle(HandleKind::Response, response, HandleFault::Foreign)
            }
            None => err,
        }
    }
}

fn stale_session(session: u64) -> BridgeError {
    BridgeError::invalid_handle(HandleKind::Session, session, HandleFault::Stale)
}
