//! C entry points
//!
//! The host's native glue (JNI, P/Invoke, N-API) calls these functions. Text
//! travels as UTF-16 buffers, objects as `u64` handles with `0` meaning "none".
//! Text returned by the bridge is owned by the caller and must be released with
//! [`serve_bridge_text_free`]. A failed call leaves its reason in
//! [`serve_bridge_last_error`] on the calling thread.

use std::path::Path;
use std::ptr;

use crate::boundary::{self, Op};
use crate::bridge::{self, Bridge};
use crate::codec::{self, CodecError};
use crate::engine::ChatRequest;
use crate::error::{BridgeError, BridgeStatus};
use crate::handle::{Handle, INVALID_HANDLE};
use crate::logging;
use crate::response::{Poll, ResponseChunk};

/// A UTF-16 buffer allocated by the bridge
#[repr(C)]
#[derive(Debug)]
pub struct HostText {
    pub data: *mut u16,
    pub len: usize,
}

impl HostText {
    pub fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
        }
    }

    fn from_text(text: &str) -> Self {
        let units = codec::string_to_host(text);
        if units.is_empty() {
            return Self::empty();
        }
        let boxed = units.into_boxed_slice();
        let len = boxed.len();
        Self {
            data: Box::into_raw(boxed) as *mut u16,
            len,
        }
    }
}

/// Outcome of [`serve_bridge_try_fetch_result`]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// `out_chunk` holds the next piece of output
    Chunk = 0,
    /// Nothing new yet; poll again later
    NotReady = 1,
    /// The stream is exhausted; later polls report the same
    Finished = 2,
    /// `out_chunk` holds the terminal error of the task
    ErrorChunk = 3,
    /// The call itself failed; see `serve_bridge_last_error`
    Failed = 4,
}

/// Borrows a host buffer. A null pointer is only accepted with length 0.
///
/// # Safety
/// `data` must be null or point to `len` readable `u16`s that stay valid for `'a`.
unsafe fn host_units<'a>(data: *const u16, len: usize) -> Result<&'a [u16], CodecError> {
    if data.is_null() {
        return if len == 0 {
            Ok(&[])
        } else {
            Err(CodecError::NullPointer(len))
        };
    }
    Ok(std::slice::from_raw_parts(data, len))
}

/// # Safety
/// See [`host_units`].
unsafe fn host_string(data: *const u16, len: usize) -> Result<String, BridgeError> {
    let units = host_units(data, len)?;
    Ok(codec::host_to_string(units)?)
}

fn create_session(
    bridge: &Bridge,
    model_folder: Result<String, BridgeError>,
    lib_folder: Result<String, BridgeError>,
) -> u64 {
    boundary::shield(Op::CreateSession, INVALID_HANDLE, || {
        let (model, lib) =
            boundary::call(Op::CreateSession, || Ok((model_folder?, lib_folder?)))?;
        bridge
            .create_session(Path::new(&model), Path::new(&lib))
            .map(Handle::get)
    })
}

fn destroy_session(bridge: &Bridge, session: u64) -> BridgeStatus {
    boundary::shield(Op::DestroySession, BridgeStatus::EngineFault, || {
        bridge
            .destroy_session(session)
            .map(|_| BridgeStatus::Ok)
            .or_else(|e| Ok(e.status()))
    })
}

fn chat_completion(bridge: &Bridge, session: u64, request: Result<String, BridgeError>) -> u64 {
    boundary::shield(Op::ChatCompletion, INVALID_HANDLE, || {
        let payload = boundary::call(Op::ChatCompletion, || request)?;
        bridge
            .chat_completion(session, ChatRequest::new(payload))
            .map(Handle::get)
    })
}

fn destroy_response(bridge: &Bridge, session: u64, response: u64) -> BridgeStatus {
    boundary::shield(Op::DestroyResponse, BridgeStatus::EngineFault, || {
        bridge
            .destroy_response(session, response)
            .map(|_| BridgeStatus::Ok)
            .or_else(|e| Ok(e.status()))
    })
}

fn try_fetch_result(
    bridge: &Bridge,
    session: u64,
    response: u64,
    out_chunk: Option<&mut HostText>,
) -> PollStatus {
    boundary::shield(Op::TryFetchResult, PollStatus::Failed, || {
        let out = boundary::call(Op::TryFetchResult, || {
            out_chunk.ok_or(BridgeError::MalformedText(CodecError::NullOutput))
        })?;
        *out = HostText::empty();

        Ok(match bridge.try_fetch_result(session, response)? {
            Poll::NotReady => PollStatus::NotReady,
            Poll::Finished => PollStatus::Finished,
            Poll::Chunk(ResponseChunk::Text(text)) => {
                *out = HostText::from_text(&text);
                PollStatus::Chunk
            }
            Poll::Chunk(ResponseChunk::Error(message)) => {
                *out = HostText::from_text(&message);
                PollStatus::ErrorChunk
            }
        })
    })
}

/// Creates a session. Returns `0` on failure.
///
/// # Safety
/// Each text pointer must be null (with length 0) or point to `len` readable `u16`s.
#[no_mangle]
pub unsafe extern "C" fn serve_bridge_session_create(
    model_folder: *const u16,
    model_folder_len: usize,
    lib_folder: *const u16,
    lib_folder_len: usize,
) -> u64 {
    create_session(
        bridge::global(),
        host_string(model_folder, model_folder_len),
        host_string(lib_folder, lib_folder_len),
    )
}

/// Destroys a session and every response it still owns.
#[no_mangle]
pub extern "C" fn serve_bridge_session_destroy(session: u64) -> BridgeStatus {
    destroy_session(bridge::global(), session)
}

/// Submits a chat-completion request. Returns the response handle, or `0`.
///
/// # Safety
/// `request` must be null (with length 0) or point to `request_len` readable `u16`s.
#[no_mangle]
pub unsafe extern "C" fn serve_bridge_chat_completion(
    session: u64,
    request: *const u16,
    request_len: usize,
) -> u64 {
    chat_completion(bridge::global(), session, host_string(request, request_len))
}

/// Releases a response owned by `session`.
#[no_mangle]
pub extern "C" fn serve_bridge_response_destroy(session: u64, response: u64) -> BridgeStatus {
    destroy_response(bridge::global(), session, response)
}

/// Polls a response without blocking.
///
/// On `Chunk` and `ErrorChunk`, `*out_chunk` receives text the caller must free.
/// Otherwise it is set to an empty buffer.
///
/// # Safety
/// `out_chunk` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn serve_bridge_try_fetch_result(
    session: u64,
    response: u64,
    out_chunk: *mut HostText,
) -> PollStatus {
    try_fetch_result(bridge::global(), session, response, out_chunk.as_mut())
}

/// Status of the last failed call on this thread (`Ok` if the last call succeeded).
///
/// # Safety
/// `out_message` must be null or valid for writes. A message written there
/// must be released with [`serve_bridge_text_free`].
#[no_mangle]
pub unsafe extern "C" fn serve_bridge_last_error(out_message: *mut HostText) -> BridgeStatus {
    let out = out_message.as_mut();
    boundary::shield(Op::LastError, BridgeStatus::EngineFault, || {
        let err = boundary::last_error();
        if let Some(out) = out {
            *out = match &err {
                Some(e) => HostText::from_text(&e.to_string()),
                None => HostText::empty(),
            };
        }
        Ok(err.map(|e| e.status()).unwrap_or(BridgeStatus::Ok))
    })
}

/// Releases text returned by the bridge.
///
/// # Safety
/// `text` must come from this library and must not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn serve_bridge_text_free(text: HostText) {
    boundary::shield(Op::TextFree, (), || {
        if !text.data.is_null() {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(text.data, text.len)));
        }
        Ok(())
    })
}

/// Installs the log subscriber. Returns false if one was already installed.
#[no_mangle]
pub extern "C" fn serve_bridge_init_logging() -> bool {
    boundary::shield(Op::InitLogging, false, || Ok(logging::init().is_ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{Behavior, ScriptedLoader};
    use crate::error::HandleFault;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn units(s: &str) -> Vec<u16> {
        codec::string_to_host(s)
    }

    unsafe fn take(text: HostText) -> String {
        let s = String::from_utf16(host_units(text.data, text.len).unwrap()).unwrap();
        serve_bridge_text_free(text);
        s
    }

    fn path_arg(path: &Path) -> Result<String, BridgeError> {
        Ok(path.to_string_lossy().to_string())
    }

    #[test]
    fn test_global_create_with_missing_folder() {
        let model = units("/no/such/model/folder");
        let lib = units("/no/such/lib/folder");
        let handle = unsafe {
            serve_bridge_session_create(model.as_ptr(), model.len(), lib.as_ptr(), lib.len())
        };
        assert_eq!(handle, INVALID_HANDLE);

        let mut message = HostText::empty();
        let status = unsafe { serve_bridge_last_error(&mut message) };
        assert_eq!(status, BridgeStatus::InitializationFailure);
        assert!(unsafe { take(message) }.starts_with("Failed to initialize engine"));
    }

    #[test]
    fn test_global_create_with_empty_model_folder() {
        let models = TempDir::new().unwrap();
        let libs = TempDir::new().unwrap();
        let model = units(&models.path().to_string_lossy());
        let lib = units(&libs.path().to_string_lossy());

        let handle = unsafe {
            serve_bridge_session_create(model.as_ptr(), model.len(), lib.as_ptr(), lib.len())
        };
        assert_eq!(handle, INVALID_HANDLE);
        assert_eq!(
            unsafe { serve_bridge_last_error(ptr::null_mut()) },
            BridgeStatus::InitializationFailure
        );
    }

    #[test]
    fn test_global_calls_with_invalid_handles() {
        assert_eq!(serve_bridge_session_destroy(0), BridgeStatus::InvalidHandle);
        assert_eq!(
            serve_bridge_response_destroy(0, 0),
            BridgeStatus::InvalidHandle
        );

        let request = units("hello");
        let response =
            unsafe { serve_bridge_chat_completion(0, request.as_ptr(), request.len()) };
        assert_eq!(response, INVALID_HANDLE);

        let mut chunk = HostText::empty();
        let status = unsafe { serve_bridge_try_fetch_result(0, 0, &mut chunk) };
        assert_eq!(status, PollStatus::Failed);
        assert!(chunk.data.is_null());
        assert_eq!(
            unsafe { serve_bridge_last_error(ptr::null_mut()) },
            BridgeStatus::InvalidHandle
        );
    }

    #[test]
    fn test_malformed_text_rejected() {
        let bad = [0x0068, 0xD800];
        let handle = unsafe { serve_bridge_session_create(bad.as_ptr(), bad.len(), ptr::null(), 0) };
        assert_eq!(handle, INVALID_HANDLE);
        assert_eq!(
            unsafe { serve_bridge_last_error(ptr::null_mut()) },
            BridgeStatus::MalformedText
        );

        let handle = unsafe { serve_bridge_session_create(ptr::null(), 4, ptr::null(), 0) };
        assert_eq!(handle, INVALID_HANDLE);
        assert_eq!(
            unsafe { serve_bridge_last_error(ptr::null_mut()) },
            BridgeStatus::MalformedText
        );
    }

    #[test]
    fn test_full_flow_over_the_boundary() {
        let (loader, _probe) = ScriptedLoader::new(Behavior::Echo);
        let bridge = Bridge::new(Box::new(loader));
        let models = TempDir::new().unwrap();
        let libs = TempDir::new().unwrap();

        let session = create_session(&bridge, path_arg(models.path()), path_arg(libs.path()));
        assert_ne!(session, INVALID_HANDLE);

        let response = chat_completion(&bridge, session, Ok("hello 😀".to_string()));
        assert_ne!(response, INVALID_HANDLE);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut text = String::new();
        loop {
            let mut chunk = HostText::empty();
            match try_fetch_result(&bridge, session, response, Some(&mut chunk)) {
                PollStatus::Chunk => text.push_str(&unsafe { take(chunk) }),
                PollStatus::NotReady => {
                    assert!(Instant::now() < deadline);
                    std::thread::sleep(Duration::from_millis(1));
                }
                PollStatus::Finished => break,
                other => panic!("unexpected poll status {:?}", other),
            }
        }
        assert_eq!(text, "hello 😀");

        let mut chunk = HostText::empty();
        assert_eq!(
            try_fetch_result(&bridge, session, response, Some(&mut chunk)),
            PollStatus::Finished
        );
        assert_eq!(try_fetch_result(&bridge, session, response, None), PollStatus::Failed);
        assert_eq!(
            boundary::last_error(),
            Some(BridgeError::MalformedText(CodecError::NullOutput))
        );

        assert_eq!(destroy_response(&bridge, session, response), BridgeStatus::Ok);
        assert_eq!(
            destroy_response(&bridge, session, response),
            BridgeStatus::InvalidHandle
        );
        assert_eq!(destroy_session(&bridge, session), BridgeStatus::Ok);
        assert_eq!(destroy_session(&bridge, session), BridgeStatus::InvalidHandle);
        assert_eq!(
            chat_completion(&bridge, session, Ok("hello".to_string())),
            INVALID_HANDLE
        );
        assert!(matches!(
            boundary::last_error(),
            Some(BridgeError::InvalidHandle {
                reason: HandleFault::Stale,
                ..
            })
        ));
    }

    #[test]
    fn test_error_chunk_over_the_boundary() {
        let (loader, _probe) = ScriptedLoader::new(Behavior::GenerationError);
        let bridge = Bridge::new(Box::new(loader));
        let models = TempDir::new().unwrap();
        let libs = TempDir::new().unwrap();
        let session = create_session(&bridge, path_arg(models.path()), path_arg(libs.path()));
        let response = chat_completion(&bridge, session, Ok("hello".to_string()));

        let deadline = Instant::now() + Duration::from_secs(5);
        let error = loop {
            let mut chunk = HostText::empty();
            match try_fetch_result(&bridge, session, response, Some(&mut chunk)) {
                PollStatus::ErrorChunk => break unsafe { take(chunk) },
                PollStatus::Chunk => drop(unsafe { take(chunk) }),
                PollStatus::NotReady => {
                    assert!(Instant::now() < deadline);
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => panic!("unexpected poll status {:?}", other),
            }
        };
        assert_eq!(error, "kv cache overflow");

        let mut chunk = HostText::empty();
        assert_eq!(
            try_fetch_result(&bridge, session, response, Some(&mut chunk)),
            PollStatus::Finished
        );
        assert_eq!(destroy_session(&bridge, session), BridgeStatus::Ok);
    }

    #[test]
    fn test_text_free_accepts_empty() {
        unsafe { serve_bridge_text_free(HostText::empty()) };
        let text = HostText::from_text("héllo");
        assert_eq!(text.len, 5);
        assert_eq!(unsafe { take(text) }, "héllo");
    }

    #[test]
    fn test_panic_while_destroying_is_engine_fault() {
        let (loader, _probe) = ScriptedLoader::new(Behavior::DropPanic);
        let bridge = Bridge::new(Box::new(loader));
        let models = TempDir::new().unwrap();
        let libs = TempDir::new().unwrap();
        let session = create_session(&bridge, path_arg(models.path()), path_arg(libs.path()));
        assert_ne!(session, INVALID_HANDLE);

        assert_eq!(destroy_session(&bridge, session), BridgeStatus::EngineFault);
        assert_eq!(bridge.live_sessions(), 0);

        let mut message = HostText::empty();
        let status = unsafe { serve_bridge_last_error(&mut message) };
        assert_eq!(status, BridgeStatus::EngineFault);
        assert!(unsafe { take(message) }.contains("engine teardown failed"));
    }

    #[test]
    fn test_text_free_keeps_last_error() {
        assert_eq!(serve_bridge_session_destroy(0), BridgeStatus::InvalidHandle);
        unsafe { serve_bridge_text_free(HostText::from_text("chunk")) };
        assert_eq!(
            unsafe { serve_bridge_last_error(ptr::null_mut()) },
            BridgeStatus::InvalidHandle
        );
    }
}
