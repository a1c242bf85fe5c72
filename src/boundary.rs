//! Boundary call wrapper
//!
//! Every operation reachable from the host runs through [`call`]. It is the one
//! place where failures are caught, logged and remembered: typed errors pass
//! through, panics become errors, and nothing unwinds into the host runtime.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::error::BridgeError;

/// Component tag attached to every boundary diagnostic
pub const COMPONENT: &str = "serve-bridge";

/// The operations exposed to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    CreateSession,
    DestroySession,
    ChatCompletion,
    DestroyResponse,
    TryFetchResult,
    LastError,
    TextFree,
    InitLogging,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::CreateSession => "create_session",
            Op::DestroySession => "destroy_session",
            Op::ChatCompletion => "chat_completion",
            Op::DestroyResponse => "destroy_response",
            Op::TryFetchResult => "try_fetch_result",
            Op::LastError => "last_error",
            Op::TextFree => "text_free",
            Op::InitLogging => "init_logging",
        }
    }

    /// The error a panic inside this operation is reported as.
    fn panic_error(self, message: String) -> BridgeError {
        match self {
            Op::CreateSession => BridgeError::InitializationFailure(message),
            Op::ChatCompletion => BridgeError::TaskCreationFailure(message),
            _ => BridgeError::EngineFault(message),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<BridgeError>> = const { RefCell::new(None) };
}

/// Runs one boundary operation.
///
/// Failures are logged with the component tag and operation name and stored
/// as the calling thread's last error.
pub fn call<T, F>(op: Op, f: F) -> Result<T, BridgeError>
where
    F: FnOnce() -> Result<T, BridgeError>,
{
    let result = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(op.panic_error(format!("panic: {}", panic_message(&*payload)))),
    };

    match &result {
        Ok(_) => clear_last_error(),
        Err(err) => {
            tracing::error!(component = COMPONENT, op = op.name(), "{}", err);
            set_last_error(err.clone());
        }
    }
    result
}

/// Outermost guard for a C entry point: maps every failure to `sentinel`.
///
/// `f` is expected to report its own failures through [`call`]; a panic
/// escaping it is still caught and logged here.
pub fn shield<T, F>(op: Op, sentinel: T, f: F) -> T
where
    F: FnOnce() -> Result<T, BridgeError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(_)) => sentinel,
        Err(payload) => {
            let err = op.panic_error(format!("panic: {}", panic_message(&*payload)));
            tracing::error!(component = COMPONENT, op = op.name(), "{}", err);
            set_last_error(err);
            sentinel
        }
    }
}

/// The last failure recorded on this thread, if the latest call failed.
pub fn last_error() -> Option<BridgeError> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

fn set_last_error(err: BridgeError) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err));
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BridgeStatus, HandleFault, HandleKind};

    #[test]
    fn test_success_clears_last_error() {
        let _ = call::<(), _>(Op::DestroySession, || {
            Err(BridgeError::EngineFault("x".to_string()))
        });
        assert!(last_error().is_some());

        assert_eq!(call(Op::DestroySession, || Ok(5)), Ok(5));
        assert!(last_error().is_none());
    }

    #[test]
    fn test_typed_error_passes_through() {
        let err = BridgeError::invalid_handle(HandleKind::Session, 9, HandleFault::Stale);
        let result: Result<(), _> = call(Op::DestroySession, || Err(err.clone()));
        assert_eq!(result, Err(err.clone()));
        assert_eq!(last_error(), Some(err));
    }

    #[test]
    fn test_panic_is_classified_per_operation() {
        let result: Result<u64, _> = call(Op::CreateSession, || panic!("model exploded"));
        assert_eq!(
            result,
            Err(BridgeError::InitializationFailure(
                "panic: model exploded".to_string()
            ))
        );

        let result: Result<u64, _> =
            call(Op::ChatCompletion, || panic!("{}", String::from("queue full")));
        assert_eq!(result.unwrap_err().status(), BridgeStatus::TaskCreationFailure);

        let result: Result<(), _> = call(Op::TryFetchResult, || std::panic::panic_any(42u8));
        assert_eq!(
            result,
            Err(BridgeError::EngineFault(
                "panic: unknown panic payload".to_string()
            ))
        );
    }

    #[test]
    fn test_shield_returns_sentinel() {
        assert_eq!(shield(Op::ChatCompletion, 0u64, || Ok(17)), 17);
        assert_eq!(
            shield(Op::ChatCompletion, 0u64, || Err(BridgeError::EngineFault(
                "x".to_string()
            ))),
            0
        );
        assert_eq!(shield(Op::ChatCompletion, 0u64, || panic!("boom")), 0);
        assert_eq!(
            last_error().map(|e| e.status()),
            Some(BridgeStatus::TaskCreationFailure)
        );
    }

    #[test]
    fn test_op_names() {
        assert_eq!(Op::CreateSession.to_string(), "create_session");
        assert_eq!(Op::TryFetchResult.name(), "try_fetch_result");
    }
}
