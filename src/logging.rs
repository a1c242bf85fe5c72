//! Log subscriber setup
//!
//! The host loads the bridge as a library, so nothing installs a subscriber for
//! us. `init` may be called any number of times; only the first one wins.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the log filter, e.g. `serve_bridge=debug`
pub const LOG_ENV: &str = "SERVE_BRIDGE_LOG";

/// Filter used when `SERVE_BRIDGE_LOG` is unset or unparsable
pub const DEFAULT_FILTER: &str = "serve_bridge=info";

/// Builds the filter from `SERVE_BRIDGE_LOG`, falling back to [`DEFAULT_FILTER`].
pub fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a formatting subscriber as the global default.
pub fn init() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter())
        .try_init()?;

    tracing::info!("serve-bridge v{} logging initialized", env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected_not_fatal() {
        // Whether or not this call wins, a subscriber is installed afterwards.
        let _ = init();
        assert!(init().is_err());
    }

    #[test]
    fn test_default_filter_parses() {
        let filter = EnvFilter::new(DEFAULT_FILTER);
        assert!(filter.to_string().contains("serve_bridge=info"));
    }
}
