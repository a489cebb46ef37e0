//! Shared helpers for tests.
//!
//! - `Once`-guarded tracing initialization
//! - Deterministic virtual-time runtime constructors
//! - A one-call async test driver

use crate::cx::Cx;
use crate::error::Error;
use crate::runtime::{Runtime, RuntimeConfig};
use std::future::Future;
use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Initializes trace-level test logging. Safe to call repeatedly; the first
/// call wins.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// A runtime on the deterministic virtual clock.
#[must_use]
pub fn test_runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig::virtual_time())
}

/// Runs an async test body on a fresh virtual-time runtime and unwraps its
/// result.
///
/// # Panics
///
/// Panics if the body fails, is cancelled, or panics.
pub fn run_test<T, F, Fut>(body: F) -> T
where
    F: FnOnce(Cx) -> Fut,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
    T: Send + 'static,
{
    init_test_logging();
    let rt = test_runtime();
    rt.block_on(body).unwrap()
}
