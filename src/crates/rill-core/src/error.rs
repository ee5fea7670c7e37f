//! Error types for the runtime core.
//!
//! Effect bodies fail with [`BoxError`] — an opaque, consumer-defined error.
//! Those errors never cross the scheduler boundary as `Err`: they are either
//! converted to a substitute output by an `on_error` handler or logged and
//! swallowed. The only error the core itself surfaces is [`DispatchError`],
//! returned when a caller talks to a runtime that has already shut down.

use thiserror::Error;

/// Boxed error produced by effect bodies.
///
/// The core treats it as opaque: it is handed to the descriptor's `on_error`
/// handler when one is present, and logged otherwise.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience result type using [`DispatchError`].
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by the dispatcher's public entry points.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The dispatcher has shut down and no longer accepts actions.
    #[error("dispatcher is shut down")]
    Closed,
}
