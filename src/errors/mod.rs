//! Centralized error handling for the relay service
//!
//! Each layer owns a `thiserror` enum; [`AppError`] is the top-level type used
//! at the web boundary.
//!
//! # Error Categories
//!
//! - **Relay Errors**: session lifecycle, channel resolution, upstream failures
//! - **Probe Errors**: external media probe failures (cacheable)
//! - **Validation Errors**: bad input at the API boundary
//!
//! # Usage
//!
//! ```rust
//! use m3u_relay::errors::{AppError, AppResult};
//!
//! fn example_function() -> AppResult<String> {
//!     Err(AppError::validation("url must not be empty"))
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
