//! Utility modules shared across the relay services

pub mod circuit_breaker;
pub mod status_code_matcher;
pub mod url;

pub use circuit_breaker::{
    CallOutcome, CallPermit, CircuitBreaker, CircuitBreakerError, CircuitBreakerState,
    CircuitBreakerStats, CircuitOpen,
};
