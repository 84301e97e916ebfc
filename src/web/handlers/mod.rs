//! HTTP request handlers organized by domain

pub mod circuit_breaker;
pub mod health;
pub mod relays;
pub mod stream;
pub mod streams;
