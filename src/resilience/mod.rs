//! Resilience primitives.
//!
//! - [`breaker`]: cache-backed attempt counter with cooldown (shared across processes)
//! - [`circuit_breaker`]: in-process fail-fast per backend
//! - [`retry`]: bounded retry with exponential backoff

pub mod breaker;
pub mod circuit_breaker;
pub mod retry;
