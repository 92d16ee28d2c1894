//! Upstream forwarding: the `messages` client with SSE reconstruction,
//! wrapped by the retry engine and the per-upstream circuit breaker.

pub mod breaker;
pub mod client;
pub mod error;
pub mod retry;
pub mod sse;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use client::{pump_stream, response_headers, UpstreamClient, UpstreamResponse};
pub use error::{Result, UpstreamError};
pub use retry::{retry_with, RetryConfig};
pub use sse::{ReconstructedResponse, StreamAssembler};
