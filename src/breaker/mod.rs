//! Circuit breakers for outbound calls.
//!
//! A [`CircuitBreaker`] guards one destination key. The
//! [`CircuitBreakerGateway`] hands out breakers per key from a bounded,
//! idle-expiring cache and shuts evicted breakers down.

mod breaker;
mod error;
mod gateway;
mod window;

pub use breaker::{BreakerListener, BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use error::BreakerError;
pub use gateway::CircuitBreakerGateway;
