//! Resilience primitives composed by RobotCopy
//!
//! - `CircuitBreaker`: three-state gate over a unit of work
//! - `ThrottlePolicy`: sliding-window admission over request count and bytes
//! - `AdmissionLayer`: both of the above plus a monitor, as tower middleware
//!
//! Retry with backoff lives in [`crate::retry`].

pub mod admission;
pub mod circuit_breaker;
pub mod throttle;

pub use admission::{Admission, AdmissionLayer};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerStatus};
pub use throttle::{ThrottlePolicy, WindowUsage};
