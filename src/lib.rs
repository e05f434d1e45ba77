//! # tome-link
//!
//! Resilient message dispatch plus machine-to-machine synchronization.
//!
//! Two halves share one tracing history:
//!
//! - **RobotCopy** sends JSON messages to one of two HTTP backends, chosen by
//!   a feature toggle, with retry, circuit breaking and throttling. Every send
//!   carries trace/span/message ids and is recorded in an in-memory history.
//! - **TomeConnector** links state machines: events are filtered, transformed
//!   and renamed on the way across, state fragments are projected by dotted
//!   path into `SYNC_STATE` events, and the resulting topology can be checked
//!   for cycles, fan-out and event amplification.
//!
//! The HTTP seam is a Tower service ([`transport::Transport`]), so tests and
//! embedders can swap in `tower::service_fn` and stack layers such as
//! [`resilience::AdmissionLayer`].
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tome_link::{config::ConfigBuilder, RobotCopy, TomeConnector};
//!
//! # async fn example() -> tome_link::Result<()> {
//! let config = ConfigBuilder::new()
//!     .primary_backend("http://orders.internal")
//!     .max_retries(2)
//!     .build();
//! let robot_copy = Arc::new(RobotCopy::new(config));
//!
//! let reply = robot_copy
//!     .send_message("create-order", json!({ "id": 1 }))
//!     .await?;
//! println!("{reply}");
//!
//! let connector = TomeConnector::with_robot_copy(robot_copy);
//! connector.init().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod monitoring;
pub mod observability;
pub mod registry;
pub mod resilience;
pub mod retry;
pub mod robot_copy;
pub mod toggles;
pub mod token;
pub mod trace;
pub mod transport;

pub use config::{ConfigBuilder, RobotCopyConfig};
pub use connector::{
    ConnectionConfig, ConnectionInfo, Envelope, Machine, MachineEvent, NetworkTopology,
    TomeConnector, ValidationReport,
};
pub use error::{DispatchError, Result};
pub use monitoring::{DefaultResourceMonitor, ResourceMonitor};
pub use resilience::{AdmissionLayer, CircuitBreaker, ThrottlePolicy};
pub use retry::{RetryBuilder, RetryPolicy};
pub use robot_copy::{BackendKind, RobotCopy, RobotCopyBuilder};
pub use toggles::{StaticToggles, ToggleSource};
pub use trace::{Message, TraceInfo, Tracing, TrackedData};
pub use transport::{BoxTransport, HttpTransport, Transport, TransportRequest, TransportResponse};

// Re-export tower for building custom transports
pub use tower::{Layer, Service, ServiceExt};
