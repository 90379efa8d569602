//! OpenAI-compatible API surface: wire types, SSE framing, endpoint drivers.
//!
//! No HTTP server lives here. An embedding server deserializes requests into
//! [`protocol`] types, calls the [`ApiHandler`] and hands streamed endpoints
//! its response body writer.

mod handler;
pub mod protocol;
pub mod sse;
mod system;

pub use handler::{AdmissionGates, ApiHandler, StreamOutcome, MODEL_OWNER};
pub use sse::{StreamEncoder, StreamState, DONE_SENTINEL};
pub use system::{AcceleratorSnapshot, HealthState, SystemSnapshot};
