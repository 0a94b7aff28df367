//! Framework-free HTTP handling for the ingestion service.
//!
//! Requests are plain [`HttpRequest`] values so the routing table can be
//! exercised without a socket; `transport_axum` adapts it to a listener.

mod http;
mod request;
mod routes;

pub use http::{HttpRequest, HttpResponse};
pub use routes::handle_request;
pub(crate) use routes::{map_gate_error, map_registry_error};

pub const MAX_HTTP_BODY_BYTES: usize = 4 * 1024 * 1024;
