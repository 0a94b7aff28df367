//! Authoritative scan ledger service: ingestion gate, projections, HTTP API.

pub mod api;
pub mod config;
pub mod gate;
pub mod projection;
pub mod runtime;
pub mod sweep;
pub mod transport;
pub mod transport_axum;

pub use gate::{GateConfig, GateDecision, GateError, IngestionGate};
pub use runtime::{IngestionRuntime, RuntimeOptions, SharedRuntime, SweepReport};
