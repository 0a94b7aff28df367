//! Offline-first scanning device: durable outbox, local ledger view, and the
//! reconciler that pushes captures to the gate and pulls everyone else's.

pub mod client;
pub mod config;
pub mod local_view;
pub mod node;
pub mod outbox;
pub mod reconciler;

pub use client::{GateClient, HttpGateClient, InProcessGateClient, TransportError};
pub use node::{CaptureError, CaptureOutcome, DeviceNode, DeviceSettings, PushReport};
pub use outbox::{Outbox, OutboxConfig, OutboxError, OverflowPolicy, PendingEvent, PendingStatus};
pub use reconciler::{Reconciler, ReconcilerHandles, SyncConfig};
