//! Workflow synchronization core for agent-assisted scraping pipelines.
//!
//! Keeps a client's view of a pipeline consistent with the backend over
//! two channels: a push WebSocket for server-initiated updates and a
//! request/response REST surface for client-initiated mutations. One
//! [`sync::WorkflowSync`] instance per pipeline owns the canonical
//! snapshot and exposes a broadcast stream of [`sync::SyncEvent`]s to
//! observers.

pub mod api;
pub mod approval;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod machine;
pub mod model;
pub mod sync;
pub mod transport;

pub use approval::Resolution;
pub use config::SyncConfig;
pub use errors::{ApiError, SyncError, TransportError, WorkflowError};
pub use machine::{MergeOutcome, PhaseStateMachine, TransitionGrant};
pub use model::{
    Actor, Approval, ApprovalStatus, SchemaField, UrlInfo, WorkflowPhase, WorkflowSnapshot,
};
pub use sync::{SyncEvent, WorkflowSync};
pub use transport::{ConnectionState, ConnectionStatus, ReconnectPolicy};
