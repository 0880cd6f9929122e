//! Typed error hierarchy for the synchronization core.
//!
//! Three top-level enums cover the three subsystems:
//! - `TransportError` — push-channel (WebSocket) failures
//! - `WorkflowError` — phase state machine rejections
//! - `ApiError` — request/response channel failures
//!
//! `SyncError` is the union returned by the engine's public entry points.

use thiserror::Error;

use crate::model::WorkflowPhase;

/// Errors from the push-channel transport.
///
/// A dropped send is retryable: callers are expected to read the connection
/// state, treat `NotConnected` as "try again later", and rely on the
/// post-reconnect full-state refetch for anything lost in between.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected; frame dropped")]
    NotConnected,

    #[error("connection task is gone; frame dropped")]
    SendFailed,
}

/// Errors from the phase state machine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A transition request violated the transition rule. The snapshot is
    /// left untouched; the variant names both phases so the rejection can be
    /// explained to the user verbatim.
    #[error("transition to '{attempted}' rejected: workflow is in phase '{current}'")]
    TransitionRejected {
        attempted: WorkflowPhase,
        current: WorkflowPhase,
    },
}

/// Errors from the request/response channel.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// Union error for the engine's public entry points.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_rejected_names_both_phases() {
        let err = WorkflowError::TransitionRejected {
            attempted: WorkflowPhase::Executing,
            current: WorkflowPhase::SchemaDefinition,
        };
        let msg = err.to_string();
        assert!(msg.contains("executing"));
        assert!(msg.contains("schema_definition"));
    }

    #[test]
    fn transport_not_connected_is_matchable() {
        let err = TransportError::NotConnected;
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[test]
    fn api_status_carries_code_and_body() {
        let err = ApiError::Status {
            status: 404,
            message: "Workflow not found".to_string(),
        };
        match &err {
            ApiError::Status { status, message } => {
                assert_eq!(*status, 404);
                assert!(message.contains("not found"));
            }
            _ => panic!("Expected Status variant"),
        }
    }

    #[test]
    fn sync_error_converts_from_workflow_error() {
        let inner = WorkflowError::TransitionRejected {
            attempted: WorkflowPhase::Error,
            current: WorkflowPhase::Error,
        };
        let err: SyncError = inner.into();
        assert!(matches!(
            err,
            SyncError::Workflow(WorkflowError::TransitionRejected { .. })
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TransportError::NotConnected);
        assert_std_error(&WorkflowError::TransitionRejected {
            attempted: WorkflowPhase::Initial,
            current: WorkflowPhase::Initial,
        });
        assert_std_error(&SyncError::Transport(TransportError::SendFailed));
    }
}
