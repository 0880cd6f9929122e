//! Inbound frame classification.
//!
//! Every frame off the push channel is parsed as JSON and classified by its
//! `type` discriminant into exactly one category. A frame that fails to
//! parse is logged and dropped — it never propagates as a mutation. Unknown
//! types are ignored, never fatal: the server is free to grow new message
//! kinds without breaking older clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{Approval, WorkflowPhase, WorkflowSnapshot};

// ── Inbound ──────────────────────────────────────────────────────────

/// Scraping progress payload of an `execution_update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub status: String,
    #[serde(default)]
    pub current_url: Option<String>,
    #[serde(default)]
    pub completed: Option<u32>,
    #[serde(default)]
    pub total: Option<u32>,
}

/// Streamed agent chat output carried by a `response` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub message_id: String,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub is_complete: bool,
}

/// One classified inbound frame. Each variant maps to exactly one handler
/// in the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Full snapshot in reply to a `state_request` (`workflow_state`).
    FullState { workflow: WorkflowSnapshot },
    /// Server-pushed snapshot update (`state_update` / `workflow_update`).
    StateUpdate {
        workflow: WorkflowSnapshot,
        progress: Option<f32>,
    },
    /// The agent wants a human decision before proceeding.
    ApprovalRequest {
        approval: Approval,
        workflow_phase: Option<WorkflowPhase>,
    },
    /// Scraping progress while the pipeline executes.
    ExecutionUpdate(ExecutionUpdate),
    /// Server-side error notification. Surfaced to observers as a distinct
    /// signal, never folded into the snapshot.
    Error { message: String },
    /// Streamed agent chat output for the conversation store.
    AgentResponse(AgentResponse),
    /// Valid JSON with a `type` this client does not know. Ignored.
    Unrecognized { kind: String },
}

/// Parse and classify a raw frame. Returns `None` for frames that are not
/// valid JSON, lack a `type`, or whose payload does not match the declared
/// type — all of which are dropped here.
pub fn classify(raw: &str) -> Option<InboundMessage> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping unparsable frame");
            return None;
        }
    };

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(k) => k.to_string(),
        None => {
            warn!("dropping frame without a type discriminant");
            return None;
        }
    };

    let result = match kind.as_str() {
        "workflow_state" => field(&value, "workflow").map(|workflow| InboundMessage::FullState { workflow }),
        "state_update" | "workflow_update" => {
            field(&value, "workflow").map(|workflow| InboundMessage::StateUpdate {
                workflow,
                progress: value.get("progress").and_then(Value::as_f64).map(|p| p as f32),
            })
        }
        "approval_request" => field(&value, "approval").map(|approval| InboundMessage::ApprovalRequest {
            approval,
            workflow_phase: value
                .get("workflow_phase")
                .and_then(|p| serde_json::from_value(p.clone()).ok()),
        }),
        "execution_update" => {
            serde_json::from_value(value.clone()).ok().map(InboundMessage::ExecutionUpdate)
        }
        "error" => value
            .get("message")
            .and_then(Value::as_str)
            .map(|message| InboundMessage::Error {
                message: message.to_string(),
            }),
        "response" => serde_json::from_value(value.clone())
            .ok()
            .map(InboundMessage::AgentResponse),
        _ => {
            debug!(kind = %kind, "ignoring unrecognized frame type");
            return Some(InboundMessage::Unrecognized { kind });
        }
    };

    if result.is_none() {
        warn!(kind = %kind, "dropping frame with malformed payload");
    }
    result
}

fn field<T: serde::de::DeserializeOwned>(value: &Value, name: &str) -> Option<T> {
    value
        .get(name)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

// ── Outbound ─────────────────────────────────────────────────────────

/// Frames this client sends over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Ask for a fresh full snapshot; sent after every reconnect.
    StateRequest,
    /// One half of the dual-channel approval resolution.
    Approval {
        approval_id: String,
        approved: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// User chat input for the agent.
    Chat { message: String },
}

impl OutboundMessage {
    pub fn to_frame(&self) -> String {
        // Serialization of these variants cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
