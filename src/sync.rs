//! Synchronization engine: one instance per pipeline.
//!
//! Owns the canonical snapshot (behind the state machine), the approval
//! coordinator, and the push-channel transport. A single driver task
//! consumes transport events and applies them under the state lock, so
//! every mutation — local call, push frame, or request/response body —
//! funnels through one serialization point. Observers subscribe to a
//! broadcast stream of [`SyncEvent`]s; a slow observer loses events, never
//! blocks the engine.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApprovalDecision, TransitionRequest, WorkflowApi, WorkflowHistory};
use crate::approval::{ApprovalCoordinator, Resolution};
use crate::config::SyncConfig;
use crate::dispatch::{
    AgentResponse, ExecutionUpdate, InboundMessage, OutboundMessage, classify,
};
use crate::errors::SyncError;
use crate::machine::{MergeOutcome, PhaseStateMachine, TransitionGrant};
use crate::model::{
    Actor, Approval, ApprovalStatus, PhaseProgress, SchemaField, UrlInfo, WorkflowPhase,
    WorkflowSnapshot,
};
use crate::transport::{
    ConnectionState, ConnectionStatus, TransportEvent, TransportHandle, TransportManager,
};

// ── Observer events ──────────────────────────────────────────────────

/// What observers see. Every state change surfaces here regardless of
/// which channel caused it.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The snapshot changed (local mutation or remote merge). `progress`
    /// is the server-reported fraction when the update carried one, else
    /// the phase weight.
    SnapshotChanged {
        version: u64,
        phase: WorkflowPhase,
        progress: f32,
    },
    /// A new approval is awaiting a human decision.
    ApprovalRequested(Approval),
    /// An approval reached a terminal status.
    ApprovalResolved {
        approval_id: String,
        status: ApprovalStatus,
    },
    /// Scraping progress while the pipeline executes. Not part of the
    /// snapshot; consumers render it directly.
    ExecutionProgress(ExecutionUpdate),
    /// Streamed agent chat output.
    AgentResponse(AgentResponse),
    /// Server-side error notification.
    ServerError { message: String },
    /// Push-channel connectivity change.
    Connectivity(ConnectionStatus),
    /// The transport gave up reconnecting; a manual `connect` is needed.
    ReconnectsExhausted,
}

const EVENT_CAPACITY: usize = 256;

struct SyncState {
    machine: PhaseStateMachine,
    coordinator: ApprovalCoordinator,
}

// ── Engine ───────────────────────────────────────────────────────────

/// Synchronization engine for one pipeline.
pub struct WorkflowSync {
    pipeline_id: String,
    api: WorkflowApi,
    transport: TransportManager,
    handle: TransportHandle,
    state: Arc<Mutex<SyncState>>,
    events: broadcast::Sender<SyncEvent>,
    driver: Option<JoinHandle<()>>,
}

impl WorkflowSync {
    pub fn new(config: &SyncConfig, pipeline_id: impl Into<String>) -> Self {
        let pipeline_id = pipeline_id.into();
        let (transport, transport_rx) =
            TransportManager::new(config.ws_url(&pipeline_id), config.reconnect.clone());
        let handle = transport.handle();

        let ttl = config
            .approval_ttl_secs
            .map(|secs| ChronoDuration::seconds(secs as i64));
        let state = Arc::new(Mutex::new(SyncState {
            machine: PhaseStateMachine::new(pipeline_id.clone()),
            coordinator: ApprovalCoordinator::new(ttl),
        }));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let driver = tokio::spawn(drive(
            transport_rx,
            handle.clone(),
            Arc::clone(&state),
            events.clone(),
        ));

        Self {
            pipeline_id,
            api: WorkflowApi::new(config.api_base.clone()),
            transport,
            handle,
            state,
            events,
            driver: Some(driver),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Subscribe to the observer stream. Events sent before subscription
    /// are not replayed; read the snapshot for current state.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // ── Connectivity ─────────────────────────────────────────────────

    /// Open the push channel. At most one connection exists per pipeline;
    /// calling this while connected tears the old connection down first.
    pub async fn connect(&mut self) {
        info!(pipeline_id = %self.pipeline_id, "opening push channel");
        self.transport.connect().await;
    }

    /// Close the push channel and cancel any pending reconnect.
    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.transport.state().await
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> WorkflowSnapshot {
        self.state.lock().await.machine.snapshot().clone()
    }

    pub async fn phase_statuses(&self) -> Vec<PhaseProgress> {
        self.state.lock().await.machine.phase_statuses()
    }

    pub async fn progress(&self) -> f32 {
        self.state.lock().await.machine.progress()
    }

    /// Fetch the transition and approval history from the backend.
    pub async fn history(&self) -> Result<WorkflowHistory, SyncError> {
        Ok(self.api.history(&self.pipeline_id).await?)
    }

    /// Fetch a fresh snapshot over the request/response channel and merge
    /// it through the version gate.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let incoming = self.api.fetch_workflow(&self.pipeline_id).await?;
        self.merge_and_announce(incoming).await;
        Ok(())
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Add URLs locally and submit the full list to the backend. The
    /// response snapshot merges through the version gate, so a racing
    /// push frame can never be undone by a slow response.
    pub async fn update_urls(&self, urls: Vec<UrlInfo>) -> Result<WorkflowSnapshot, SyncError> {
        let all_urls = {
            let mut state = self.state.lock().await;
            state.machine.add_urls(urls, Actor::User);
            self.announce_snapshot(state.machine.snapshot());
            state.machine.snapshot().urls.clone()
        };

        let incoming = self.api.update_urls(&self.pipeline_id, &all_urls).await?;
        self.merge_and_announce(incoming).await;
        Ok(self.snapshot().await)
    }

    /// Replace the schema definition locally and submit it to the backend.
    pub async fn update_schema_fields(
        &self,
        fields: Vec<SchemaField>,
    ) -> Result<WorkflowSnapshot, SyncError> {
        {
            let mut state = self.state.lock().await;
            state.machine.update_schema_fields(fields.clone(), Actor::User);
            self.announce_snapshot(state.machine.snapshot());
        }

        let incoming = self.api.update_schema(&self.pipeline_id, &fields).await?;
        self.merge_and_announce(incoming).await;
        Ok(self.snapshot().await)
    }

    /// Request a phase transition. Validated locally first; a rejection
    /// never reaches the backend. The backend call is best-effort — if it
    /// fails, the next snapshot exchange reconciles.
    pub async fn request_transition(
        &self,
        target: WorkflowPhase,
        reason: Option<String>,
        grant: Option<&TransitionGrant>,
    ) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock().await;
            state
                .machine
                .transition(target, reason.clone(), Actor::User, grant)?;
            self.announce_snapshot(state.machine.snapshot());
        }

        let request = TransitionRequest {
            target_phase: target,
            reason,
        };
        match self.api.transition(&self.pipeline_id, &request).await {
            Ok(incoming) => self.merge_and_announce(incoming).await,
            Err(e) => warn!(error = %e, "transition submission failed; awaiting reconcile"),
        }
        Ok(())
    }

    /// Ask for a human decision gating an agent-proposed action.
    pub async fn request_approval(&self, action: impl Into<String>, data: Value) -> Approval {
        let mut state = self.state.lock().await;
        let SyncState {
            machine,
            coordinator,
        } = &mut *state;
        let approval = coordinator.request(machine.snapshot_mut(), action, data, None);
        let _ = self.events.send(SyncEvent::ApprovalRequested(approval.clone()));
        self.announce_snapshot(machine.snapshot());
        approval
    }

    /// Resolve an approval and submit the decision over both channels.
    ///
    /// The resolution is applied locally exactly once; both submissions are
    /// tolerated to fail since either channel reaching the backend is
    /// enough, and the backend treats repeats as no-ops.
    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> Resolution {
        let resolution = {
            let mut state = self.state.lock().await;
            let SyncState {
                machine,
                coordinator,
            } = &mut *state;
            // Sweep before resolving so an expiry that happens here is
            // announced, not silently folded into the resolution.
            let expired = coordinator.expire_overdue(machine.snapshot_mut(), chrono::Utc::now());
            self.announce_expired(&expired, machine.snapshot());
            let resolution = coordinator.resolve(
                machine.snapshot_mut(),
                approval_id,
                approved,
                reason.clone(),
                Actor::User,
            );
            if let Resolution::Applied { status, .. } = &resolution {
                let _ = self.events.send(SyncEvent::ApprovalResolved {
                    approval_id: approval_id.to_string(),
                    status: *status,
                });
                self.announce_snapshot(machine.snapshot());
            }
            resolution
        };

        if !matches!(resolution, Resolution::Applied { .. }) {
            return resolution;
        }

        // Push-channel half.
        let frame = OutboundMessage::Approval {
            approval_id: approval_id.to_string(),
            approved,
            reason: reason.clone(),
        };
        if let Err(e) = self.handle.send(frame.to_frame()).await {
            debug!(error = %e, "approval frame not sent; request/response half remains");
        }

        // Request/response half.
        let decision = ApprovalDecision {
            approval_id: approval_id.to_string(),
            approved,
            reason,
        };
        match self.api.approve(&self.pipeline_id, &decision).await {
            Ok(incoming) => self.merge_and_announce(incoming).await,
            Err(e) => warn!(error = %e, "approval submission failed; awaiting reconcile"),
        }

        resolution
    }

    /// Move overdue pending approvals to history as expired.
    pub async fn expire_overdue_approvals(&self) -> Vec<Approval> {
        let mut state = self.state.lock().await;
        let SyncState {
            machine,
            coordinator,
        } = &mut *state;
        let expired = coordinator.expire_overdue(machine.snapshot_mut(), chrono::Utc::now());
        self.announce_expired(&expired, machine.snapshot());
        expired
    }

    /// Send user chat input to the agent over the push channel.
    pub async fn send_chat(&self, message: impl Into<String>) -> Result<(), SyncError> {
        let frame = OutboundMessage::Chat {
            message: message.into(),
        };
        Ok(self.handle.send(frame.to_frame()).await?)
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn merge_and_announce(&self, incoming: WorkflowSnapshot) {
        let mut state = self.state.lock().await;
        if state.machine.merge_remote(incoming) == MergeOutcome::Applied {
            self.announce_snapshot(state.machine.snapshot());
        }
    }

    fn announce_snapshot(&self, snapshot: &WorkflowSnapshot) {
        let _ = self.events.send(SyncEvent::SnapshotChanged {
            version: snapshot.version,
            phase: snapshot.phase,
            progress: snapshot.phase.weight(),
        });
    }

    fn announce_expired(&self, expired: &[Approval], snapshot: &WorkflowSnapshot) {
        for approval in expired {
            let _ = self.events.send(SyncEvent::ApprovalResolved {
                approval_id: approval.id.clone(),
                status: ApprovalStatus::Expired,
            });
        }
        if !expired.is_empty() {
            self.announce_snapshot(snapshot);
        }
    }
}

impl Drop for WorkflowSync {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

// ── Driver task ──────────────────────────────────────────────────────

/// Consume transport events for the lifetime of the engine, across every
/// reconnect.
async fn drive(
    mut transport_rx: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    handle: TransportHandle,
    state: Arc<Mutex<SyncState>>,
    events: broadcast::Sender<SyncEvent>,
) {
    while let Some(event) = transport_rx.recv().await {
        match event {
            TransportEvent::Connecting => {
                let _ = events.send(SyncEvent::Connectivity(ConnectionStatus::Connecting));
            }
            TransportEvent::Connected => {
                let _ = events.send(SyncEvent::Connectivity(ConnectionStatus::Connected));
                // Reconcile: anything missed while disconnected is covered
                // by one full snapshot.
                if let Err(e) = handle.send(OutboundMessage::StateRequest.to_frame()).await {
                    warn!(error = %e, "state request not sent after connect");
                }
            }
            TransportEvent::Frame(raw) => {
                if let Some(message) = classify(&raw) {
                    apply_inbound(message, &state, &events).await;
                }
            }
            TransportEvent::Disconnected => {
                let _ = events.send(SyncEvent::Connectivity(ConnectionStatus::Disconnected));
            }
            TransportEvent::ReconnectsExhausted => {
                let _ = events.send(SyncEvent::ReconnectsExhausted);
            }
        }
    }
}

async fn apply_inbound(
    message: InboundMessage,
    state: &Arc<Mutex<SyncState>>,
    events: &broadcast::Sender<SyncEvent>,
) {
    match message {
        InboundMessage::FullState { workflow } => {
            merge_pushed(workflow, None, state, events).await;
        }
        InboundMessage::StateUpdate { workflow, progress } => {
            merge_pushed(workflow, progress, state, events).await;
        }
        InboundMessage::ApprovalRequest { approval, .. } => {
            let mut state = state.lock().await;
            let SyncState {
                machine,
                coordinator,
            } = &mut *state;
            if coordinator.accept_remote(machine.snapshot_mut(), approval.clone()) {
                let _ = events.send(SyncEvent::ApprovalRequested(approval));
                let snapshot = machine.snapshot();
                let _ = events.send(SyncEvent::SnapshotChanged {
                    version: snapshot.version,
                    phase: snapshot.phase,
                    progress: snapshot.phase.weight(),
                });
            }
        }
        InboundMessage::ExecutionUpdate(update) => {
            let _ = events.send(SyncEvent::ExecutionProgress(update));
        }
        InboundMessage::Error { message } => {
            warn!(message = %message, "server reported an error");
            let _ = events.send(SyncEvent::ServerError { message });
        }
        InboundMessage::AgentResponse(response) => {
            let _ = events.send(SyncEvent::AgentResponse(response));
        }
        InboundMessage::Unrecognized { .. } => {}
    }
}

async fn merge_pushed(
    workflow: WorkflowSnapshot,
    progress: Option<f32>,
    state: &Arc<Mutex<SyncState>>,
    events: &broadcast::Sender<SyncEvent>,
) {
    let mut state = state.lock().await;
    if state.machine.merge_remote(workflow) == MergeOutcome::Applied {
        let snapshot = state.machine.snapshot();
        let _ = events.send(SyncEvent::SnapshotChanged {
            version: snapshot.version,
            phase: snapshot.phase,
            progress: progress.unwrap_or_else(|| snapshot.phase.weight()),
        });
    }
}
