//! Phase state machine: the single owner of a pipeline's canonical
//! `WorkflowSnapshot`.
//!
//! All mutations funnel through this type. It validates phase transitions,
//! applies field mutations (which bump the version but never change the
//! phase), and merges remote snapshots behind the version gate. No other
//! component reaches into the snapshot's fields directly.

use tracing::{debug, warn};

use crate::errors::WorkflowError;
use crate::model::{
    Actor, PHASE_ORDER, PhaseProgress, PhaseStatus, SchemaField, UrlInfo, UserModification,
    WorkflowPhase, WorkflowSnapshot, WorkflowTransition,
};

/// External authority for a non-linear phase move, typically a satisfied
/// approval. The machine only checks that an authority was supplied; judging
/// whether it covers the requested jump stays with the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionGrant {
    pub approval_id: String,
}

/// Outcome of merging a remote snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The incoming snapshot advanced the version and replaced local state.
    Applied,
    /// The incoming snapshot did not advance the version; nothing changed.
    Stale,
}

pub struct PhaseStateMachine {
    snapshot: WorkflowSnapshot,
}

impl PhaseStateMachine {
    /// Create a machine for a fresh pipeline in the initial phase.
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            snapshot: WorkflowSnapshot::new(pipeline_id),
        }
    }

    /// Adopt an existing snapshot, e.g. one fetched before going live.
    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &WorkflowSnapshot {
        &self.snapshot
    }

    pub(crate) fn snapshot_mut(&mut self) -> &mut WorkflowSnapshot {
        &mut self.snapshot
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Request a phase transition.
    ///
    /// Accepted iff the target is the immediate next phase, the target is
    /// `Error`, or the caller supplies an external authority. `Error` is
    /// terminal: nothing leaves it without an external reset. A rejection
    /// leaves the snapshot untouched.
    pub fn transition(
        &mut self,
        target: WorkflowPhase,
        reason: Option<String>,
        triggered_by: Actor,
        grant: Option<&TransitionGrant>,
    ) -> Result<(), WorkflowError> {
        let current = self.snapshot.phase;

        let allowed = if current == WorkflowPhase::Error {
            false
        } else if target == WorkflowPhase::Error {
            true
        } else if current.next() == Some(target) {
            true
        } else {
            grant.is_some()
        };

        if !allowed {
            debug!(
                attempted = target.as_str(),
                current = current.as_str(),
                "transition rejected"
            );
            return Err(WorkflowError::TransitionRejected {
                attempted: target,
                current,
            });
        }

        self.snapshot.phase_transitions.push(WorkflowTransition {
            from_phase: current,
            to_phase: target,
            timestamp: chrono::Utc::now(),
            reason,
            triggered_by,
        });
        self.snapshot.phase = target;
        self.snapshot.touch(triggered_by);
        Ok(())
    }

    // ── Field mutations (never change the phase) ─────────────────────

    /// Append URLs to the collection.
    pub fn add_urls(&mut self, urls: Vec<UrlInfo>, by: Actor) {
        let old = serde_json::to_value(&self.snapshot.urls).unwrap_or_default();
        self.snapshot.urls.extend(urls);
        self.snapshot.urls_validated = !self.snapshot.urls.is_empty()
            && self.snapshot.urls.iter().all(|u| u.validated);
        let new = serde_json::to_value(&self.snapshot.urls).unwrap_or_default();
        self.record_modification("urls", old, new, by);
        self.snapshot.touch(by);
    }

    /// Replace the schema field list wholesale.
    pub fn update_schema_fields(&mut self, fields: Vec<SchemaField>, by: Actor) {
        let old = serde_json::to_value(&self.snapshot.schema_fields).unwrap_or_default();
        self.snapshot.schema_fields = fields;
        let new = serde_json::to_value(&self.snapshot.schema_fields).unwrap_or_default();
        self.record_modification("schema_fields", old, new, by);
        self.snapshot.touch(by);
    }

    /// Append an audit entry for a manual field edit.
    fn record_modification(
        &mut self,
        field: &str,
        old_value: serde_json::Value,
        new_value: serde_json::Value,
        by: Actor,
    ) {
        self.snapshot.user_modifications.push(UserModification {
            field: field.to_string(),
            old_value,
            new_value,
            timestamp: chrono::Utc::now(),
            user: by,
        });
    }

    /// Replace the generated artifact. A new artifact is unvalidated until
    /// a human approves it.
    pub fn set_generated_code(&mut self, code: String, by: Actor) {
        self.snapshot.generated_code = code;
        self.snapshot.code_validated = false;
        self.snapshot.touch(by);
    }

    pub fn set_execution_results(
        &mut self,
        results: Vec<serde_json::Value>,
        status: Option<String>,
        by: Actor,
    ) {
        self.snapshot.execution_results = results;
        self.snapshot.execution_status = status;
        self.snapshot.touch(by);
    }

    // ── Remote merge ─────────────────────────────────────────────────

    /// Version-gated merge of a remote snapshot (push frame or
    /// request/response body). A version at or below the held one is
    /// discarded; a newer one replaces local state wholesale — there is no
    /// partial merge, which is what makes replays and reconnect races safe.
    pub fn merge_remote(&mut self, incoming: WorkflowSnapshot) -> MergeOutcome {
        if incoming.pipeline_id != self.snapshot.pipeline_id {
            warn!(
                expected = %self.snapshot.pipeline_id,
                actual = %incoming.pipeline_id,
                "ignoring snapshot for a different pipeline"
            );
            return MergeOutcome::Stale;
        }
        if incoming.version <= self.snapshot.version {
            debug!(
                held = self.snapshot.version,
                incoming = incoming.version,
                "discarding stale snapshot"
            );
            return MergeOutcome::Stale;
        }
        self.snapshot = incoming;
        MergeOutcome::Applied
    }

    // ── Derived views ────────────────────────────────────────────────

    /// Per-phase status over the linear order. When the workflow is in
    /// `Error`, every row reads `Error`.
    pub fn phase_statuses(&self) -> Vec<PhaseProgress> {
        let current = self.snapshot.phase;
        PHASE_ORDER
            .iter()
            .map(|&phase| {
                let status = if current == WorkflowPhase::Error {
                    PhaseStatus::Error
                } else {
                    // Both indices exist: neither phase is Error here.
                    let current_idx = current.progress_index().unwrap_or(0);
                    let idx = phase.progress_index().unwrap_or(0);
                    if idx < current_idx {
                        PhaseStatus::Completed
                    } else if idx == current_idx {
                        PhaseStatus::Active
                    } else {
                        PhaseStatus::Pending
                    }
                };
                PhaseProgress { phase, status }
            })
            .collect()
    }

    /// Overall progress fraction, as the backend reports it.
    pub fn progress(&self) -> f32 {
        self.snapshot.phase.weight()
    }
}
