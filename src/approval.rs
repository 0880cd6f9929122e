//! Approval coordinator: at-most-once resolution of human approvals.
//!
//! The UI deliberately submits the same resolution over both channels (push
//! frame and request/response call) to hide latency, so `resolve` must be
//! idempotent per approval id: the first call wins, every later call is a
//! benign no-op that reports the recorded outcome. Resolution bookkeeping
//! lives in the snapshot's two approval lists, which the coordinator is
//! handed by reference; it never touches any other snapshot field.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::machine::TransitionGrant;
use crate::model::{Actor, Approval, ApprovalStatus, WorkflowSnapshot};

/// Outcome of a `resolve` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// This call performed the resolution. When approved, carries the grant
    /// the caller may use to authorize the gated transition — resolving
    /// never performs the gated action itself.
    Applied {
        status: ApprovalStatus,
        grant: Option<TransitionGrant>,
    },
    /// The approval was already terminal (resolved or expired); nothing
    /// changed. Carries the recorded status.
    AlreadyResolved(ApprovalStatus),
    /// No approval with this id was ever seen.
    Unknown,
}

pub struct ApprovalCoordinator {
    default_ttl: Option<Duration>,
}

impl ApprovalCoordinator {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self { default_ttl }
    }

    /// Create a pending approval gating an agent-proposed action and append
    /// it to the snapshot's pending set. The caller is responsible for
    /// surfacing it to observers.
    pub fn request(
        &self,
        snapshot: &mut WorkflowSnapshot,
        action: impl Into<String>,
        data: Value,
        ttl: Option<Duration>,
    ) -> Approval {
        let now = Utc::now();
        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            phase: snapshot.phase,
            action: action.into(),
            data,
            created_at: now,
            expires_at: ttl.or(self.default_ttl).map(|t| now + t),
            status: ApprovalStatus::Pending,
            reason: None,
        };
        info!(approval_id = %approval.id, action = %approval.action, "approval requested");
        snapshot.pending_approvals.push(approval.clone());
        snapshot.touch(Actor::Agent);
        approval
    }

    /// Admit a server-announced approval into the pending set.
    ///
    /// Idempotent under replay: an id already pending or already in history
    /// is ignored. Returns whether the approval was newly admitted.
    pub fn accept_remote(&self, snapshot: &mut WorkflowSnapshot, approval: Approval) -> bool {
        if snapshot.pending_approval(&approval.id).is_some()
            || snapshot.historical_approval(&approval.id).is_some()
        {
            debug!(approval_id = %approval.id, "duplicate approval request ignored");
            return false;
        }
        snapshot.pending_approvals.push(approval);
        snapshot.touch(Actor::Agent);
        true
    }

    /// Resolve a pending approval. The only way an approval leaves the
    /// pending set besides expiry.
    ///
    /// Safe to call any number of times for the same id regardless of which
    /// channel delivered the call: only the first moves the approval to
    /// history; repeats return the recorded outcome.
    pub fn resolve(
        &self,
        snapshot: &mut WorkflowSnapshot,
        approval_id: &str,
        approved: bool,
        reason: Option<String>,
        by: Actor,
    ) -> Resolution {
        // Overdue approvals become terminal before the decision is applied,
        // so a late resolution of an expired approval is a no-op.
        self.expire_overdue(snapshot, Utc::now());

        if let Some(idx) = snapshot
            .pending_approvals
            .iter()
            .position(|a| a.id == approval_id)
        {
            let mut approval = snapshot.pending_approvals.remove(idx);
            approval.status = if approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Rejected
            };
            approval.reason = reason;
            let status = approval.status;
            info!(approval_id, status = status.as_str(), "approval resolved");
            snapshot.approval_history.push(approval);
            snapshot.touch(by);

            let grant = approved.then(|| TransitionGrant {
                approval_id: approval_id.to_string(),
            });
            return Resolution::Applied { status, grant };
        }

        if let Some(recorded) = snapshot.historical_approval(approval_id) {
            debug!(
                approval_id,
                status = recorded.status.as_str(),
                "resolution for already-terminal approval ignored"
            );
            return Resolution::AlreadyResolved(recorded.status);
        }

        Resolution::Unknown
    }

    /// Move every overdue pending approval to history as `expired`.
    /// Returns the approvals that expired on this touch.
    pub fn expire_overdue(
        &self,
        snapshot: &mut WorkflowSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<Approval> {
        let mut expired = Vec::new();
        let mut idx = 0;
        while idx < snapshot.pending_approvals.len() {
            if snapshot.pending_approvals[idx].is_expired(now) {
                let mut approval = snapshot.pending_approvals.remove(idx);
                approval.status = ApprovalStatus::Expired;
                info!(approval_id = %approval.id, "approval expired");
                snapshot.approval_history.push(approval.clone());
                expired.push(approval);
            } else {
                idx += 1;
            }
        }
        if !expired.is_empty() {
            snapshot.touch(Actor::System);
        }
        expired
    }
}

impl Default for ApprovalCoordinator {
    fn default() -> Self {
        Self::new(Some(Duration::minutes(5)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (ApprovalCoordinator, WorkflowSnapshot) {
        (ApprovalCoordinator::new(None), WorkflowSnapshot::new("p1"))
    }

    #[test]
    fn request_appends_pending_with_current_phase() {
        let (coordinator, mut snapshot) = setup();
        let approval = coordinator.request(
            &mut snapshot,
            "validate_urls",
            json!({"count": 3}),
            None,
        );
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert_eq!(approval.phase, snapshot.phase);
        assert_eq!(snapshot.pending_approvals.len(), 1);
        assert!(snapshot.approval_sets_disjoint());
    }

    #[test]
    fn default_ttl_sets_expiry() {
        let coordinator = ApprovalCoordinator::default();
        let mut snapshot = WorkflowSnapshot::new("p1");
        let approval = coordinator.request(&mut snapshot, "execute_code", json!({}), None);
        assert!(approval.expires_at.is_some());
    }

    #[test]
    fn first_resolution_wins() {
        let (coordinator, mut snapshot) = setup();
        let approval = coordinator.request(&mut snapshot, "approve_schema", json!({}), None);

        let first = coordinator.resolve(&mut snapshot, &approval.id, true, None, Actor::User);
        match first {
            Resolution::Applied { status, grant } => {
                assert_eq!(status, ApprovalStatus::Approved);
                assert_eq!(grant.unwrap().approval_id, approval.id);
            }
            other => panic!("Expected Applied, got {:?}", other),
        }

        // The racing second channel tries the opposite decision.
        let second = coordinator.resolve(
            &mut snapshot,
            &approval.id,
            false,
            Some("changed my mind".to_string()),
            Actor::User,
        );
        assert_eq!(second, Resolution::AlreadyResolved(ApprovalStatus::Approved));

        // Exactly one history entry, none pending.
        assert_eq!(snapshot.approval_history.len(), 1);
        assert!(snapshot.pending_approvals.is_empty());
        assert_eq!(
            snapshot.approval_history[0].status,
            ApprovalStatus::Approved
        );
    }

    #[test]
    fn resolve_is_idempotent_over_many_calls() {
        let (coordinator, mut snapshot) = setup();
        let approval = coordinator.request(&mut snapshot, "execute_code", json!({}), None);

        coordinator.resolve(&mut snapshot, &approval.id, false, None, Actor::User);
        let after_one = (
            snapshot.approval_history.clone(),
            snapshot.pending_approvals.clone(),
        );

        for _ in 0..10 {
            let res = coordinator.resolve(&mut snapshot, &approval.id, false, None, Actor::User);
            assert_eq!(res, Resolution::AlreadyResolved(ApprovalStatus::Rejected));
        }
        assert_eq!(snapshot.approval_history, after_one.0);
        assert_eq!(snapshot.pending_approvals, after_one.1);
    }

    #[test]
    fn rejection_carries_no_grant() {
        let (coordinator, mut snapshot) = setup();
        let approval = coordinator.request(&mut snapshot, "execute_code", json!({}), None);
        match coordinator.resolve(&mut snapshot, &approval.id, false, None, Actor::User) {
            Resolution::Applied { status, grant } => {
                assert_eq!(status, ApprovalStatus::Rejected);
                assert!(grant.is_none());
            }
            other => panic!("Expected Applied, got {:?}", other),
        }
    }

    #[test]
    fn unknown_id_is_reported() {
        let (coordinator, mut snapshot) = setup();
        let res = coordinator.resolve(&mut snapshot, "nope", true, None, Actor::User);
        assert_eq!(res, Resolution::Unknown);
    }

    #[test]
    fn overdue_approval_expires_on_touch_and_late_resolution_is_noop() {
        let (coordinator, mut snapshot) = setup();
        let approval = coordinator.request(
            &mut snapshot,
            "validate_urls",
            json!({}),
            Some(Duration::seconds(-1)), // already past
        );
        assert_eq!(snapshot.pending_approvals.len(), 1);

        // Any resolution attempt sweeps expiry first.
        let res = coordinator.resolve(&mut snapshot, &approval.id, true, None, Actor::User);
        assert_eq!(res, Resolution::AlreadyResolved(ApprovalStatus::Expired));

        assert!(snapshot.pending_approvals.is_empty());
        assert_eq!(snapshot.approval_history.len(), 1);
        assert_eq!(snapshot.approval_history[0].status, ApprovalStatus::Expired);
    }

    #[test]
    fn expire_overdue_sweeps_only_overdue() {
        let (coordinator, mut snapshot) = setup();
        coordinator.request(&mut snapshot, "a", json!({}), Some(Duration::seconds(-5)));
        let fresh = coordinator.request(&mut snapshot, "b", json!({}), Some(Duration::minutes(5)));

        let expired = coordinator.expire_overdue(&mut snapshot, Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(snapshot.pending_approvals.len(), 1);
        assert_eq!(snapshot.pending_approvals[0].id, fresh.id);
        assert!(snapshot.approval_sets_disjoint());
    }

    #[test]
    fn accept_remote_is_idempotent() {
        let (coordinator, mut snapshot) = setup();
        let approval = Approval {
            id: "a1".to_string(),
            phase: snapshot.phase,
            action: "validate_urls".to_string(),
            data: json!({}),
            created_at: Utc::now(),
            expires_at: None,
            status: ApprovalStatus::Pending,
            reason: None,
        };

        assert!(coordinator.accept_remote(&mut snapshot, approval.clone()));
        assert!(!coordinator.accept_remote(&mut snapshot, approval.clone()));
        assert_eq!(snapshot.pending_approvals.len(), 1);

        // Once resolved, a replayed announcement must not resurrect it.
        coordinator.resolve(&mut snapshot, "a1", true, None, Actor::User);
        assert!(!coordinator.accept_remote(&mut snapshot, approval));
        assert!(snapshot.pending_approvals.is_empty());
        assert_eq!(snapshot.approval_history.len(), 1);
    }
}
