//! Data model for the pipeline workflow.
//!
//! Everything here is the wire shape (snake_case JSON) shared with the
//! backend: the canonical `WorkflowSnapshot`, the phase enum, URL and schema
//! entries, approvals, and the transition log. Mutation logic lives in
//! `machine.rs`; these types only carry state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Phases ───────────────────────────────────────────────────────────

/// One discrete stage of the guided pipeline-building workflow.
///
/// The first nine phases form a strict total order for progress purposes;
/// `Error` sits outside the order, is reachable from any phase, and is
/// terminal for the run (recovery is an external reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Initial,
    UrlCollection,
    UrlValidation,
    SchemaDefinition,
    SchemaValidation,
    CodeGeneration,
    ReadyToExecute,
    Executing,
    Completed,
    Error,
}

/// The linear progression, in order. `Error` is deliberately absent.
pub const PHASE_ORDER: [WorkflowPhase; 9] = [
    WorkflowPhase::Initial,
    WorkflowPhase::UrlCollection,
    WorkflowPhase::UrlValidation,
    WorkflowPhase::SchemaDefinition,
    WorkflowPhase::SchemaValidation,
    WorkflowPhase::CodeGeneration,
    WorkflowPhase::ReadyToExecute,
    WorkflowPhase::Executing,
    WorkflowPhase::Completed,
];

impl WorkflowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::UrlCollection => "url_collection",
            Self::UrlValidation => "url_validation",
            Self::SchemaDefinition => "schema_definition",
            Self::SchemaValidation => "schema_validation",
            Self::CodeGeneration => "code_generation",
            Self::ReadyToExecute => "ready_to_execute",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Index in [`PHASE_ORDER`], or `None` for `Error`.
    pub fn progress_index(&self) -> Option<usize> {
        PHASE_ORDER.iter().position(|p| p == self)
    }

    /// The immediate next phase in the linear progression.
    ///
    /// `Completed` and `Error` have no successor: the run either finished or
    /// needs an external reset.
    pub fn next(&self) -> Option<WorkflowPhase> {
        let idx = self.progress_index()?;
        PHASE_ORDER.get(idx + 1).copied()
    }

    /// Progress weight of this phase, matching what the backend reports.
    pub fn weight(&self) -> f32 {
        match self {
            Self::Initial => 0.0,
            Self::UrlCollection => 0.15,
            Self::UrlValidation => 0.25,
            Self::SchemaDefinition => 0.40,
            Self::SchemaValidation => 0.50,
            Self::CodeGeneration => 0.70,
            Self::ReadyToExecute => 0.85,
            Self::Executing => 0.90,
            Self::Completed => 1.0,
            Self::Error => -1.0,
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Self::Initial),
            "url_collection" => Ok(Self::UrlCollection),
            "url_validation" => Ok(Self::UrlValidation),
            "schema_definition" => Ok(Self::SchemaDefinition),
            "schema_validation" => Ok(Self::SchemaValidation),
            "code_generation" => Ok(Self::CodeGeneration),
            "ready_to_execute" => Ok(Self::ReadyToExecute),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid workflow phase: {}", s)),
        }
    }
}

/// Derived per-phase status for observers. Pure function of the snapshot's
/// phase, recomputed on every read and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Active,
    Pending,
    Error,
}

/// One row of the derived progress view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: WorkflowPhase,
    pub status: PhaseStatus,
}

// ── Actors ───────────────────────────────────────────────────────────

/// Who triggered a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    #[default]
    System,
    User,
    Agent,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

// ── URLs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    High,
    #[default]
    Medium,
    Low,
}

/// One URL collected for the pipeline. Uniqueness is a collaborator
/// concern; the core stores whatever it is handed, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlInfo {
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub relevance: Relevance,
    #[serde(default)]
    pub validated: bool,
    #[serde(default)]
    pub validation_reason: Option<String>,
    #[serde(default = "Utc::now")]
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub added_by: Actor,
}

impl UrlInfo {
    pub fn new(url: impl Into<String>, added_by: Actor) -> Self {
        Self {
            url: url.into(),
            description: String::new(),
            relevance: Relevance::default(),
            validated: false,
            validation_reason: None,
            added_at: Utc::now(),
            added_by,
        }
    }
}

// ── Schema ───────────────────────────────────────────────────────────

/// One field of the extraction schema. `name` is unique within the
/// sequence; the machine's replace-style mutation keeps it that way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub example: Option<String>,
}

fn default_true() -> bool {
    true
}

// ── Approvals ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A pending human decision gating an agent-proposed action.
///
/// Lifecycle: created pending, resolved exactly once (by user decision or
/// expiry), never recreated with the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub phase: WorkflowPhase,
    /// Action tag, e.g. "validate_urls", "approve_schema", "execute_code".
    pub action: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Approval {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

// ── User modifications ───────────────────────────────────────────────

/// Audit entry for a manual edit of a snapshot field: which field changed,
/// both values, and who made the edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserModification {
    pub field: String,
    #[serde(default)]
    pub old_value: serde_json::Value,
    #[serde(default)]
    pub new_value: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user: Actor,
}

// ── Transitions ──────────────────────────────────────────────────────

/// One entry in the append-only transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub from_phase: WorkflowPhase,
    pub to_phase: WorkflowPhase,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub triggered_by: Actor,
}

// ── Snapshot ─────────────────────────────────────────────────────────

/// The full canonical state of one pipeline's workflow, tagged with a
/// version. The Phase State Machine is the only component that mutates it
/// (the Approval Coordinator touches just the two approval lists).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub pipeline_id: String,
    pub phase: WorkflowPhase,

    #[serde(default)]
    pub urls: Vec<UrlInfo>,
    #[serde(default)]
    pub urls_validated: bool,

    #[serde(default)]
    pub schema_fields: Vec<SchemaField>,
    #[serde(default)]
    pub schema_validated: bool,

    #[serde(default)]
    pub generated_code: String,
    #[serde(default)]
    pub code_validated: bool,

    #[serde(default)]
    pub execution_results: Vec<serde_json::Value>,
    #[serde(default)]
    pub execution_status: Option<String>,

    #[serde(default)]
    pub pending_approvals: Vec<Approval>,
    #[serde(default)]
    pub approval_history: Vec<Approval>,

    #[serde(default)]
    pub phase_transitions: Vec<WorkflowTransition>,

    #[serde(default)]
    pub user_modifications: Vec<UserModification>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Actor,
    #[serde(default)]
    pub last_modified_by: Actor,

    /// Bumped on every accepted mutation; drives version-gated discard.
    pub version: u64,
}

impl WorkflowSnapshot {
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: pipeline_id.into(),
            phase: WorkflowPhase::Initial,
            urls: Vec::new(),
            urls_validated: false,
            schema_fields: Vec::new(),
            schema_validated: false,
            generated_code: String::new(),
            code_validated: false,
            execution_results: Vec::new(),
            execution_status: None,
            pending_approvals: Vec::new(),
            approval_history: Vec::new(),
            phase_transitions: Vec::new(),
            user_modifications: Vec::new(),
            created_at: now,
            updated_at: now,
            created_by: Actor::System,
            last_modified_by: Actor::System,
            version: 1,
        }
    }

    /// Record an accepted mutation: bump the version and stamp metadata.
    pub(crate) fn touch(&mut self, by: Actor) {
        self.version += 1;
        self.updated_at = Utc::now();
        self.last_modified_by = by;
    }

    pub fn pending_approval(&self, id: &str) -> Option<&Approval> {
        self.pending_approvals.iter().find(|a| a.id == id)
    }

    pub fn historical_approval(&self, id: &str) -> Option<&Approval> {
        self.approval_history.iter().find(|a| a.id == id)
    }

    /// Invariant: the last transition's `to_phase` matches `phase`, unless
    /// there are no transitions yet and the phase is still `Initial`.
    pub fn transition_log_consistent(&self) -> bool {
        match self.phase_transitions.last() {
            Some(t) => t.to_phase == self.phase,
            None => self.phase == WorkflowPhase::Initial,
        }
    }

    /// Invariant: no approval id appears in both pending and history.
    pub fn approval_sets_disjoint(&self) -> bool {
        self.pending_approvals
            .iter()
            .all(|p| self.historical_approval(&p.id).is_none())
    }
}
