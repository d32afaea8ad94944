use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Approved,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = PlanStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "approved" => Ok(Self::Approved),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(PlanStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanStatus`] string.
#[derive(Debug, Clone)]
pub struct PlanStatusParseError(pub String);

impl fmt::Display for PlanStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid plan status: {:?}", self.0)
    }
}

impl std::error::Error for PlanStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Checking,
    InReview,
    Passed,
    Failed,
    Escalated,
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Checking => "checking",
            Self::InReview => "in_review",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "checking" => Ok(Self::Checking),
            "in_review" => Ok(Self::InReview),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "escalated" => Ok(Self::Escalated),
            "blocked" => Ok(Self::Blocked),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Externally-observable progress column, derived from `TaskStatus` plus
/// dependency state. Never stored -- always computed at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KanbanColumn {
    Backlog,
    Ready,
    InProgress,
    InReview,
    Done,
    Blocked,
}

impl fmt::Display for KanbanColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Done => "done",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl TaskStatus {
    /// Derive the kanban column for a task. `ready` requires the caller to
    /// already know all `blocks` dependencies are satisfied -- this function
    /// only distinguishes `pending` into `backlog` vs `ready` when told so.
    pub fn kanban_column(&self, dependencies_satisfied: bool) -> KanbanColumn {
        match self {
            Self::Pending if dependencies_satisfied => KanbanColumn::Ready,
            Self::Pending => KanbanColumn::Backlog,
            Self::Assigned | Self::Running | Self::Checking | Self::Escalated => {
                KanbanColumn::InProgress
            }
            Self::InReview => KanbanColumn::InReview,
            Self::Passed => KanbanColumn::Done,
            Self::Failed | Self::Blocked => KanbanColumn::Blocked,
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Scope level of a task -- determines the gating strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    Narrow,
    Medium,
    Broad,
}

impl fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Narrow => "narrow",
            Self::Medium => "medium",
            Self::Broad => "broad",
        };
        f.write_str(s)
    }
}

impl FromStr for ScopeLevel {
    type Err = ScopeLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "narrow" => Ok(Self::Narrow),
            "medium" => Ok(Self::Medium),
            "broad" => Ok(Self::Broad),
            other => Err(ScopeLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ScopeLevel`] string.
#[derive(Debug, Clone)]
pub struct ScopeLevelParseError(pub String);

impl fmt::Display for ScopeLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid scope level: {:?}", self.0)
    }
}

impl std::error::Error for ScopeLevelParseError {}

// ---------------------------------------------------------------------------

/// Gate policy that determines how a task's completion is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    Auto,
    HumanReview,
    HumanApprove,
}

impl fmt::Display for GatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::HumanReview => "human_review",
            Self::HumanApprove => "human_approve",
        };
        f.write_str(s)
    }
}

impl FromStr for GatePolicy {
    type Err = GatePolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "human_review" => Ok(Self::HumanReview),
            "human_approve" => Ok(Self::HumanApprove),
            other => Err(GatePolicyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GatePolicy`] string.
#[derive(Debug, Clone)]
pub struct GatePolicyParseError(pub String);

impl fmt::Display for GatePolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid gate policy: {:?}", self.0)
    }
}

impl std::error::Error for GatePolicyParseError {}

// ---------------------------------------------------------------------------

/// Whether a passing coding attempt gets a review-phase agent before it can
/// be merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    /// Every passing attempt goes through a review-phase agent.
    Always,
    /// Never review; the gate passing is sufficient.
    Never,
    /// Review only after a prior review rejection for this task.
    OnFailureOnly,
}

impl fmt::Display for ReviewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::OnFailureOnly => "on_failure_only",
        };
        f.write_str(s)
    }
}

impl FromStr for ReviewMode {
    type Err = ReviewModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "on_failure_only" => Ok(Self::OnFailureOnly),
            other => Err(ReviewModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ReviewMode`] string.
#[derive(Debug, Clone)]
pub struct ReviewModeParseError(pub String);

impl fmt::Display for ReviewModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid review mode: {:?}", self.0)
    }
}

impl std::error::Error for ReviewModeParseError {}

// ---------------------------------------------------------------------------

/// Kind of invariant check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvariantKind {
    TestSuite,
    Typecheck,
    Lint,
    Coverage,
    Custom,
}

impl fmt::Display for InvariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TestSuite => "test_suite",
            Self::Typecheck => "typecheck",
            Self::Lint => "lint",
            Self::Coverage => "coverage",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

impl FromStr for InvariantKind {
    type Err = InvariantKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test_suite" => Ok(Self::TestSuite),
            "typecheck" => Ok(Self::Typecheck),
            "lint" => Ok(Self::Lint),
            "coverage" => Ok(Self::Coverage),
            "custom" => Ok(Self::Custom),
            other => Err(InvariantKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InvariantKind`] string.
#[derive(Debug, Clone)]
pub struct InvariantKindParseError(pub String);

impl fmt::Display for InvariantKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid invariant kind: {:?}", self.0)
    }
}

impl std::error::Error for InvariantKindParseError {}

// ---------------------------------------------------------------------------

/// Scope of an invariant -- global or project-level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvariantScope {
    Global,
    Project,
}

impl fmt::Display for InvariantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Global => "global",
            Self::Project => "project",
        };
        f.write_str(s)
    }
}

impl FromStr for InvariantScope {
    type Err = InvariantScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "project" => Ok(Self::Project),
            other => Err(InvariantScopeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InvariantScope`] string.
#[derive(Debug, Clone)]
pub struct InvariantScopeParseError(pub String);

impl fmt::Display for InvariantScopeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid invariant scope: {:?}", self.0)
    }
}

impl std::error::Error for InvariantScopeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A plan -- the top-level unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub project_path: String,
    pub base_branch: String,
    pub status: PlanStatus,
    pub token_budget: Option<i64>,
    pub default_harness: String,
    pub isolation: String,
    pub container_image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task -- a unit of work within a plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub name: String,
    pub description: String,
    pub scope_level: ScopeLevel,
    pub gate_policy: GatePolicy,
    pub review_mode: ReviewMode,
    pub retry_max: i32,
    pub status: TaskStatus,
    pub assigned_harness: Option<String>,
    pub requested_harness: Option<String>,
    pub worktree_path: Option<String>,
    pub attempt: i32,
    pub block_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An edge in the task dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// A reusable invariant definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invariant {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub kind: InvariantKind,
    pub command: String,
    pub args: Vec<String>,
    pub expected_exit_code: i32,
    pub threshold: Option<f32>,
    pub scope: InvariantScope,
    pub created_at: DateTime<Utc>,
}

/// Join row linking a task to an invariant.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskInvariant {
    pub task_id: Uuid,
    pub invariant_id: Uuid,
}

/// Result of running an invariant gate check.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GateResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub invariant_id: Uuid,
    pub attempt: i32,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: Option<i32>,
    pub checked_at: DateTime<Utc>,
}

/// An event recorded from an agent's execution stream.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentEvent {
    pub id: i64,
    pub task_id: Uuid,
    pub attempt: i32,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sessions, attempt history, counters, event log
// ---------------------------------------------------------------------------

/// Which phase of a task an agent invocation played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Coding,
    Review,
    Merger,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coding => "coding",
            Self::Review => "review",
            Self::Merger => "merger",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionRole {
    type Err = SessionRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coding" => Ok(Self::Coding),
            "review" => Ok(Self::Review),
            "merger" => Ok(Self::Merger),
            other => Err(SessionRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SessionRole`] string.
#[derive(Debug, Clone)]
pub struct SessionRoleParseError(pub String);

impl fmt::Display for SessionRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session role: {:?}", self.0)
    }
}

impl std::error::Error for SessionRoleParseError {}

/// Terminal or in-flight status of an attempt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Approved,
    Rejected,
    Failed,
    Crashed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionStatus {
    type Err = SessionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            "crashed" => Ok(Self::Crashed),
            other => Err(SessionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SessionStatus`] string.
#[derive(Debug, Clone)]
pub struct SessionStatusParseError(pub String);

impl fmt::Display for SessionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session status: {:?}", self.0)
    }
}

impl std::error::Error for SessionStatusParseError {}

/// Outcome of a single agent attempt, used to drive the retry engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Success,
    TestFailure,
    ReviewRejection,
    Crash,
    Timeout,
    NoResult,
    CodingFailure,
}

impl fmt::Display for AgentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::TestFailure => "test_failure",
            Self::ReviewRejection => "review_rejection",
            Self::Crash => "crash",
            Self::Timeout => "timeout",
            Self::NoResult => "no_result",
            Self::CodingFailure => "coding_failure",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentOutcome {
    type Err = AgentOutcomeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "test_failure" => Ok(Self::TestFailure),
            "review_rejection" => Ok(Self::ReviewRejection),
            "crash" => Ok(Self::Crash),
            "timeout" => Ok(Self::Timeout),
            "no_result" => Ok(Self::NoResult),
            "coding_failure" => Ok(Self::CodingFailure),
            other => Err(AgentOutcomeParseError(other.to_owned())),
        }
    }
}

impl AgentOutcome {
    /// Whether this outcome counts as terminal for retry-cap purposes, as
    /// opposed to a cancellation that leaves no outcome recorded at all.
    pub fn is_terminal(&self) -> bool {
        true
    }
}

/// Error returned when parsing an invalid [`AgentOutcome`] string.
#[derive(Debug, Clone)]
pub struct AgentOutcomeParseError(pub String);

impl fmt::Display for AgentOutcomeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent outcome: {:?}", self.0)
    }
}

impl std::error::Error for AgentOutcomeParseError {}

/// An attempt record: one agent invocation (coding, review, or merger) for a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub task_id: Uuid,
    pub attempt: i32,
    pub role: SessionRole,
    pub agent_id: String,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub output_log: Option<String>,
    pub git_branch: Option<String>,
    pub git_diff: Option<String>,
    pub test_results: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub summary: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row of per-agent attempt history, capped at 500 rows per plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentStat {
    pub id: i64,
    pub plan_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: String,
    pub model: Option<String>,
    pub attempt: i32,
    pub outcome: AgentOutcome,
    pub duration_ms: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted aggregate counters for a plan, refreshed after every terminal
/// task transition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProjectCounters {
    pub plan_id: Uuid,
    pub total_done: i64,
    pub total_failed: i64,
    pub queue_depth: i64,
    pub updated_at: DateTime<Utc>,
}

/// An append-only observability record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventLogEntry {
    pub id: i64,
    pub plan_id: Uuid,
    pub task_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_status_display_roundtrip() {
        let variants = [
            PlanStatus::Draft,
            PlanStatus::Approved,
            PlanStatus::Running,
            PlanStatus::Completed,
            PlanStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: PlanStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn plan_status_invalid() {
        let result = "bogus".parse::<PlanStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Checking,
            TaskStatus::InReview,
            TaskStatus::Passed,
            TaskStatus::Failed,
            TaskStatus::Escalated,
            TaskStatus::Blocked,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn kanban_column_pending_splits_on_dependencies() {
        assert_eq!(
            TaskStatus::Pending.kanban_column(false),
            KanbanColumn::Backlog
        );
        assert_eq!(
            TaskStatus::Pending.kanban_column(true),
            KanbanColumn::Ready
        );
    }

    #[test]
    fn kanban_column_in_progress_group() {
        for status in [
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Checking,
            TaskStatus::Escalated,
        ] {
            assert_eq!(status.kanban_column(true), KanbanColumn::InProgress);
        }
    }

    #[test]
    fn kanban_column_blocked_includes_failed() {
        assert_eq!(TaskStatus::Failed.kanban_column(true), KanbanColumn::Blocked);
        assert_eq!(TaskStatus::Blocked.kanban_column(true), KanbanColumn::Blocked);
    }

    #[test]
    fn session_role_display_roundtrip() {
        for v in [SessionRole::Coding, SessionRole::Review, SessionRole::Merger] {
            let parsed: SessionRole = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn session_status_display_roundtrip() {
        for v in [
            SessionStatus::Running,
            SessionStatus::Approved,
            SessionStatus::Rejected,
            SessionStatus::Failed,
            SessionStatus::Crashed,
        ] {
            let parsed: SessionStatus = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn agent_outcome_display_roundtrip() {
        for v in [
            AgentOutcome::Success,
            AgentOutcome::TestFailure,
            AgentOutcome::ReviewRejection,
            AgentOutcome::Crash,
            AgentOutcome::Timeout,
            AgentOutcome::NoResult,
            AgentOutcome::CodingFailure,
        ] {
            let parsed: AgentOutcome = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn agent_outcome_invalid() {
        assert!("bogus".parse::<AgentOutcome>().is_err());
    }

    #[test]
    fn task_status_invalid() {
        let result = "nope".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn scope_level_display_roundtrip() {
        let variants = [ScopeLevel::Narrow, ScopeLevel::Medium, ScopeLevel::Broad];
        for v in &variants {
            let s = v.to_string();
            let parsed: ScopeLevel = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn scope_level_invalid() {
        let result = "tiny".parse::<ScopeLevel>();
        assert!(result.is_err());
    }

    #[test]
    fn gate_policy_display_roundtrip() {
        let variants = [
            GatePolicy::Auto,
            GatePolicy::HumanReview,
            GatePolicy::HumanApprove,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: GatePolicy = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn gate_policy_invalid() {
        let result = "robot".parse::<GatePolicy>();
        assert!(result.is_err());
    }

    #[test]
    fn invariant_kind_display_roundtrip() {
        let variants = [
            InvariantKind::TestSuite,
            InvariantKind::Typecheck,
            InvariantKind::Lint,
            InvariantKind::Coverage,
            InvariantKind::Custom,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: InvariantKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn invariant_kind_invalid() {
        let result = "magic".parse::<InvariantKind>();
        assert!(result.is_err());
    }

    #[test]
    fn invariant_scope_display_roundtrip() {
        let variants = [InvariantScope::Global, InvariantScope::Project];
        for v in &variants {
            let s = v.to_string();
            let parsed: InvariantScope = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn invariant_scope_invalid() {
        let result = "local".parse::<InvariantScope>();
        assert!(result.is_err());
    }
}
