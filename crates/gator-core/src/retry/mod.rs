//! Retry & escalation engine: decides, for a task that just failed an
//! attempt, whether to run another attempt (optionally on a higher model
//! tier) or give up and hand the task to a human.
//!
//! A pure function of its inputs except for the attempt history it's handed,
//! which the caller loads from [`gator_db::queries::agent_stats`]. The same
//! `(task, history)` pair always yields the same decision.

use gator_db::models::{AgentOutcome, AgentStat, Task};

/// Model tiers tried in order after repeated same-type failures. `None`
/// (no `ANTHROPIC_MODEL` override; the harness's own default) is the
/// implicit first rung.
const ESCALATION_LADDER: &[&str] = &["claude-sonnet-4-5", "claude-opus-4-1"];

/// What the engine decided for a task's next attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another attempt, optionally overriding the model via
    /// `ANTHROPIC_MODEL`.
    Retry { model_override: Option<String> },
    /// Stop retrying; the task should be escalated for human attention.
    GiveUp { reason: String },
}

/// The next rung up from `current` on the escalation ladder, or `None` if
/// already at the top (or the current model isn't on the ladder at all).
fn next_tier(current: Option<&str>) -> Option<&'static str> {
    match current {
        None => ESCALATION_LADDER.first().copied(),
        Some(cur) => {
            let pos = ESCALATION_LADDER.iter().position(|m| *m == cur)?;
            ESCALATION_LADDER.get(pos + 1).copied()
        }
    }
}

/// The model override (if any) for a given upcoming attempt number, given
/// the task's history so far (most recent attempt first, per
/// [`gator_db::queries::agent_stats::load_history_for_task`]).
///
/// Attempts 1-2 always use the base (scope-level-mapped) agent/model. From
/// attempt 3 on, two consecutive same-type failures escalate to the next
/// rung on the ladder; `task_id` is only used for the log line.
pub fn model_for_attempt(
    task_id: uuid::Uuid,
    next_attempt: i32,
    history: &[AgentStat],
) -> Option<String> {
    if next_attempt < 3 {
        return None;
    }

    let last = history.first()?;
    let same_type_count = history
        .iter()
        .take_while(|h| h.outcome == last.outcome)
        .count();

    if same_type_count < 2 {
        return None;
    }

    let next = next_tier(last.model.as_deref())?;
    tracing::info!(
        task_id = %task_id,
        from = ?last.model,
        to = %next,
        failure_type = %last.outcome,
        same_type_count,
        "escalating model tier after repeated same-type failures"
    );
    Some(next.to_string())
}

/// Decide what to do about a task that just failed an attempt, given its
/// full attempt history: run another attempt (with
/// [`model_for_attempt`]'s choice for the model), or give up.
///
/// `task.attempt` is the attempt number that just completed (and failed).
pub fn decide(task: &Task, history: &[AgentStat]) -> RetryDecision {
    if task.attempt >= task.retry_max {
        let reason = match history.first() {
            Some(last) => format!(
                "attempt {} reached retry_max {} (last outcome: {})",
                task.attempt, task.retry_max, last.outcome
            ),
            None => format!(
                "attempt {} reached retry_max {}",
                task.attempt, task.retry_max
            ),
        };
        return RetryDecision::GiveUp { reason };
    }

    RetryDecision::Retry {
        model_override: model_for_attempt(task.id, task.attempt + 1, history),
    }
}
