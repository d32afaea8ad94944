//! Maps a runner outcome and the agent's `result.json` into the
//! `AgentOutcome` the rest of the system persists and retries against.
//!
//! The gate runner may still override a `Success` here with `TestFailure`
//! when the post-attempt invariant run disagrees with the agent's own
//! report -- that override happens in the lifecycle, not here.

use gator_db::models::AgentOutcome;

use crate::context::assembler::{AgentResult, Phase};

use super::runner::RunOutcome;

/// Derive the outcome to persist for an attempt, given how the process
/// resolved and whatever `result.json` (if any) was read back afterward.
///
/// Returns `None` for `RunOutcome::Cancelled`: per the runner contract, a
/// cancelled attempt records no outcome here and is instead left for the
/// shutdown path to mark `crashed`.
pub fn derive_outcome(run_outcome: RunOutcome, phase: Phase, result: Option<&AgentResult>) -> Option<AgentOutcome> {
    match run_outcome {
        RunOutcome::Cancelled => None,
        RunOutcome::Timeout => Some(AgentOutcome::Timeout),
        RunOutcome::SpawnError => Some(AgentOutcome::Crash),
        RunOutcome::Exit(code) => Some(outcome_from_result(code, phase, result)),
    }
}

fn outcome_from_result(exit_code: i32, phase: Phase, result: Option<&AgentResult>) -> AgentOutcome {
    let Some(result) = result else {
        return if exit_code == 0 { AgentOutcome::NoResult } else { AgentOutcome::Crash };
    };

    match result.status.as_str() {
        "success" | "approved" => AgentOutcome::Success,
        "rejected" if phase == Phase::Review => AgentOutcome::ReviewRejection,
        "failed" | "rejected" => AgentOutcome::CodingFailure,
        _ => {
            if exit_code == 0 {
                AgentOutcome::NoResult
            } else {
                AgentOutcome::Crash
            }
        }
    }
}
