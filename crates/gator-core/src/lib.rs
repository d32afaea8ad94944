//! Core orchestration engine: turns a plan's tasks into agent invocations,
//! evaluates their results against invariants, and drives tasks through
//! review and merge.

pub mod context;
pub mod events;
pub mod gate;
pub mod harness;
pub mod invariant;
pub mod isolation;
pub mod lifecycle;
pub mod merge;
pub mod orchestrator;
pub mod plan;
pub mod presets;
pub mod retry;
pub mod state;
pub mod worktree;
