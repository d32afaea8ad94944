//! Shared types for the harness adapter interface: the task description an
//! adapter is handed, the handle it returns, and the event stream it emits.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::process::ChildStdin;
use uuid::Uuid;

/// A task rendered into the form a harness needs to spawn an agent: a
/// working directory, environment, and instructions. Built by the context
/// assembler, not constructed ad hoc by callers.
#[derive(Debug)]
pub struct MaterializedTask {
    pub task_id: Uuid,
    pub name: String,
    pub description: String,
    pub invariant_commands: Vec<String>,
    pub working_dir: PathBuf,
    pub env_vars: HashMap<String, String>,
}

/// A handle to a running (or just-exited) agent process.
#[derive(Debug)]
pub struct AgentHandle {
    /// OS process ID, used to key the harness's internal process table.
    pub pid: u32,
    /// Piped stdin, if the harness needs to write the prompt after spawn.
    pub stdin: Option<ChildStdin>,
    pub task_id: Uuid,
    pub attempt: i32,
    pub harness_name: String,
}

/// One unit of output from a running agent, as translated from whatever
/// wire format the underlying CLI speaks.
///
/// `AgentEvent` is for live progress only -- the authoritative outcome of
/// an attempt always comes from the `result.json` artifact the agent
/// writes, never from parsing this stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Message { role: String, content: String },
    ToolCall { tool: String, input: serde_json::Value },
    ToolResult { tool: String, output: serde_json::Value },
    TokenUsage { input_tokens: u64, output_tokens: u64 },
    Error { message: String },
    Completed,
}
