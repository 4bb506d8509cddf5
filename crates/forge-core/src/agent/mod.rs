//! Agent adapter interface for the code-generation subprocess.
//!
//! The contract is deliberately narrow -- prompt in, streamed text out -- so
//! that swapping the CLI subprocess for a direct protocol client stays a
//! local change. The engine treats the agent as an opaque text producer.

pub mod claude;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use claude::ClaudeAdapter;

/// Default wall-time limit for one agent invocation.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything one agent invocation needs.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    /// Capability allowlist forwarded to the agent binary.
    pub allowed_tools: Vec<String>,
    pub working_dir: PathBuf,
    /// Overlay on the inherited environment.
    pub env_vars: BTreeMap<String, String>,
    /// Per-invocation limit, independent of the caller's cancellation scope.
    pub timeout: Duration,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
            max_turns: None,
            allowed_tools: vec![
                "Bash".to_string(),
                "Read".to_string(),
                "Edit".to_string(),
                "Write".to_string(),
                "Glob".to_string(),
                "Grep".to_string(),
            ],
            working_dir: working_dir.into(),
            env_vars: BTreeMap::new(),
            timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }
}

/// What came back from a completed invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentRun {
    /// The assembled text of every streamed fragment.
    pub text: String,
    pub duration: Duration,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub turns: Option<u32>,
}

/// Callback receiving each streamed text fragment. Must not block; the
/// engine's handler appends to a buffer and forwards to the event bus.
pub type ChunkFn<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// Errors from agent invocations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent binary is missing or not runnable.
    #[error("agent binary not available: {0}")]
    NotAvailable(String),

    #[error("failed to spawn agent: {0}")]
    Spawn(#[source] std::io::Error),

    /// The process exited non-zero. Carries the captured stderr.
    #[error("agent exited with code {code}: {stderr}")]
    ExitNonZero { code: i32, stderr: String },

    /// The per-invocation timeout tripped; the subprocess was killed.
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation scope tripped; the subprocess was killed.
    #[error("agent invocation cancelled")]
    Cancelled,

    #[error("io error reading agent output: {0}")]
    Io(#[source] std::io::Error),
}

/// Adapter over the code-generation subprocess.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable adapter name.
    fn name(&self) -> &str;

    /// Probe that the backing binary exists and runs. Called once at
    /// engine startup.
    async fn check_available(&self) -> Result<(), AgentError>;

    /// Run the agent to completion, forwarding each streamed text
    /// fragment through `on_chunk`.
    async fn execute(
        &self,
        req: &AgentRequest,
        cancel: &CancellationToken,
        on_chunk: &ChunkFn<'_>,
    ) -> Result<AgentRun, AgentError>;
}

// Harness code stores the adapter as `Arc<dyn Agent>`.
const _: () = {
    fn _assert_object_safe(_: &dyn Agent) {}
};
