pub mod filter;
mod run;

pub use self::run::TokioProcessController;
use async_trait::async_trait;
use color_eyre::Result;
use std::path::PathBuf;

/// Everything needed to start one child instance.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
    /// Launch counter, used to tag output.
    pub id: u32,
}

impl LaunchSpec {
    pub fn from_command_line(mut words: Vec<String>, id: u32) -> Option<Self> {
        if words.is_empty() {
            return None;
        }
        let program = words.remove(0);
        Some(Self {
            program,
            args: words,
            id,
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: i32,
    /// Set when the child was terminated by a signal.
    pub signal: Option<i32>,
}

impl ChildExit {
    pub fn code(code: i32) -> Self {
        Self { code, signal: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(ChildExit),
    /// Nothing was launched, or the exit was already collected.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotRunning,
    /// The child had exited on its own before the kill was sent.
    Exited(ChildExit),
    Killed(ChildExit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSignal {
    Hangup,
    User1,
    User2,
    Dump,
}

/// OS side of the child: spawning, output capture, exit detection and
/// termination. Only ever driven from the supervisor loop.
#[async_trait]
pub trait ProcessController: Send {
    /// Starts the child and returns its pid.
    async fn launch(&mut self, spec: &LaunchSpec) -> Result<u32>;

    /// Non-blocking exit check. Collects the exit status so no zombie is left.
    fn poll_exit(&mut self) -> ProcessStatus;

    /// Next complete line of captured output, if one is waiting.
    fn read_line(&mut self) -> Option<String>;

    /// Forcefully terminates the child and waits briefly for it to go away.
    async fn kill(&mut self) -> Result<KillOutcome>;

    fn signal(&mut self, signal: ChildSignal) -> Result<()>;

    fn pid(&self) -> Option<u32>;
}
