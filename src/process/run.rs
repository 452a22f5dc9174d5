use super::{ChildExit, ChildSignal, KillOutcome, LaunchSpec, ProcessController, ProcessStatus};
use async_trait::async_trait;
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// How long a line without terminator is held back before it is passed on.
const PARTIAL_LINE_WAIT: Duration = Duration::from_secs(1);
const KILL_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct TokioProcessController {
    child: Option<Child>,
    pid: Option<u32>,
    output: Option<UnboundedReceiver<String>>,
}

#[async_trait]
impl ProcessController for TokioProcessController {
    #[instrument(skip(self, spec), fields(id = spec.id))]
    async fn launch(&mut self, spec: &LaunchSpec) -> Result<u32> {
        if self.child.is_some() {
            bail!("A child is already running");
        }
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_directory {
            command.current_dir(dir);
        }
        let mut child = command
            .spawn()
            .wrap_err_with(|| format!("Failed to spawn {:?}", spec.program))?;

        let pid = child.id().ok_or_else(|| eyre!("Child exited instantly"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("Missing child stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| eyre!("Missing child stderr"))?;

        let (sender, receiver) = mpsc::unbounded_channel::<String>();
        tokio::spawn(
            forward_lines(stdout, sender.clone()).instrument(info_span!("read_stdout", pid)),
        );
        tokio::spawn(forward_lines(stderr, sender).instrument(info_span!("read_stderr", pid)));

        self.child = Some(child);
        self.pid = Some(pid);
        self.output = Some(receiver);
        info!(pid, "Child started");
        Ok(pid)
    }

    fn poll_exit(&mut self) -> ProcessStatus {
        let Some(child) = self.child.as_mut() else {
            return ProcessStatus::Missing;
        };
        match child.try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => {
                self.child = None;
                self.pid = None;
                ProcessStatus::Exited(child_exit(status))
            }
            Err(err) => {
                warn!(?err, "Failed to check child status");
                ProcessStatus::Running
            }
        }
    }

    fn read_line(&mut self) -> Option<String> {
        let output = self.output.as_mut()?;
        match output.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                debug!("Child output closed");
                self.output = None;
                None
            }
        }
    }

    #[instrument(skip(self))]
    async fn kill(&mut self) -> Result<KillOutcome> {
        let Some(mut child) = self.child.take() else {
            return Ok(KillOutcome::NotRunning);
        };
        self.pid = None;
        if let Ok(Some(status)) = child.try_wait() {
            return Ok(KillOutcome::Exited(child_exit(status)));
        }
        child.start_kill().wrap_err("Failed to kill child")?;
        match tokio::time::timeout(KILL_WAIT, child.wait()).await {
            Ok(status) => Ok(KillOutcome::Killed(child_exit(
                status.wrap_err("Failed to collect killed child")?,
            ))),
            Err(_) => bail!("Child still running {KILL_WAIT:?} after kill"),
        }
    }

    fn signal(&mut self, signal: ChildSignal) -> Result<()> {
        let pid = self.pid.ok_or_else(|| eyre!("No child to signal"))?;
        send_signal(pid, signal)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: ChildSignal) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        ChildSignal::Hangup => Signal::SIGHUP,
        ChildSignal::User1 => Signal::SIGUSR1,
        ChildSignal::User2 => Signal::SIGUSR2,
        ChildSignal::Dump => Signal::SIGQUIT,
    };
    kill(Pid::from_raw(pid as i32), signal).wrap_err("Failed to send signal")
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, signal: ChildSignal) -> Result<()> {
    bail!("{signal:?} is not supported on this platform")
}

fn child_exit(status: ExitStatus) -> ChildExit {
    if let Some(code) = status.code() {
        return ChildExit::code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ChildExit {
                code: 1,
                signal: Some(signal),
            };
        }
    }
    ChildExit::code(1)
}

/// Splits a child stream into lines. A line that has not seen its
/// terminator within [`PARTIAL_LINE_WAIT`] is sent as is.
async fn forward_lines<R: AsyncRead + Unpin>(stream: R, sender: UnboundedSender<String>) {
    let mut reader = BufReader::new(stream);
    let mut pending = Vec::new();
    let mut flush_at = None;
    loop {
        let read = match flush_at {
            None => Ok(reader.fill_buf().await),
            Some(deadline) => tokio::time::timeout_at(deadline, reader.fill_buf()).await,
        };
        let available = match read {
            Err(_) => {
                emit(&mut pending, &sender);
                flush_at = None;
                continue;
            }
            Ok(Err(err)) => {
                warn!(?err, "Reading child output failed");
                break;
            }
            Ok(Ok(available)) => available,
        };
        if available.is_empty() {
            if !pending.is_empty() {
                emit(&mut pending, &sender);
            }
            break;
        }

        let used = match available.iter().position(|b| *b == b'\n') {
            Some(end) => end + 1,
            None => available.len(),
        };
        pending.extend_from_slice(&available[..used]);
        reader.consume(used);
        if pending.ends_with(b"\n") {
            emit(&mut pending, &sender);
            flush_at = None;
        } else if flush_at.is_none() {
            flush_at = Some(Instant::now() + PARTIAL_LINE_WAIT);
        }
    }
    debug!("Output closed");
}

fn emit(pending: &mut Vec<u8>, sender: &UnboundedSender<String>) {
    let line = String::from_utf8_lossy(pending)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    pending.clear();
    let _ = sender.send(line);
}
