//! The supervisor event loop.
//!
//! A single task owns both state axes. Signals and commands arrive as a
//! [`Request`], child traffic as a [`ChannelEvent`], and both are applied
//! between two loop iterations.
//!
//! [`ChannelEvent`]: crate::protocol::ChannelEvent

/// State transitions log at debug, or at info with `debug.state_output`.
macro_rules! state_log {
    ($self:ident, $($arg:tt)+) => {
        if $self.config.log.state_output {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

/// Loop details log at trace, or at debug with `debug.loop_output`.
macro_rules! loop_log {
    ($self:ident, $($arg:tt)+) => {
        if $self.config.log.loop_output {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
}

mod event_handlers;
mod polls;
mod states;
#[cfg(test)]
mod tests;
pub mod types;

use self::types::{ChildHandle, ChildState, Machine, Request, RestartMode, SupervisorState, UserSignal};
use crate::configs::{Properties, SignalMode, SupervisorConfig, GRACE_SECS};
use crate::files::RunFiles;
use crate::process::filter::{FilterAction, FilterRule};
use crate::process::{ChildExit, ChildSignal, LaunchSpec, ProcessController, ProcessStatus};
use crate::protocol::{AuthKey, ControlMessage, ControlTransport, MessageCode};
use crate::restart::RestartPolicy;
use crate::service::{ServiceHost, WAIT_HINT_DAY_MS};
use crate::tick::{Clock, Tick, TICKS_PER_SECOND};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, instrument, warn};

const LOOP_SLEEP: Duration = Duration::from_millis(100);
/// Upper bound for reading child output or control frames in one iteration.
const READ_BUDGET: Duration = Duration::from_millis(250);

/// Collaborators the supervisor drives.
pub struct Parts<P, T> {
    pub clock: Arc<dyn Clock>,
    pub process: P,
    pub channel: T,
    pub host: Box<dyn ServiceHost>,
}

pub struct Supervisor<P, T> {
    config: SupervisorConfig,
    properties: Properties,
    service: bool,
    clock: Arc<dyn Clock>,
    process: P,
    channel: T,
    host: Box<dyn ServiceHost>,
    requests: Receiver<Request>,
    files: RunFiles,
    policy: RestartPolicy,
    machine: Machine,
    child: Option<ChildHandle>,
    pending: Option<(LaunchSpec, AuthKey)>,
    dump_on_kill: bool,
    last_cycle: Tick,
    anchor_due: Tick,
    command_due: Tick,
}

impl<P: ProcessController, T: ControlTransport> Supervisor<P, T> {
    pub fn new(
        config: SupervisorConfig,
        properties: Properties,
        parts: Parts<P, T>,
        requests: Receiver<Request>,
        service: bool,
    ) -> Self {
        let now = parts.clock.now();
        Self {
            files: RunFiles::new(config.files.clone()),
            policy: RestartPolicy::new(config.restart.clone()),
            dump_on_kill: config.restart.dump_on_failed_exit,
            machine: Machine::new(now),
            child: None,
            pending: None,
            last_cycle: now,
            anchor_due: now,
            command_due: now,
            clock: parts.clock,
            process: parts.process,
            channel: parts.channel,
            host: parts.host,
            requests,
            service,
            properties,
            config,
        }
    }

    /// Runs until the supervisor reaches STOPPED and returns the exit code.
    #[instrument(skip(self), fields(service = self.service))]
    pub async fn run(mut self) -> i32 {
        info!("Supervisor starting");
        if let Err(err) = self.files.create() {
            error!(?err, "Unable to create run files");
            return 1;
        }
        self.announce();

        let mut next_sleep = true;
        while self.machine.supervisor != SupervisorState::Stopped {
            if next_sleep {
                let woken = tokio::select! {
                    _ = tokio::time::sleep(LOOP_SLEEP) => None,
                    Some(request) = self.requests.recv() => Some(request),
                };
                if let Some(request) = woken {
                    self.handle_request(request).await;
                }
            }
            next_sleep = self.cycle().await;
        }

        self.channel.close().await;
        self.channel.stop_listening().await;
        self.files.cleanup();
        let exit_code = self.machine.exit_code.get();
        info!(exit_code, "Supervisor stopped");
        exit_code
    }

    fn announce(&mut self) {
        let state = self.machine.supervisor;
        self.host.report_status(state, 0, self.wait_hint_ms(state));
        self.files.write_status(state.name());
        self.files.write_child_status(self.machine.child.name());
    }

    /// One loop iteration. Returns false when work was left over and the
    /// next iteration should not sleep.
    pub(crate) async fn cycle(&mut self) -> bool {
        let mut next_sleep = true;
        while let Ok(request) = self.requests.try_recv() {
            self.handle_request(request).await;
        }

        if self.read_output() {
            debug!("Pausing output reads to share cycles");
            next_sleep = false;
        }
        let idle = self.machine.child == ChildState::Down
            && self.machine.supervisor.is_shutting_down();
        if !idle && self.read_control().await {
            debug!("Pausing control reads to share cycles");
            next_sleep = false;
        }

        let now = self.clock.now();
        self.check_cpu(now);
        loop_log!(
            self,
            tick = now.0,
            supervisor = %self.machine.supervisor,
            child = %self.machine.child,
            deadline = ?self.machine.deadline.map(|d| d.ticks_since(now) / TICKS_PER_SECOND),
            exit_requested = self.machine.exit_requested,
            restart = ?self.machine.restart,
            "Loop state"
        );

        self.poll_anchor(now);
        self.poll_command_file(now).await;

        if self.machine.exit_requested {
            self.machine.exit_requested = false;
            self.act_on_exit_request(now).await;
        }

        loop_log!(self, state = %self.machine.supervisor, "Supervisor step");
        self.step_supervisor();
        loop_log!(self, state = %self.machine.child, "Child step");
        self.step_child(now).await;
        next_sleep
    }

    fn read_output(&mut self) -> bool {
        let started = Instant::now();
        let id = self
            .child
            .as_ref()
            .map(|child| child.id)
            .unwrap_or_else(|| self.policy.launches());
        while let Some(line) = self.process.read_line() {
            info!(target: "child", jvm = id, "{line}");
            if !self.config.filters.is_empty() {
                if let Some(rule) = self.config.filters.evaluate(&line).cloned() {
                    self.filter_matched(&rule);
                }
            }
            if started.elapsed() >= READ_BUDGET {
                return true;
            }
        }
        false
    }

    fn filter_matched(&mut self, rule: &FilterRule) {
        let trigger = rule.trigger();
        match rule.action() {
            FilterAction::Restart => {
                info!(trigger, "Filter trigger matched, restarting the child");
                self.request_restart();
            }
            FilterAction::Shutdown => {
                info!(trigger, "Filter trigger matched, shutting down");
                self.request_stop(1);
            }
            FilterAction::None => {}
        }
    }

    async fn read_control(&mut self) -> bool {
        let polled = self.channel.poll_incoming(READ_BUDGET).await;
        for event in polled.events {
            self.handle_event(event).await;
        }
        polled.more
    }

    /// A loop iteration that arrives much later than expected means the
    /// process was starved. The gap should not count against the child.
    fn check_cpu(&mut self, now: Tick) {
        let gap = Tick::age_seconds(self.last_cycle, now);
        let limit = self.config.timeouts.cpu;
        if limit > 0 && gap > limit {
            info!("The supervisor has not received any CPU time for {gap} seconds, extending timeouts");
            if let Some(deadline) = self.machine.deadline {
                self.machine.deadline = Some(deadline.add_seconds(gap));
            }
        }
        self.last_cycle = now;
    }

    async fn handle_request(&mut self, request: Request) {
        debug!(?request, "Handling request");
        let now = self.clock.now();
        match request {
            Request::Stop { exit_code } => self.request_stop(exit_code),
            Request::Restart => self.request_restart(),
            Request::Shutdown { signal } => self.shutdown_signalled(signal, now),
            Request::Signal(signal) => self.user_signal(signal, now),
            Request::Dump => self.request_dump(),
            Request::Pause => self.pause(),
            Request::Resume => self.resume(),
            Request::ControlCode(code) => self.forward_control_code(code).await,
            Request::ChildDied => {
                if self.machine.child.has_process() {
                    self.check_child(now).await;
                }
            }
        }
    }

    /// Asks for the child to be stopped. The supervisor itself only follows
    /// once the child is down and its exit code action says so.
    pub(crate) fn request_stop(&mut self, exit_code: i32) {
        if self.machine.supervisor.is_shutting_down() {
            debug!(exit_code, "Stop requested while already stopping, ignored");
            return;
        }
        debug!(exit_code, "Stop requested");
        let child = self.machine.child;
        if !(self.machine.exit_requested || child.is_going_down() || child == ChildState::Down) {
            self.machine.exit_requested = true;
        }
        self.machine.exit_code.set(exit_code);
        self.machine.restart = RestartMode::No;
    }

    pub(crate) fn request_restart(&mut self) {
        let m = &self.machine;
        if m.exit_requested
            || m.restart != RestartMode::No
            || m.child.is_going_down()
            || matches!(m.child, ChildState::Down | ChildState::LaunchDelay)
        {
            debug!(child = %m.child, "Restart requested while already restarting or stopping, ignored");
            return;
        }
        info!("Restarting the child");
        self.machine.exit_requested = true;
        self.machine.restart = RestartMode::Configured;
    }

    /// Interrupt and terminate. Repeating one while a stop is under way
    /// kills the child right away.
    fn shutdown_signalled(&mut self, signal: &'static str, now: Tick) {
        if self.config.signals.ignore_interrupts {
            info!("{signal} trapped, but ignored");
            return;
        }
        let m = &self.machine;
        if m.exit_requested
            || m.restart != RestartMode::No
            || m.child.is_going_down()
            || m.child == ChildState::Down
        {
            info!("{signal} trapped, forcing immediate shutdown");
            self.dump_on_kill = false;
            self.kill_child(now);
        } else {
            info!("{signal} trapped, shutting down");
            self.request_stop(0);
        }
        if !self.machine.supervisor.is_shutting_down() {
            self.set_supervisor_state(SupervisorState::Stopping);
        }
    }

    fn user_signal(&mut self, signal: UserSignal, now: Tick) {
        let (mode, forwarded) = match signal {
            UserSignal::Hangup => (self.config.signals.hup, ChildSignal::Hangup),
            UserSignal::User1 => (self.config.signals.usr1, ChildSignal::User1),
            UserSignal::User2 => (self.config.signals.usr2, ChildSignal::User2),
        };
        let name = signal.name();
        match mode {
            SignalMode::Ignore => info!("{name} trapped, but ignored"),
            SignalMode::Restart => {
                info!("{name} trapped, restarting the child");
                self.request_restart();
            }
            SignalMode::Shutdown => self.shutdown_signalled(name, now),
            SignalMode::Forward => match self.process.signal(forwarded) {
                Ok(()) => debug!("{name} trapped, forwarded to the child"),
                Err(err) => debug!(?err, "{name} trapped, but there is no child to forward it to"),
            },
        }
    }

    fn request_dump(&mut self) {
        match self.process.signal(ChildSignal::Dump) {
            Ok(()) => info!("Requested a state dump from the child"),
            Err(err) => warn!(?err, "Unable to request a state dump"),
        }
    }

    fn pausable(&self) -> bool {
        self.service && self.config.service.pausable
    }

    fn pause(&mut self) {
        if !self.pausable() {
            info!("Pause requested, but the supervisor is not pausable");
            return;
        }
        match self.machine.supervisor {
            SupervisorState::Starting | SupervisorState::Started | SupervisorState::Continuing => {
                info!("Pausing");
                self.set_supervisor_state(SupervisorState::Pausing);
            }
            state => debug!(%state, "Pause requested, ignored"),
        }
    }

    fn resume(&mut self) {
        if !self.pausable() {
            info!("Resume requested, but the supervisor is not pausable");
            return;
        }
        match self.machine.supervisor {
            SupervisorState::Pausing | SupervisorState::Paused => {
                info!("Resuming");
                self.set_supervisor_state(SupervisorState::Continuing);
            }
            state => debug!(%state, "Resume requested, ignored"),
        }
    }

    async fn forward_control_code(&mut self, code: i32) {
        if !self.channel.is_connected() {
            debug!(code, "No child connected, control code dropped");
            return;
        }
        let message = ControlMessage::new(MessageCode::ServiceControlCode, code.to_string());
        if let Err(err) = self.channel.send(message).await {
            warn!(?err, code, "Failed to forward control code");
        }
    }

    /// Acts on a pending stop or restart request.
    async fn act_on_exit_request(&mut self, now: Tick) {
        match self.machine.child {
            ChildState::Down | ChildState::Restart | ChildState::Launch => {}
            ChildState::LaunchDelay => self.set_child_state(ChildState::Down, now, None),
            state if state.is_going_down() => {}
            _ => {
                if self.check_child(now).await {
                    self.machine.restart = RestartMode::No;
                } else {
                    debug!("Asking the child to stop");
                    self.set_child_state(ChildState::Stop, now, None);
                }
            }
        }
    }

    /// Polls the child for an exit. Returns true if it is gone.
    async fn check_child(&mut self, now: Tick) -> bool {
        match self.process.poll_exit() {
            ProcessStatus::Running => false,
            ProcessStatus::Exited(exit) => {
                self.child_exited(now, exit).await;
                true
            }
            ProcessStatus::Missing if self.child.is_some() => {
                warn!("Lost track of the child process");
                self.child_exited(now, ChildExit::code(1)).await;
                true
            }
            ProcessStatus::Missing => false,
        }
    }

    pub(crate) fn set_supervisor_state(&mut self, state: SupervisorState) {
        if self.machine.supervisor == state {
            return;
        }
        state_log!(self, from = %self.machine.supervisor, to = %state, "Supervisor state");
        self.machine.supervisor = state;
        let wait_hint = self.wait_hint_ms(state);
        self.host
            .report_status(state, self.machine.exit_code.get(), wait_hint);
        self.files.write_status(state.name());
    }

    /// Moves the child axis. `delay` is in seconds, `None` means no deadline.
    pub(crate) fn set_child_state(&mut self, state: ChildState, now: Tick, delay: Option<i32>) {
        let from = self.machine.child;
        self.machine.enter(state, now, delay);
        state_log!(
            self,
            from = %from,
            to = %state,
            deadline = ?self.machine.deadline.map(|d| d.0),
            "Child state"
        );
        self.files.write_child_status(state.name());
    }

    fn extend_deadline(&mut self, now: Tick, seconds: i32) {
        let before = self.machine.deadline;
        if self.machine.update_deadline(now, Some(seconds)) {
            state_log!(self, child = %self.machine.child, seconds, ?before, after = ?self.machine.deadline, "Deadline extended");
        } else {
            state_log!(self, child = %self.machine.child, seconds, "Deadline extension ignored");
        }
    }

    fn wait_hint_ms(&self, state: SupervisorState) -> u32 {
        let t = &self.config.timeouts;
        match state {
            SupervisorState::Starting | SupervisorState::Continuing => {
                if t.startup > 0 {
                    t.startup as u32 * 1000
                } else {
                    WAIT_HINT_DAY_MS
                }
            }
            SupervisorState::Stopping | SupervisorState::Pausing => {
                if t.shutdown <= 0 || t.exit <= 0 {
                    WAIT_HINT_DAY_MS
                } else {
                    (GRACE_SECS + t.shutdown.max(t.exit)) as u32 * 1000
                }
            }
            _ => 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn machine(&self) -> &Machine {
        &self.machine
    }

    #[cfg(test)]
    pub(crate) fn policy(&self) -> &RestartPolicy {
        &self.policy
    }
}
