//! Per-state work done once every loop iteration.

use super::types::{timeout, ChildHandle, ChildState, RestartMode, SupervisorState};
use super::Supervisor;
use crate::configs::{ExitAction, GRACE_SECS};
use crate::process::{KillOutcome, LaunchSpec, ProcessController};
use crate::protocol::{AuthKey, ControlMessage, ControlTransport, MessageCode};
use crate::restart::Decision;
use crate::tick::Tick;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Seconds the child gets to write a state dump before it is killed.
const DUMP_GRACE_SECS: i32 = 5;

impl<P: ProcessController, T: ControlTransport> Supervisor<P, T> {
    pub(super) fn step_supervisor(&mut self) {
        let child = self.machine.child;
        match self.machine.supervisor {
            SupervisorState::Starting | SupervisorState::Continuing => {
                if child == ChildState::Started {
                    self.set_supervisor_state(SupervisorState::Started);
                }
            }
            SupervisorState::Pausing => self.on_pausing(),
            SupervisorState::Stopping => {
                if child == ChildState::Down {
                    self.set_supervisor_state(SupervisorState::Stopped);
                }
            }
            SupervisorState::Started | SupervisorState::Paused | SupervisorState::Stopped => {}
        }
    }

    fn on_pausing(&mut self) {
        if !self.config.service.pausable_stop_child || self.machine.child == ChildState::Down {
            self.set_supervisor_state(SupervisorState::Paused);
            return;
        }
        if !(self.machine.exit_requested || self.machine.child.is_going_down()) {
            debug!("Stopping the child to pause");
            self.machine.exit_requested = true;
            self.machine.restart = RestartMode::Configured;
        }
    }

    pub(super) async fn step_child(&mut self, now: Tick) {
        match self.machine.child {
            ChildState::Down => self.on_down(now),
            ChildState::LaunchDelay => self.on_launch_delay(now).await,
            ChildState::Restart => {
                let next = if self.machine.supervisor.wants_child() {
                    ChildState::Launch
                } else {
                    ChildState::Down
                };
                self.set_child_state(next, now, None);
            }
            ChildState::Launch => self.on_launch(now).await,
            ChildState::Launching => {
                if !self.check_child(now).await && self.machine.deadline_expired(now) {
                    error!("Startup failed: timed out waiting for the child to connect");
                    self.fail(now);
                }
            }
            ChildState::Launched => self.on_launched(now).await,
            ChildState::Starting => {
                if !self.check_child(now).await && self.machine.deadline_expired(now) {
                    error!("Startup failed: timed out waiting for the child to report started");
                    self.fail(now);
                }
            }
            ChildState::Started => self.on_started(now).await,
            ChildState::Stop => self.on_stop(now).await,
            ChildState::Stopping => {
                if !self.check_child(now).await && self.machine.deadline_expired(now) {
                    error!("Shutdown failed: timed out waiting for the child to stop");
                    self.kill_child(now);
                }
            }
            ChildState::Stopped => {
                if !self.check_child(now).await && self.machine.deadline_expired(now) {
                    error!("Timed out waiting for the child process to exit");
                    self.kill_child(now);
                }
            }
            ChildState::Killing => {
                if !self.check_child(now).await && self.machine.deadline_expired(now) {
                    self.set_child_state(ChildState::Kill, now, None);
                }
            }
            ChildState::Kill => {
                if !self.check_child(now).await {
                    self.kill_now(now).await;
                }
            }
        }
    }

    fn on_down(&mut self, now: Tick) {
        let supervisor = self.machine.supervisor;
        if supervisor.wants_child() {
            if self.machine.restart == RestartMode::No {
                self.apply_exit_action();
            } else {
                let mode = std::mem::replace(&mut self.machine.restart, RestartMode::No);
                self.schedule_launch(mode, now);
            }
        } else if supervisor == SupervisorState::Paused
            && !self.config.service.pausable_stop_child
            && self.machine.restart == RestartMode::No
        {
            self.apply_exit_action();
        }
        self.machine.last_ping = now;
        self.machine.last_logged_ping = now;
    }

    fn schedule_launch(&mut self, mode: RestartMode, now: Tick) {
        if self.policy.launches() == 0 {
            self.policy.reset_failures();
            let delay = self.policy.startup_delay(self.service);
            if delay > 0 {
                info!("Waiting {delay} seconds before launching the child");
            }
            self.set_child_state(ChildState::LaunchDelay, now, Some(delay));
            return;
        }
        if self.machine.supervisor == SupervisorState::Continuing
            && self.config.service.pausable_stop_child
        {
            self.policy.reset_failures();
            self.set_child_state(ChildState::LaunchDelay, now, Some(0));
            return;
        }

        match self.policy.after_down(mode, now) {
            Decision::Relaunch { delay } => {
                let failed = self.policy.failed_invocations();
                if delay > 0 {
                    info!(?mode, failed, "Waiting {delay} seconds before relaunching the child");
                } else {
                    debug!(?mode, failed, "Relaunching the child");
                }
                self.set_child_state(ChildState::LaunchDelay, now, Some(delay));
            }
            Decision::Disabled { automatic_only: true } => {
                info!("Automatic restarts are disabled, shutting down");
                self.set_supervisor_state(SupervisorState::Stopping);
            }
            Decision::Disabled { automatic_only: false } => {
                info!("Restarts are disabled, shutting down");
                self.set_supervisor_state(SupervisorState::Stopping);
            }
            Decision::GiveUp { failed } => {
                error!(
                    "The child failed {failed} times in a row, each within {} seconds of its launch, giving up",
                    self.config.restart.successful_invocation_time
                );
                self.machine.exit_code.ensure_failure();
                self.set_supervisor_state(SupervisorState::Stopping);
            }
        }
    }

    fn apply_exit_action(&mut self) {
        let exit_code = self.machine.exit_code.get();
        match self.config.on_exit.action_for(exit_code) {
            ExitAction::Restart => {
                info!(exit_code, "Exit code action is restart, relaunching the child");
                self.machine.restart = RestartMode::Configured;
            }
            ExitAction::Shutdown => {
                debug!(exit_code, "Exit code action is shutdown");
                self.set_supervisor_state(SupervisorState::Stopping);
            }
        }
    }

    async fn on_launch_delay(&mut self, now: Tick) {
        if !self.machine.supervisor.wants_child() {
            self.set_child_state(ChildState::Down, now, None);
            return;
        }
        if !self.machine.deadline_expired(now) {
            return;
        }

        self.policy.record_launch(now);
        let id = self.policy.next_launch_id();
        let key = AuthKey::generate();
        let port = match self.channel.listen().await {
            Ok(port) => port,
            Err(err) => {
                error!(?err, "Unable to open the control port, launch failed");
                self.machine.restart = RestartMode::Automatic;
                self.set_child_state(ChildState::Down, now, None);
                return;
            }
        };
        match self.launch_spec(id, &key, port) {
            Ok(spec) => self.pending = Some((spec, key)),
            Err(err) => {
                error!(?err, "Unable to build the child command line");
                self.channel.stop_listening().await;
                self.machine.exit_code.set(1);
                self.set_supervisor_state(SupervisorState::Stopping);
                return;
            }
        }
        let next = if id > 1 {
            ChildState::Restart
        } else {
            ChildState::Launch
        };
        self.set_child_state(next, now, None);
    }

    fn launch_spec(&self, id: u32, key: &AuthKey, port: u16) -> Result<LaunchSpec> {
        let values: HashMap<&str, String> = HashMap::from([
            ("key", key.as_str().to_string()),
            ("port", port.to_string()),
            ("jvmid", id.to_string()),
            ("pid", std::process::id().to_string()),
        ]);
        let words = self.config.child.command_line(&values)?;
        let mut spec =
            LaunchSpec::from_command_line(words, id).ok_or_else(|| eyre!("child.command is empty"))?;
        spec.working_directory = self.config.child.working_directory.clone();
        spec.env = self.config.child.env.clone();
        spec.env.extend([
            ("WARDEN_KEY".to_string(), values["key"].clone()),
            ("WARDEN_PORT".to_string(), values["port"].clone()),
            ("WARDEN_JVMID".to_string(), values["jvmid"].clone()),
        ]);
        Ok(spec)
    }

    async fn on_launch(&mut self, now: Tick) {
        if !self.machine.supervisor.wants_child() {
            self.pending = None;
            self.channel.stop_listening().await;
            self.set_child_state(ChildState::Down, now, None);
            return;
        }
        let Some((spec, key)) = self.pending.take() else {
            warn!("Nothing prepared to launch");
            self.machine.restart = RestartMode::Automatic;
            self.set_child_state(ChildState::Down, now, None);
            return;
        };

        info!(
            jvm = spec.id,
            program = %spec.program,
            port = ?self.channel.port(),
            "Launching the child"
        );
        match self.process.launch(&spec).await {
            Ok(pid) => {
                info!(jvm = spec.id, pid, "Child launched");
                self.child = Some(ChildHandle { pid, id: spec.id });
                self.channel.expect_key(Some(key));
                self.files.write_child_pid(pid);
                self.set_child_state(
                    ChildState::Launching,
                    now,
                    timeout(self.config.timeouts.startup),
                );
            }
            Err(err) => {
                error!(?err, jvm = spec.id, "Unable to launch the child");
                self.machine.exit_code.record(1);
                self.machine.restart = RestartMode::Automatic;
                self.channel.stop_listening().await;
                self.set_child_state(ChildState::Down, now, None);
            }
        }
    }

    async fn on_launched(&mut self, now: Tick) {
        match self
            .channel
            .send(ControlMessage::new(MessageCode::Start, "start"))
            .await
        {
            Ok(()) => self.set_child_state(
                ChildState::Starting,
                now,
                timeout(self.config.timeouts.startup),
            ),
            Err(err) => {
                error!(?err, "Unable to send the start command to the child");
                self.fail(now);
            }
        }
    }

    async fn on_started(&mut self, now: Tick) {
        if self.check_child(now).await {
            return;
        }
        if self.machine.deadline_expired(now) {
            error!("Child appears hung: timed out waiting for a ping reply");
            self.fail(now);
            return;
        }

        let timeouts = &self.config.timeouts;
        if !Tick::expired(now, self.machine.last_ping.add_seconds(timeouts.ping_interval)) {
            return;
        }
        let logged = Tick::expired(
            now,
            self.machine
                .last_logged_ping
                .add_seconds(timeouts.ping_interval_logged),
        );
        let payload = if logged {
            self.machine.last_logged_ping = now;
            "ping"
        } else {
            "silent"
        };
        loop_log!(self, payload, "Sending ping");
        if let Err(err) = self
            .channel
            .send(ControlMessage::new(MessageCode::Ping, payload))
            .await
        {
            debug!(?err, "Unable to send ping");
        }
        self.machine.last_ping = now;
    }

    async fn on_stop(&mut self, now: Tick) {
        if self.check_child(now).await {
            return;
        }
        if let Err(err) = self
            .channel
            .send(ControlMessage::new(MessageCode::Stop, ""))
            .await
        {
            warn!(?err, "Unable to send the stop command to the child");
        }
        self.set_child_state(
            ChildState::Stopping,
            now,
            timeout(self.config.timeouts.shutdown).map(|secs| secs + GRACE_SECS),
        );
    }

    /// Kills a child that failed to start or to answer, and asks for an
    /// automatic restart.
    fn fail(&mut self, now: Tick) {
        self.kill_child(now);
        self.machine.restart = RestartMode::Automatic;
    }

    /// Starts the kill sequence. With dumps enabled the child first gets a
    /// few seconds to write one.
    pub(super) fn kill_child(&mut self, now: Tick) {
        match self.machine.child {
            ChildState::Down => return,
            ChildState::LaunchDelay => {
                self.set_child_state(ChildState::Down, now, None);
                return;
            }
            ChildState::Kill => return,
            _ => {}
        }
        let mut delay = 0;
        if self.dump_on_kill && self.process.pid().is_some() {
            self.request_dump();
            delay = DUMP_GRACE_SECS;
        }
        self.set_child_state(ChildState::Killing, now, Some(delay));
        if delay == 0 {
            // A forced kill cuts any pending dump grace short.
            self.machine.deadline = Some(now);
        }
    }

    pub(super) async fn kill_now(&mut self, now: Tick) {
        match self.process.kill().await {
            Ok(KillOutcome::Killed(exit)) => {
                warn!(signal = ?exit.signal, "Child killed");
                self.machine.exit_code.record(1);
            }
            Ok(KillOutcome::Exited(exit)) => {
                info!(code = exit.code, "Child had already exited");
                self.machine.exit_code.record(exit.code);
            }
            Ok(KillOutcome::NotRunning) => {}
            Err(err) => {
                error!(?err, "Unable to kill the child, treating it as down");
                self.machine.exit_code.record(1);
            }
        }
        self.set_child_state(ChildState::Down, now, None);
        self.release_child().await;
    }

    /// Forgets everything tied to the child instance that just went down.
    pub(super) async fn release_child(&mut self) {
        self.child = None;
        self.pending = None;
        self.channel.close().await;
        self.channel.stop_listening().await;
        self.channel.expect_key(None);
        self.files.remove_child_pid();
    }
}
