use super::types::{timeout, ChildState, RestartMode, SupervisorState};
use super::Supervisor;
use crate::configs::GRACE_SECS;
use crate::process::{ChildExit, ProcessController};
use crate::protocol::{
    linearize_properties, ChannelEvent, ControlMessage, ControlTransport, LogLevel, MessageCode,
};
use crate::tick::Tick;
use tracing::{debug, error, info, warn};

impl<P: ProcessController, T: ControlTransport> Supervisor<P, T> {
    pub(super) async fn handle_event(&mut self, event: ChannelEvent) {
        let now = self.clock.now();
        match event {
            ChannelEvent::Authenticated => self.key_registered(now).await,
            ChannelEvent::Message(message) => self.handle_message(message, now),
        }
    }

    async fn key_registered(&mut self, now: Tick) {
        match self.machine.child {
            ChildState::Launching => {
                self.set_child_state(ChildState::Launched, now, None);
                let ping = timeout(self.config.timeouts.ping).unwrap_or(0);
                let follow_up = [
                    ControlMessage::new(
                        MessageCode::LowLogLevel,
                        self.config.log.child_threshold().to_string(),
                    ),
                    ControlMessage::new(MessageCode::PingTimeout, ping.to_string()),
                    ControlMessage::new(
                        MessageCode::Properties,
                        linearize_properties(&self.properties, self.config.control.separator),
                    ),
                ];
                for message in follow_up {
                    if let Err(err) = self.channel.send(message).await {
                        warn!(?err, "Unable to send the handshake follow-up");
                        break;
                    }
                }
            }
            // A stop was requested before the child had connected.
            ChildState::Stopping => self.set_child_state(ChildState::Stop, now, None),
            state => debug!(%state, "Key accepted in an unexpected state"),
        }
    }

    fn handle_message(&mut self, message: ControlMessage, now: Tick) {
        loop_log!(self, code = %message.code, payload = %message.payload, "Control message");
        match message.code {
            MessageCode::Stop => {
                let exit_code = message.payload.trim().parse().unwrap_or(0);
                info!(exit_code, "Child requested a shutdown");
                self.request_stop(exit_code);
            }
            MessageCode::Restart => {
                info!("Child requested a restart");
                self.request_restart();
            }
            MessageCode::Ping => {
                if self.machine.child == ChildState::Started {
                    let delay = timeout(self.config.timeouts.ping).map(|secs| secs + GRACE_SECS);
                    self.machine.update_deadline(now, delay);
                }
            }
            MessageCode::StopPending => {
                let hint = message.wait_hint_secs().unwrap_or(0);
                if self.machine.child == ChildState::Started {
                    self.set_child_state(ChildState::Stopping, now, None);
                }
                if self.machine.child == ChildState::Stopping {
                    self.extend_deadline(now, hint);
                }
            }
            MessageCode::StartPending => {
                let hint = message.wait_hint_secs().unwrap_or(0);
                if matches!(self.machine.child, ChildState::Starting | ChildState::Stopping) {
                    self.extend_deadline(now, hint);
                }
            }
            MessageCode::Started => match self.machine.child {
                ChildState::Starting => {
                    let delay = timeout(self.config.timeouts.ping).map(|secs| secs + GRACE_SECS);
                    self.set_child_state(ChildState::Started, now, delay);
                    if self.machine.supervisor == SupervisorState::Starting {
                        self.set_supervisor_state(SupervisorState::Started);
                    }
                }
                ChildState::Stopping => self.set_child_state(ChildState::Stop, now, None),
                state => debug!(%state, "Started reported in an unexpected state"),
            },
            MessageCode::Stopped => {
                if matches!(
                    self.machine.child,
                    ChildState::Launched
                        | ChildState::Starting
                        | ChildState::Started
                        | ChildState::Stop
                        | ChildState::Stopping
                ) {
                    let delay = timeout(self.config.timeouts.exit).map(|secs| secs + GRACE_SECS);
                    self.set_child_state(ChildState::Stopped, now, delay);
                }
            }
            MessageCode::Log(level) => self.child_log(level, &message.payload),
            code => debug!(%code, "Ignoring unexpected message from the child"),
        }
    }

    fn child_log(&self, level: LogLevel, text: &str) {
        let jvm = self.child.as_ref().map(|child| child.id).unwrap_or_default();
        match level {
            LogLevel::Debug => debug!(target: "child", jvm, "{text}"),
            LogLevel::Info | LogLevel::Status => info!(target: "child", jvm, "{text}"),
            LogLevel::Warn => warn!(target: "child", jvm, "{text}"),
            LogLevel::Error | LogLevel::Fatal => error!(target: "child", jvm, "{text}"),
        }
    }

    /// Latches the exit code and moves the child to DOWN.
    pub(super) async fn child_exited(&mut self, now: Tick, exit: ChildExit) {
        self.machine.exit_code.record(exit.code);
        let pid = self.child.as_ref().map(|child| child.pid);
        let code = exit.code;
        match self.machine.child {
            state @ (ChildState::Down
            | ChildState::LaunchDelay
            | ChildState::Restart
            | ChildState::Launch) => {
                debug!(%state, code, "Exit reported while no child was running");
                return;
            }
            ChildState::Launching | ChildState::Launched => {
                self.machine.restart = RestartMode::Automatic;
                error!(?pid, code, signal = ?exit.signal, "Child exited while launching");
            }
            ChildState::Starting => {
                self.machine.restart = RestartMode::Automatic;
                error!(?pid, code, signal = ?exit.signal, "Child exited while starting");
            }
            ChildState::Started => {
                self.machine.restart = RestartMode::Automatic;
                error!(?pid, code, signal = ?exit.signal, "Child exited unexpectedly");
            }
            ChildState::Stop | ChildState::Stopping => {
                warn!(?pid, code, "Child exited while stopping");
            }
            ChildState::Stopped => debug!(?pid, code, "Child exited normally"),
            ChildState::Killing | ChildState::Kill => {
                info!(?pid, code, "Child exited on its own before it was killed");
            }
        }
        self.set_child_state(ChildState::Down, now, None);
        self.release_child().await;
    }
}
