//! Files checked on a fixed interval: the anchor and the command file.

use super::types::{ChildState, Request, RestartMode, SupervisorState};
use super::Supervisor;
use crate::process::ProcessController;
use crate::protocol::ControlTransport;
use crate::tick::Tick;
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use tracing::{info, warn};

impl<P: ProcessController, T: ControlTransport> Supervisor<P, T> {
    pub(super) fn poll_anchor(&mut self, now: Tick) {
        if !Tick::expired(now, self.anchor_due) {
            return;
        }
        self.anchor_due = now.add_seconds(self.config.files.anchor_poll_interval);
        if self.files.anchor_exists() != Some(false) {
            return;
        }

        let m = &self.machine;
        if m.exit_requested
            || m.restart != RestartMode::No
            || m.child.is_going_down()
            || m.child == ChildState::Down
        {
            return;
        }
        info!("Anchor file deleted, shutting down");
        self.request_stop(0);
        if !self.machine.supervisor.is_shutting_down() {
            self.set_supervisor_state(SupervisorState::Stopping);
        }
    }

    pub(super) async fn poll_command_file(&mut self, now: Tick) {
        if !Tick::expired(now, self.command_due) {
            return;
        }
        self.command_due = now.add_seconds(self.config.files.command_poll_interval);
        let commands = match self.files.take_commands() {
            Ok(Some(commands)) => commands,
            Ok(None) => return,
            Err(err) => {
                warn!(?err, "Unable to read the command file");
                return;
            }
        };
        for command in commands {
            match parse_command(&command) {
                Ok(request) => {
                    info!(%command, "Command file");
                    self.handle_request(request).await;
                }
                Err(err) => warn!(?err, %command, "Ignoring command"),
            }
        }
    }
}

/// Parses one line of the command file. Command names are case-insensitive.
pub fn parse_command(line: &str) -> Result<Request> {
    let mut words = line.split_whitespace();
    let name = words.next().unwrap_or_default().to_ascii_uppercase();
    let argument = words.next();
    let number = |raw: &str| -> Result<i32> {
        raw.parse()
            .wrap_err_with(|| format!("{name}: {raw:?} is not a number"))
    };

    let request = match name.as_str() {
        "RESTART" => Request::Restart,
        "STOP" => Request::Stop {
            exit_code: argument.map(number).transpose()?.unwrap_or(0),
        },
        "PAUSE" => Request::Pause,
        "RESUME" => Request::Resume,
        "DUMP" => Request::Dump,
        "CONTROL_CODE" => Request::ControlCode(number(
            argument.ok_or_else(|| eyre!("CONTROL_CODE needs a code"))?,
        )?),
        "" => bail!("Empty command"),
        other => bail!("Unknown command {other:?}"),
    };
    Ok(request)
}
