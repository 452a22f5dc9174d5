use crate::tick::Tick;
use std::fmt;

/// Service visible state of the supervisor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Started,
    Pausing,
    Paused,
    Continuing,
    Stopping,
    Stopped,
}

impl SupervisorState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Continuing => "CONTINUING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }

    /// States in which a down child may be (re)launched.
    pub fn wants_child(self) -> bool {
        matches!(self, Self::Starting | Self::Started | Self::Continuing)
    }

    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Down,
    LaunchDelay,
    Restart,
    Launch,
    Launching,
    Launched,
    Starting,
    Started,
    Stop,
    Stopping,
    Stopped,
    Killing,
    Kill,
}

impl ChildState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Down => "DOWN",
            Self::LaunchDelay => "LAUNCH_DELAY",
            Self::Restart => "RESTART",
            Self::Launch => "LAUNCH",
            Self::Launching => "LAUNCHING",
            Self::Launched => "LAUNCHED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stop => "STOP",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Killing => "KILLING",
            Self::Kill => "KILL",
        }
    }

    /// The child is already on its way out.
    pub fn is_going_down(self) -> bool {
        matches!(
            self,
            Self::Stop | Self::Stopping | Self::Stopped | Self::Killing | Self::Kill
        )
    }

    /// A process exists for this state.
    pub fn has_process(self) -> bool {
        !matches!(
            self,
            Self::Down | Self::LaunchDelay | Self::Restart | Self::Launch
        )
    }
}

impl fmt::Display for ChildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why the next launch happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    No,
    Initial,
    /// Crash, hang or timeout.
    Automatic,
    /// Operator, output filter or exit code action.
    Configured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSignal {
    Hangup,
    User1,
    User2,
}

impl UserSignal {
    pub fn name(self) -> &'static str {
        match self {
            Self::Hangup => "HUP",
            Self::User1 => "USR1",
            Self::User2 => "USR2",
        }
    }
}

/// Work handed to the event loop by signal handlers, the command file and
/// other asynchronous sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Stop { exit_code: i32 },
    Restart,
    /// Interrupt or terminate. A repeat while stopping forces a kill.
    Shutdown { signal: &'static str },
    Signal(UserSignal),
    Dump,
    Pause,
    Resume,
    ControlCode(i32),
    /// Poll the child exit status right away.
    ChildDied,
}

/// Exit code of the supervisor. A zero never replaces a non-zero code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitCodeLatch(i32);

impl ExitCodeLatch {
    pub fn record(&mut self, code: i32) {
        if code != 0 && self.0 == 0 {
            self.0 = code;
        }
    }

    /// Explicit stop requests carry the code the requester wants.
    pub fn set(&mut self, code: i32) {
        self.0 = code;
    }

    pub fn ensure_failure(&mut self) {
        if self.0 == 0 {
            self.0 = 1;
        }
    }

    pub fn get(&self) -> i32 {
        self.0
    }
}

/// The running child, from spawn until it is reaped.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    pub pid: u32,
    /// Launch counter value, shown as `jvm` in logs.
    pub id: u32,
}

/// Both state axes plus the single deadline of the current child state.
#[derive(Debug)]
pub struct Machine {
    pub supervisor: SupervisorState,
    pub child: ChildState,
    pub deadline: Option<Tick>,
    pub exit_requested: bool,
    pub restart: RestartMode,
    pub exit_code: ExitCodeLatch,
    pub last_ping: Tick,
    pub last_logged_ping: Tick,
}

impl Machine {
    pub fn new(now: Tick) -> Self {
        Self {
            supervisor: SupervisorState::Starting,
            child: ChildState::Down,
            deadline: None,
            exit_requested: false,
            restart: RestartMode::Initial,
            exit_code: ExitCodeLatch::default(),
            last_ping: now,
            last_logged_ping: now,
        }
    }

    /// Moves the child axis. Returns false if the state did not change. A
    /// changed state drops the previous deadline before the new one is set.
    pub fn enter(&mut self, state: ChildState, now: Tick, delay: Option<i32>) -> bool {
        let changed = self.child != state;
        if changed {
            self.deadline = None;
        }
        self.child = state;
        self.update_deadline(now, delay);
        changed
    }

    /// Sets `now + delay` if it lies beyond the current deadline. `None`
    /// clears the deadline.
    pub fn update_deadline(&mut self, now: Tick, delay: Option<i32>) -> bool {
        let Some(delay) = delay else {
            self.deadline = None;
            return true;
        };
        let candidate = now.add_seconds(delay);
        match self.deadline {
            Some(current) if candidate.ticks_since(current) <= 0 => false,
            _ => {
                self.deadline = Some(candidate);
                true
            }
        }
    }

    pub fn deadline_expired(&self, now: Tick) -> bool {
        self.deadline
            .map(|deadline| Tick::expired(now, deadline))
            .unwrap_or(false)
    }
}

/// `Some(seconds)` for an enabled timeout, `None` when it is disabled.
pub fn timeout(seconds: i32) -> Option<i32> {
    (seconds > 0).then_some(seconds)
}
