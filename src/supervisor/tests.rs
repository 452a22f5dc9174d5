use super::types::{ChildState, Request, SupervisorState, UserSignal};
use super::{Parts, Supervisor};
use crate::configs::{ExitAction, Properties, SignalMode, SupervisorConfig};
use crate::process::filter::{FilterAction, FilterRule, OutputFilters};
use crate::process::{
    ChildExit, ChildSignal, KillOutcome, LaunchSpec, ProcessController, ProcessStatus,
};
use crate::protocol::{
    AuthKey, ChannelEvent, ControlMessage, ControlTransport, MessageCode, Polled,
};
use crate::service::ServiceHost;
use crate::tick::manual::ManualClock;
use crate::tick::Clock;
use async_trait::async_trait;
use color_eyre::eyre::bail;
use color_eyre::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::{self, Sender};

#[derive(Default)]
struct ProcessState {
    attempts: u32,
    launched: Vec<LaunchSpec>,
    running: bool,
    exit: Option<ChildExit>,
    fail_launch: bool,
    output: VecDeque<String>,
    kills: u32,
    signals: Vec<ChildSignal>,
}

#[derive(Clone, Default)]
struct FakeProcess(Arc<Mutex<ProcessState>>);

impl FakeProcess {
    fn exit(&self, code: i32) {
        self.0.lock().exit = Some(ChildExit::code(code));
    }

    fn print(&self, line: &str) {
        self.0.lock().output.push_back(line.to_string());
    }

    fn launches(&self) -> usize {
        self.0.lock().launched.len()
    }

    fn kills(&self) -> u32 {
        self.0.lock().kills
    }
}

#[async_trait]
impl ProcessController for FakeProcess {
    async fn launch(&mut self, spec: &LaunchSpec) -> Result<u32> {
        let mut state = self.0.lock();
        state.attempts += 1;
        if state.fail_launch {
            bail!("No such file or directory");
        }
        state.launched.push(spec.clone());
        state.running = true;
        state.exit = None;
        Ok(1000 + state.launched.len() as u32)
    }

    fn poll_exit(&mut self) -> ProcessStatus {
        let mut state = self.0.lock();
        if !state.running {
            return ProcessStatus::Missing;
        }
        match state.exit.take() {
            Some(exit) => {
                state.running = false;
                ProcessStatus::Exited(exit)
            }
            None => ProcessStatus::Running,
        }
    }

    fn read_line(&mut self) -> Option<String> {
        self.0.lock().output.pop_front()
    }

    async fn kill(&mut self) -> Result<KillOutcome> {
        let mut state = self.0.lock();
        if !state.running {
            return Ok(KillOutcome::NotRunning);
        }
        state.running = false;
        if let Some(exit) = state.exit.take() {
            return Ok(KillOutcome::Exited(exit));
        }
        state.kills += 1;
        Ok(KillOutcome::Killed(ChildExit {
            code: 1,
            signal: Some(9),
        }))
    }

    fn signal(&mut self, signal: ChildSignal) -> Result<()> {
        let mut state = self.0.lock();
        if !state.running {
            bail!("No child running");
        }
        state.signals.push(signal);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        let state = self.0.lock();
        state.running.then(|| 1000 + state.launched.len() as u32)
    }
}

#[derive(Default)]
struct ChannelState {
    listening: bool,
    connected: bool,
    expected: Option<AuthKey>,
    incoming: VecDeque<ChannelEvent>,
    sent: Vec<ControlMessage>,
    fail_listen: bool,
}

/// Stands in for the TCP channel. Key checking is covered by the channel's
/// own tests, so `connect` simply authenticates.
#[derive(Clone, Default)]
struct FakeChannel(Arc<Mutex<ChannelState>>);

impl FakeChannel {
    fn connect(&self) {
        let mut state = self.0.lock();
        assert!(state.expected.is_some(), "no key is expected");
        state.connected = true;
        state.incoming.push_back(ChannelEvent::Authenticated);
    }

    fn receive(&self, code: MessageCode, payload: &str) {
        self.0
            .lock()
            .incoming
            .push_back(ChannelEvent::Message(ControlMessage::new(code, payload)));
    }

    fn sent(&self) -> Vec<ControlMessage> {
        self.0.lock().sent.clone()
    }

    fn sent_codes(&self) -> Vec<MessageCode> {
        self.0.lock().sent.iter().map(|m| m.code).collect()
    }
}

#[async_trait]
impl ControlTransport for FakeChannel {
    async fn listen(&mut self) -> Result<u16> {
        let mut state = self.0.lock();
        if state.fail_listen {
            bail!("Address already in use");
        }
        state.listening = true;
        Ok(32000)
    }

    async fn stop_listening(&mut self) {
        self.0.lock().listening = false;
    }

    fn port(&self) -> Option<u16> {
        self.0.lock().listening.then_some(32000)
    }

    fn is_connected(&self) -> bool {
        self.0.lock().connected
    }

    fn expect_key(&mut self, key: Option<AuthKey>) {
        self.0.lock().expected = key;
    }

    async fn poll_incoming(&mut self, _budget: Duration) -> Polled {
        let events = self.0.lock().incoming.drain(..).collect();
        Polled {
            events,
            more: false,
        }
    }

    async fn send(&mut self, message: ControlMessage) -> Result<()> {
        let mut state = self.0.lock();
        if !state.connected {
            bail!("Not connected");
        }
        state.sent.push(message);
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.0.lock();
        state.connected = false;
        state.incoming.clear();
    }
}

#[derive(Clone, Default)]
struct RecordingHost(Arc<Mutex<Vec<(SupervisorState, i32, u32)>>>);

impl RecordingHost {
    fn states(&self) -> Vec<SupervisorState> {
        self.0.lock().iter().map(|(state, ..)| *state).collect()
    }

    fn hint_for(&self, wanted: SupervisorState) -> Option<u32> {
        self.0
            .lock()
            .iter()
            .find(|(state, ..)| *state == wanted)
            .map(|(_, _, hint)| *hint)
    }
}

impl ServiceHost for RecordingHost {
    fn report_status(&mut self, state: SupervisorState, exit_code: i32, wait_hint_ms: u32) {
        self.0.lock().push((state, exit_code, wait_hint_ms));
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    process: FakeProcess,
    channel: FakeChannel,
    host: RecordingHost,
    requests: Sender<Request>,
    supervisor: Supervisor<FakeProcess, FakeChannel>,
}

impl Harness {
    fn new(config: SupervisorConfig) -> Self {
        Self::with_service(config, false)
    }

    fn with_service(config: SupervisorConfig, service: bool) -> Self {
        let clock = Arc::new(ManualClock::new(1_000));
        let process = FakeProcess::default();
        let channel = FakeChannel::default();
        let host = RecordingHost::default();
        let (requests, receiver) = mpsc::channel(crate::signals::REQUEST_QUEUE);
        let parts = Parts {
            clock: clock.clone(),
            process: process.clone(),
            channel: channel.clone(),
            host: Box::new(host.clone()),
        };
        let supervisor = Supervisor::new(config, Properties::default(), parts, receiver, service);
        Self {
            clock,
            process,
            channel,
            host,
            requests,
            supervisor,
        }
    }

    /// Advances the clock by one tick and runs one loop iteration.
    async fn tick(&mut self) {
        self.clock.advance_ticks(1);
        self.supervisor.cycle().await;
    }

    async fn run_secs(&mut self, seconds: u32) {
        for _ in 0..seconds * 10 {
            self.tick().await;
        }
    }

    async fn until(&mut self, max_secs: u32, done: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..max_secs * 10 {
            if done(self) {
                return true;
            }
            self.tick().await;
        }
        done(self)
    }

    fn request(&self, request: Request) {
        self.requests.try_send(request).unwrap();
    }

    fn child(&self) -> ChildState {
        self.supervisor.machine().child
    }

    fn state(&self) -> SupervisorState {
        self.supervisor.machine().supervisor
    }

    fn exit_code(&self) -> i32 {
        self.supervisor.machine().exit_code.get()
    }

    async fn launch(&mut self) {
        let launched = self
            .until(60, |h| h.child() == ChildState::Launching)
            .await;
        assert!(launched, "child was never launched");
    }

    async fn start_child(&mut self) {
        self.launch().await;
        self.channel.connect();
        self.tick().await;
        assert_eq!(self.child(), ChildState::Starting);
        self.channel.receive(MessageCode::Started, "");
        self.tick().await;
        assert_eq!(self.child(), ChildState::Started);
    }
}

fn config() -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    config.child.command = "app --port {port} --key {key}".into();
    config.timeouts.cpu = 0;
    config
}

#[tokio::test]
async fn child_starts_after_handshake() {
    let mut h = Harness::new(config());
    h.start_child().await;
    assert_eq!(h.state(), SupervisorState::Started);

    assert_eq!(
        h.channel.sent_codes(),
        vec![
            MessageCode::LowLogLevel,
            MessageCode::PingTimeout,
            MessageCode::Properties,
            MessageCode::Start,
        ]
    );
    let sent = h.channel.sent();
    assert_eq!(sent[0].payload, "2");
    assert_eq!(sent[1].payload, "30");
    assert_eq!(sent[3].payload, "start");

    let spec = h.process.0.lock().launched[0].clone();
    assert_eq!(spec.program, "app");
    assert_eq!(spec.args[..2], ["--port".to_string(), "32000".to_string()]);
    let env = |name: &str| {
        spec.env
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    };
    assert_eq!(env("WARDEN_PORT").as_deref(), Some("32000"));
    assert_eq!(env("WARDEN_JVMID").as_deref(), Some("1"));
    assert_eq!(env("WARDEN_KEY").as_ref(), Some(&spec.args[3]));

    assert_eq!(
        h.host.states(),
        vec![SupervisorState::Started]
    );
    assert_eq!(h.host.hint_for(SupervisorState::Started), Some(0));
}

#[tokio::test]
async fn pings_follow_the_interval() {
    let mut h = Harness::new(config());
    h.start_child().await;
    h.run_secs(6).await;
    let pings: Vec<_> = h
        .channel
        .sent()
        .into_iter()
        .filter(|m| m.code == MessageCode::Ping)
        .collect();
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].payload, "ping");
}

#[tokio::test]
async fn ping_replies_keep_the_child_alive() {
    let mut h = Harness::new(config());
    h.start_child().await;
    for _ in 0..12 {
        h.run_secs(5).await;
        h.channel.receive(MessageCode::Ping, "ping");
    }
    assert_eq!(h.child(), ChildState::Started);
    assert_eq!(h.process.kills(), 0);
}

#[tokio::test]
async fn unanswered_pings_kill_and_relaunch() {
    let mut h = Harness::new(config());
    h.start_child().await;
    h.run_secs(34).await;
    assert_eq!(h.child(), ChildState::Started);

    assert!(h.until(5, |h| h.process.kills() == 1).await);
    assert!(h.until(1, |h| h.child() == ChildState::Down).await);
    assert_eq!(h.exit_code(), 1);

    assert!(h.until(10, |h| h.process.launches() == 2).await);
    assert_eq!(h.supervisor.policy().failed_invocations(), 1);
    assert_eq!(h.state(), SupervisorState::Started);
}

#[tokio::test]
async fn ping_timeout_requests_a_dump_before_killing() {
    let mut config = config();
    config.restart.dump_on_failed_exit = true;
    let mut h = Harness::new(config);
    h.start_child().await;

    assert!(h.until(40, |h| h.child() == ChildState::Killing).await);
    assert_eq!(h.process.0.lock().signals, vec![ChildSignal::Dump]);
    h.run_secs(4).await;
    assert_eq!(h.process.kills(), 0);
    assert!(h.until(2, |h| h.process.kills() == 1).await);
}

#[tokio::test]
async fn startup_timeout_kills_a_silent_child() {
    let mut h = Harness::new(config());
    h.launch().await;
    h.run_secs(29).await;
    assert_eq!(h.child(), ChildState::Launching);

    assert!(h.until(3, |h| h.process.kills() == 1).await);
    assert!(h.until(10, |h| h.process.launches() == 2).await);
}

#[tokio::test]
async fn restart_gives_up_after_quick_failures() {
    let mut config = config();
    config.restart.max_failed_invocations = 3;
    let mut h = Harness::new(config);

    for _ in 0..3 {
        h.launch().await;
        h.process.exit(1);
        h.tick().await;
        assert_eq!(h.child(), ChildState::Down);
    }
    assert!(h.until(5, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.exit_code(), 1);

    h.run_secs(30).await;
    assert_eq!(h.process.launches(), 3);
}

#[tokio::test]
async fn first_failure_exit_code_is_kept() {
    let mut config = config();
    config.restart.max_failed_invocations = 3;
    let mut h = Harness::new(config);

    for code in [5, 0, 0] {
        h.launch().await;
        h.process.exit(code);
        h.tick().await;
    }
    assert!(h.until(5, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.exit_code(), 5);
}

#[tokio::test]
async fn relaunch_waits_for_restart_delay() {
    let mut h = Harness::new(config());
    h.start_child().await;
    h.process.exit(3);
    h.tick().await;
    assert_eq!(h.child(), ChildState::Down);

    h.tick().await;
    assert_eq!(h.child(), ChildState::LaunchDelay);
    let armed = h.clock.now().add_seconds(5);
    assert_eq!(h.supervisor.machine().deadline, Some(armed));

    h.run_secs(4).await;
    assert_eq!(h.process.launches(), 1);
    assert!(h.until(2, |h| h.process.launches() == 2).await);
    assert_eq!(h.exit_code(), 3);
}

#[tokio::test]
async fn filter_match_restarts_the_child() {
    let mut config = config();
    config.filters = OutputFilters::new(vec![FilterRule::new(
        "OutOfMemoryError",
        FilterAction::Restart,
    )]);
    let mut h = Harness::new(config);
    h.start_child().await;

    h.process.print("java.lang.OutOfMemoryError: heap space");
    h.tick().await;
    assert_eq!(h.child(), ChildState::Stopping);
    assert_eq!(h.channel.sent_codes().last(), Some(&MessageCode::Stop));
    assert_eq!(h.state(), SupervisorState::Started);

    h.process.exit(0);
    h.tick().await;
    assert_eq!(h.child(), ChildState::Down);
    assert!(h.until(10, |h| h.process.launches() == 2).await);
    assert_eq!(h.exit_code(), 0);
}

#[tokio::test]
async fn filter_match_shuts_down_with_failure() {
    let mut config = config();
    config.filters = OutputFilters::new(vec![FilterRule::new("FATAL", FilterAction::Shutdown)]);
    let mut h = Harness::new(config);
    h.start_child().await;

    h.process.print("FATAL: disk full");
    h.tick().await;
    assert_eq!(h.child(), ChildState::Stopping);
    h.process.exit(0);
    assert!(h.until(2, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.exit_code(), 1);
    assert_eq!(h.process.launches(), 1);
}

#[tokio::test]
async fn stop_pending_extends_the_deadline() {
    let mut h = Harness::new(config());
    h.start_child().await;

    h.request(Request::Stop { exit_code: 0 });
    h.tick().await;
    assert_eq!(h.child(), ChildState::Stopping);

    h.channel.receive(MessageCode::StopPending, "60000");
    h.tick().await;
    h.run_secs(50).await;
    assert_eq!(h.child(), ChildState::Stopping);
    assert_eq!(h.process.kills(), 0);

    assert!(h.until(15, |h| h.process.kills() == 1).await);
    assert!(h.until(2, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.exit_code(), 1);
}

#[tokio::test]
async fn exit_code_action_restarts() {
    let mut config = config();
    config.on_exit.codes.insert(3, ExitAction::Restart);
    let mut h = Harness::new(config);
    h.start_child().await;

    h.channel.receive(MessageCode::Stop, "3");
    h.tick().await;
    assert_eq!(h.child(), ChildState::Stopping);
    h.channel.receive(MessageCode::Stopped, "");
    h.tick().await;
    assert_eq!(h.child(), ChildState::Stopped);

    h.process.exit(0);
    assert!(h.until(10, |h| h.process.launches() == 2).await);
    assert_eq!(h.state(), SupervisorState::Started);
}

#[tokio::test]
async fn launch_failure_counts_as_a_crash() {
    let mut config = config();
    config.restart.max_failed_invocations = 2;
    let mut h = Harness::new(config);
    h.process.0.lock().fail_launch = true;

    assert!(h.until(30, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.process.0.lock().attempts, 2);
    assert_eq!(h.process.launches(), 0);
    assert_eq!(h.exit_code(), 1);
}

#[tokio::test]
async fn listen_failure_counts_as_a_crash() {
    let mut config = config();
    config.restart.max_failed_invocations = 1;
    let mut h = Harness::new(config);
    h.channel.0.lock().fail_listen = true;

    assert!(h.until(10, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.process.0.lock().attempts, 0);
    assert_ne!(h.exit_code(), 0);
}

#[tokio::test]
async fn repeated_interrupt_forces_a_kill() {
    let mut config = config();
    config.restart.dump_on_failed_exit = true;
    let mut h = Harness::new(config);
    h.start_child().await;

    h.request(Request::Shutdown { signal: "INT" });
    h.tick().await;
    assert_eq!(h.state(), SupervisorState::Stopping);
    assert_eq!(h.child(), ChildState::Stopping);
    assert_eq!(h.host.hint_for(SupervisorState::Stopping), Some(35_000));

    h.request(Request::Shutdown { signal: "INT" });
    assert!(h.until(2, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.process.kills(), 1);
    assert!(h.process.0.lock().signals.is_empty());
    assert_eq!(h.exit_code(), 1);
}

#[tokio::test]
async fn interrupts_can_be_ignored() {
    let mut config = config();
    config.signals.ignore_interrupts = true;
    let mut h = Harness::new(config);
    h.start_child().await;

    h.request(Request::Shutdown { signal: "TERM" });
    h.run_secs(1).await;
    assert_eq!(h.state(), SupervisorState::Started);
    assert_eq!(h.child(), ChildState::Started);
}

#[tokio::test]
async fn pause_and_resume_relaunch_the_child() {
    let mut config = config();
    config.service.pausable = true;
    let mut h = Harness::with_service(config, true);
    h.start_child().await;

    h.request(Request::Pause);
    assert!(h.until(2, |h| h.child() == ChildState::Stopping).await);
    assert_eq!(h.state(), SupervisorState::Pausing);
    h.process.exit(0);
    assert!(h.until(2, |h| h.state() == SupervisorState::Paused).await);
    h.run_secs(10).await;
    assert_eq!(h.process.launches(), 1);

    h.request(Request::Resume);
    h.start_child().await;
    h.tick().await;
    assert_eq!(h.state(), SupervisorState::Started);
    assert_eq!(h.process.launches(), 2);
    assert_eq!(h.supervisor.policy().failed_invocations(), 0);
    assert_eq!(
        h.host.states(),
        vec![
            SupervisorState::Started,
            SupervisorState::Pausing,
            SupervisorState::Paused,
            SupervisorState::Continuing,
            SupervisorState::Started,
        ]
    );
}

#[tokio::test]
async fn pause_is_ignored_outside_a_service() {
    let mut config = config();
    config.service.pausable = true;
    let mut h = Harness::new(config);
    h.start_child().await;

    h.request(Request::Pause);
    h.run_secs(1).await;
    assert_eq!(h.state(), SupervisorState::Started);
}

#[tokio::test]
async fn command_file_stops_with_exit_code() {
    let dir = TempDir::new().unwrap();
    let command = dir.path().join("warden.command");
    let mut config = config();
    config.files.command = Some(command.clone());
    let mut h = Harness::new(config);
    h.start_child().await;

    std::fs::write(&command, "STOP 4\n").unwrap();
    assert!(h.until(6, |h| h.child() == ChildState::Stopping).await);
    assert!(!command.exists());
    h.process.exit(0);
    assert!(h.until(2, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.exit_code(), 4);
}

#[tokio::test]
async fn deleting_the_anchor_shuts_down() {
    let dir = TempDir::new().unwrap();
    let anchor = dir.path().join("warden.anchor");
    std::fs::write(&anchor, "1\n").unwrap();
    let mut config = config();
    config.files.anchor = Some(anchor.clone());
    let mut h = Harness::new(config);
    h.start_child().await;

    std::fs::remove_file(&anchor).unwrap();
    assert!(h.until(6, |h| h.state() == SupervisorState::Stopping).await);
    assert!(h.until(1, |h| h.child() == ChildState::Stopping).await);
    h.process.exit(0);
    assert!(h.until(2, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.exit_code(), 0);
}

#[tokio::test]
async fn control_codes_reach_a_connected_child() {
    let mut h = Harness::new(config());
    h.request(Request::ControlCode(200));
    h.tick().await;
    assert!(h.channel.sent().is_empty());

    h.start_child().await;
    h.request(Request::ControlCode(200));
    h.tick().await;
    let sent = h.channel.sent();
    let last = sent.last().unwrap();
    assert_eq!(last.code, MessageCode::ServiceControlCode);
    assert_eq!(last.payload, "200");
}

#[tokio::test]
async fn stopped_child_is_killed_after_the_exit_timeout() {
    let mut h = Harness::new(config());
    h.start_child().await;

    h.request(Request::Stop { exit_code: 0 });
    h.tick().await;
    h.channel.receive(MessageCode::Stopped, "");
    h.tick().await;
    assert_eq!(h.child(), ChildState::Stopped);

    h.run_secs(19).await;
    assert_eq!(h.child(), ChildState::Stopped);
    assert_eq!(h.process.kills(), 0);
    assert!(h.until(2, |h| h.process.kills() == 1).await);
    assert!(h.until(1, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.exit_code(), 1);
}

#[tokio::test]
async fn starved_loop_pushes_the_deadline_back() {
    let mut config = config();
    config.timeouts.cpu = 10;
    let mut h = Harness::new(config);
    h.start_child().await;
    let before = h.supervisor.machine().deadline.unwrap();

    h.clock.advance_ticks(400);
    h.supervisor.cycle().await;
    assert_eq!(h.child(), ChildState::Started);
    assert_eq!(h.supervisor.machine().deadline, Some(before.add_seconds(40)));
    assert_eq!(h.process.kills(), 0);
}

#[tokio::test]
async fn clock_jump_without_cpu_timeout_counts_as_a_hang() {
    let mut h = Harness::new(config());
    h.start_child().await;

    h.clock.advance_ticks(400);
    h.supervisor.cycle().await;
    assert_eq!(h.child(), ChildState::Killing);
}

#[tokio::test]
async fn hangup_is_forwarded_by_default() {
    let mut h = Harness::new(config());
    h.start_child().await;

    h.request(Request::Signal(UserSignal::Hangup));
    h.tick().await;
    assert_eq!(h.process.0.lock().signals, vec![ChildSignal::Hangup]);
    assert_eq!(h.child(), ChildState::Started);
}

#[tokio::test]
async fn ignored_hangup_changes_nothing() {
    let mut config = config();
    config.signals.hup = SignalMode::Ignore;
    let mut h = Harness::new(config);
    h.start_child().await;

    h.request(Request::Signal(UserSignal::Hangup));
    h.run_secs(1).await;
    assert!(h.process.0.lock().signals.is_empty());
    assert_eq!(h.child(), ChildState::Started);
}

#[tokio::test]
async fn user_signal_can_restart_the_child() {
    let mut config = config();
    config.signals.usr1 = SignalMode::Restart;
    let mut h = Harness::new(config);
    h.start_child().await;

    h.request(Request::Signal(UserSignal::User1));
    h.tick().await;
    assert_eq!(h.child(), ChildState::Stopping);
    assert_eq!(h.state(), SupervisorState::Started);
    h.process.exit(0);
    assert!(h.until(10, |h| h.process.launches() == 2).await);
    assert!(h.process.0.lock().signals.is_empty());
}

#[tokio::test]
async fn user_signal_can_shut_down() {
    let mut config = config();
    config.signals.usr2 = SignalMode::Shutdown;
    let mut h = Harness::new(config);
    h.start_child().await;

    h.request(Request::Signal(UserSignal::User2));
    h.tick().await;
    assert_eq!(h.state(), SupervisorState::Stopping);
    assert_eq!(h.child(), ChildState::Stopping);
    h.process.exit(0);
    assert!(h.until(2, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.exit_code(), 0);
    assert_eq!(h.process.launches(), 1);
}

#[tokio::test]
async fn disabled_restarts_shut_down_after_a_crash() {
    let mut config = config();
    config.restart.disabled = true;
    let mut h = Harness::new(config);
    h.start_child().await;

    h.process.exit(3);
    assert!(h.until(2, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.exit_code(), 3);
    h.run_secs(10).await;
    assert_eq!(h.process.launches(), 1);
}

#[tokio::test]
async fn disabled_automatic_restarts_still_allow_requested_ones() {
    let mut config = config();
    config.restart.automatic_disabled = true;
    let mut h = Harness::new(config);
    h.start_child().await;

    h.request(Request::Restart);
    h.tick().await;
    assert_eq!(h.child(), ChildState::Stopping);
    h.process.exit(0);
    h.launch().await;
    assert_eq!(h.process.launches(), 2);

    h.process.exit(3);
    assert!(h.until(2, |h| h.state() == SupervisorState::Stopped).await);
    assert_eq!(h.exit_code(), 3);
    h.run_secs(10).await;
    assert_eq!(h.process.launches(), 2);
}

#[tokio::test]
async fn child_death_is_handled_in_the_same_iteration() {
    let mut h = Harness::new(config());
    h.start_child().await;

    h.process.exit(7);
    h.request(Request::ChildDied);
    h.tick().await;
    // reaped while draining requests, so the relaunch is already scheduled
    assert_eq!(h.child(), ChildState::LaunchDelay);
    assert_eq!(h.exit_code(), 7);
}

#[tokio::test]
async fn child_death_without_a_child_is_ignored() {
    let mut h = Harness::new(config());
    h.request(Request::ChildDied);
    h.tick().await;
    assert_eq!(h.child(), ChildState::LaunchDelay);
    assert_eq!(h.exit_code(), 0);
}

#[tokio::test]
async fn interrupt_during_dump_grace_kills_at_once() {
    let mut config = config();
    config.restart.dump_on_failed_exit = true;
    let mut h = Harness::new(config);
    h.start_child().await;

    assert!(h.until(40, |h| h.child() == ChildState::Killing).await);
    assert_eq!(h.process.0.lock().signals, vec![ChildSignal::Dump]);

    h.request(Request::Shutdown { signal: "INT" });
    assert!(h.until(1, |h| h.process.kills() == 1).await);
    assert!(h.until(1, |h| h.state() == SupervisorState::Stopped).await);
}
