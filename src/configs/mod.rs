mod properties;

pub use self::properties::{parse_bool, Properties};
use crate::process::filter::{FilterAction, FilterRule, OutputFilters};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::warn;

/// Grace added on top of the ping, shutdown and exit timeouts.
pub const GRACE_SECS: i32 = 5;
const DEFAULT_LOG_LEVEL: &str = "info";
/// Upper bound for every timeout, 20 days.
pub const TIMEOUT_MAX: i32 = 1_728_000;
/// Substitutions available in `child.command` and `child.args`.
pub const TEMPLATE_KEYS: [&str; 4] = ["key", "port", "jvmid", "pid"];

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub child: ChildConfig,
    pub control: ControlConfig,
    pub timeouts: Timeouts,
    pub restart: RestartConfig,
    pub on_exit: ExitActions,
    pub filters: OutputFilters,
    pub signals: SignalModes,
    pub files: FileConfig,
    pub timer: TimerConfig,
    pub service: ServiceConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ChildConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub port: u16,
    pub port_min: u16,
    pub port_max: u16,
    pub separator: u8,
}

/// All values in seconds, 0 means disabled.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub startup: i32,
    pub ping: i32,
    pub ping_interval: i32,
    pub ping_interval_logged: i32,
    pub shutdown: i32,
    pub exit: i32,
    pub cpu: i32,
}

#[derive(Debug, Clone)]
pub struct RestartConfig {
    pub delay: i32,
    pub disabled: bool,
    pub automatic_disabled: bool,
    pub max_failed_invocations: u32,
    pub successful_invocation_time: i32,
    pub startup_delay_console: i32,
    pub startup_delay_service: i32,
    pub dump_on_failed_exit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitAction {
    Shutdown,
    Restart,
}

#[derive(Debug, Clone)]
pub struct ExitActions {
    pub default: ExitAction,
    pub codes: BTreeMap<i32, ExitAction>,
}

impl ExitActions {
    pub fn action_for(&self, exit_code: i32) -> ExitAction {
        self.codes.get(&exit_code).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalMode {
    Ignore,
    Restart,
    Shutdown,
    Forward,
}

#[derive(Debug, Clone)]
pub struct SignalModes {
    pub hup: SignalMode,
    pub usr1: SignalMode,
    pub usr2: SignalMode,
    pub ignore_interrupts: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub pidfile: Option<PathBuf>,
    pub child_pidfile: Option<PathBuf>,
    pub statusfile: Option<PathBuf>,
    pub child_statusfile: Option<PathBuf>,
    pub anchor: Option<PathBuf>,
    pub anchor_poll_interval: i32,
    pub command: Option<PathBuf>,
    pub command_poll_interval: i32,
}

#[derive(Debug, Clone)]
pub struct TimerConfig {
    pub use_system_time: bool,
    pub fast_threshold: i32,
    pub slow_threshold: i32,
    pub tick_output: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub pausable: bool,
    pub pausable_stop_child: bool,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub state_output: bool,
    pub loop_output: bool,
}

impl LogConfig {
    /// Reads `log.level` ahead of the full config, so logging is up before
    /// normalization starts warning.
    pub fn level_of(properties: &Properties) -> String {
        properties
            .get("log.level")
            .map(str::trim)
            .filter(|level| !level.is_empty())
            .unwrap_or(DEFAULT_LOG_LEVEL)
            .to_string()
    }

    /// Lowest level the child should bother sending over the control channel.
    pub fn child_threshold(&self) -> u8 {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "trace" | "debug" => 1,
            "warn" => 4,
            "error" => 5,
            _ => 2,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            child: ChildConfig::default(),
            control: ControlConfig {
                port: 0,
                port_min: 32000,
                port_max: 32999,
                separator: b'\t',
            },
            timeouts: Timeouts {
                startup: 30,
                ping: 30,
                ping_interval: 5,
                ping_interval_logged: 1,
                shutdown: 30,
                exit: 15,
                cpu: 10,
            },
            restart: RestartConfig {
                delay: 5,
                disabled: false,
                automatic_disabled: false,
                max_failed_invocations: 5,
                successful_invocation_time: 300,
                startup_delay_console: 0,
                startup_delay_service: 0,
                dump_on_failed_exit: false,
            },
            on_exit: ExitActions {
                default: ExitAction::Shutdown,
                codes: BTreeMap::new(),
            },
            filters: OutputFilters::default(),
            signals: SignalModes {
                hup: SignalMode::Forward,
                usr1: SignalMode::Forward,
                usr2: SignalMode::Forward,
                ignore_interrupts: false,
            },
            files: FileConfig {
                anchor_poll_interval: 5,
                command_poll_interval: 5,
                ..Default::default()
            },
            timer: TimerConfig {
                use_system_time: false,
                fast_threshold: 172_800,
                slow_threshold: 172_800,
                tick_output: false,
            },
            service: ServiceConfig {
                pausable: false,
                pausable_stop_child: true,
            },
            log: LogConfig {
                level: DEFAULT_LOG_LEVEL.into(),
                state_output: false,
                loop_output: false,
            },
        }
    }
}

type Config = SupervisorConfig;

enum Setter {
    Int(fn(&mut Config, i32)),
    Bool(fn(&mut Config, bool)),
    Text(fn(&mut Config, &str)),
    Parsed(fn(&mut Config, &str) -> Result<()>),
}

/// Fixed keys, applied in order over the defaults. Rows that feed a shared
/// default come before the rows that refine it.
const SCHEMA: &[(&str, Setter)] = &[
    ("child.command", Setter::Text(|c, v| c.child.command = v.to_string())),
    ("child.working_directory", Setter::Text(|c, v| c.child.working_directory = path(v))),
    ("control.port", Setter::Int(|c, v| c.control.port = clamp_port(v))),
    ("control.port_min", Setter::Int(|c, v| c.control.port_min = clamp_port(v))),
    ("control.port_max", Setter::Int(|c, v| c.control.port_max = clamp_port(v))),
    ("properties.separator", Setter::Parsed(|c, v| {
        c.control.separator = separator(v)?;
        Ok(())
    })),
    ("startup.timeout", Setter::Int(|c, v| c.timeouts.startup = v)),
    ("startup.delay", Setter::Int(|c, v| {
        c.restart.startup_delay_console = v;
        c.restart.startup_delay_service = v;
    })),
    ("startup.delay_console", Setter::Int(|c, v| c.restart.startup_delay_console = v)),
    ("startup.delay_service", Setter::Int(|c, v| c.restart.startup_delay_service = v)),
    ("ping.timeout", Setter::Int(|c, v| c.timeouts.ping = v)),
    ("ping.interval", Setter::Int(|c, v| c.timeouts.ping_interval = v)),
    ("ping.interval_logged", Setter::Int(|c, v| c.timeouts.ping_interval_logged = v)),
    ("shutdown.timeout", Setter::Int(|c, v| c.timeouts.shutdown = v)),
    ("exit.timeout", Setter::Int(|c, v| c.timeouts.exit = v)),
    ("cpu.timeout", Setter::Int(|c, v| c.timeouts.cpu = v)),
    ("restart.delay", Setter::Int(|c, v| c.restart.delay = v)),
    ("restart.disabled", Setter::Bool(|c, v| {
        c.restart.disabled = v;
        c.restart.automatic_disabled = v;
    })),
    ("restart.automatic_disabled", Setter::Bool(|c, v| c.restart.automatic_disabled = v)),
    ("restart.max_failed_invocations", Setter::Int(|c, v| c.restart.max_failed_invocations = v.max(1) as u32)),
    ("restart.successful_invocation_time", Setter::Int(|c, v| c.restart.successful_invocation_time = v)),
    ("restart.request_dump_on_failed_exit", Setter::Bool(|c, v| c.restart.dump_on_failed_exit = v)),
    ("on_exit.default", Setter::Parsed(|c, v| {
        c.on_exit.default = parse_enum("on_exit.default", v)?;
        Ok(())
    })),
    ("signal.hup", Setter::Parsed(|c, v| {
        c.signals.hup = parse_enum("signal.hup", v)?;
        Ok(())
    })),
    ("signal.usr1", Setter::Parsed(|c, v| {
        c.signals.usr1 = parse_enum("signal.usr1", v)?;
        Ok(())
    })),
    ("signal.usr2", Setter::Parsed(|c, v| {
        c.signals.usr2 = parse_enum("signal.usr2", v)?;
        Ok(())
    })),
    ("ignore_signals", Setter::Bool(|c, v| c.signals.ignore_interrupts = v)),
    ("pidfile", Setter::Text(|c, v| c.files.pidfile = path(v))),
    ("child.pidfile", Setter::Text(|c, v| c.files.child_pidfile = path(v))),
    ("statusfile", Setter::Text(|c, v| c.files.statusfile = path(v))),
    ("child.statusfile", Setter::Text(|c, v| c.files.child_statusfile = path(v))),
    ("anchor.file", Setter::Text(|c, v| c.files.anchor = path(v))),
    ("anchor.poll_interval", Setter::Int(|c, v| c.files.anchor_poll_interval = v)),
    ("commandfile.file", Setter::Text(|c, v| c.files.command = path(v))),
    ("commandfile.poll_interval", Setter::Int(|c, v| c.files.command_poll_interval = v)),
    ("timer.use_system_time", Setter::Bool(|c, v| c.timer.use_system_time = v)),
    ("timer.fast_threshold", Setter::Int(|c, v| c.timer.fast_threshold = v)),
    ("timer.slow_threshold", Setter::Int(|c, v| c.timer.slow_threshold = v)),
    ("service.pausable", Setter::Bool(|c, v| c.service.pausable = v)),
    ("service.pausable_stop_child", Setter::Bool(|c, v| c.service.pausable_stop_child = v)),
    ("log.level", Setter::Text(|c, v| c.log.level = v.trim().to_string())),
    ("debug.state_output", Setter::Bool(|c, v| c.log.state_output = v)),
    ("debug.loop_output", Setter::Bool(|c, v| c.log.loop_output = v)),
    ("debug.tick_output", Setter::Bool(|c, v| c.timer.tick_output = v)),
];

impl SupervisorConfig {
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let mut config = Self::default();
        for (key, setter) in SCHEMA {
            let Some(raw) = properties.get(key) else {
                continue;
            };
            match setter {
                Setter::Int(set) => {
                    let value = raw
                        .trim()
                        .parse()
                        .map_err(|_| eyre!("{key}: expected an integer, got {raw:?}"))?;
                    set(&mut config, value)
                }
                Setter::Bool(set) => {
                    let value = parse_bool(raw)
                        .ok_or_else(|| eyre!("{key}: expected a boolean, got {raw:?}"))?;
                    set(&mut config, value)
                }
                Setter::Text(set) => set(&mut config, raw),
                Setter::Parsed(set) => {
                    set(&mut config, raw).wrap_err_with(|| format!("Invalid {key}"))?
                }
            }
        }

        config.child.args = indexed(properties, "child.args")?
            .into_iter()
            .map(|(_, v)| v.to_string())
            .collect();
        config.child.env = properties
            .children("child.env")
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (code, action) in properties.children("on_exit") {
            if code == "default" {
                continue;
            }
            let code: i32 = code
                .parse()
                .map_err(|_| eyre!("on_exit.{code}: expected an exit code"))?;
            config
                .on_exit
                .codes
                .insert(code, parse_enum(&format!("on_exit.{code}"), action)?);
        }
        config.filters = filters(properties)?;

        config.normalize()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        if self.child.command.trim().is_empty() {
            bail!("child.command is required");
        }
        let t = &mut self.timeouts;
        for (key, value) in [
            ("startup.timeout", &mut t.startup),
            ("ping.timeout", &mut t.ping),
            ("shutdown.timeout", &mut t.shutdown),
            ("exit.timeout", &mut t.exit),
            ("cpu.timeout", &mut t.cpu),
        ] {
            *value = clamp_timeout(key, *value);
        }
        t.ping_interval = t.ping_interval.clamp(1, 3600);
        t.ping_interval_logged = t.ping_interval_logged.clamp(1, 86_400);
        if t.ping > 0 && t.ping < t.ping_interval + GRACE_SECS {
            warn!(
                ping_timeout = t.ping,
                ping_interval = t.ping_interval,
                "ping.timeout must be at least {GRACE_SECS} seconds longer than ping.interval, raising it"
            );
            t.ping = t.ping_interval + GRACE_SECS;
        }

        let r = &mut self.restart;
        r.delay = r.delay.clamp(0, TIMEOUT_MAX);
        r.successful_invocation_time = r.successful_invocation_time.clamp(0, TIMEOUT_MAX);
        r.startup_delay_console = r.startup_delay_console.clamp(0, TIMEOUT_MAX);
        r.startup_delay_service = r.startup_delay_service.clamp(0, TIMEOUT_MAX);

        self.files.anchor_poll_interval = self.files.anchor_poll_interval.clamp(1, 3600);
        self.files.command_poll_interval = self.files.command_poll_interval.clamp(1, 3600);
        self.timer.fast_threshold = self.timer.fast_threshold.clamp(1, TIMEOUT_MAX);
        self.timer.slow_threshold = self.timer.slow_threshold.clamp(1, TIMEOUT_MAX);

        if self.control.port_min > self.control.port_max {
            bail!(
                "control.port_min ({}) is above control.port_max ({})",
                self.control.port_min,
                self.control.port_max
            );
        }

        let sample: HashMap<&str, String> =
            TEMPLATE_KEYS.iter().map(|k| (*k, String::from("0"))).collect();
        self.child.command_line(&sample)?;
        Ok(())
    }
}

impl ChildConfig {
    /// Splits `child.command`, appends `child.args` and fills in `{name}`
    /// placeholders from `values`.
    pub fn command_line(&self, values: &HashMap<&str, String>) -> Result<Vec<String>> {
        let mut words = shell_words::split(&self.command).wrap_err("Invalid child.command")?;
        words.extend(self.args.iter().cloned());
        let placeholder = Regex::new(r"\{([A-Za-z_]+)\}").wrap_err("Invalid placeholder pattern")?;
        words
            .iter()
            .map(|word| render(&placeholder, word, values))
            .collect()
    }
}

fn render(placeholder: &Regex, word: &str, values: &HashMap<&str, String>) -> Result<String> {
    if let Some(unknown) = placeholder
        .captures_iter(word)
        .map(|c| c[1].to_string())
        .find(|name| !values.contains_key(name.as_str()))
    {
        bail!("Unknown placeholder {{{unknown}}} in {word:?}");
    }
    Ok(placeholder
        .replace_all(word, |c: &Captures| values[&c[1]].clone())
        .into_owned())
}

fn filters(properties: &Properties) -> Result<OutputFilters> {
    let mut grouped: BTreeMap<u32, (Option<&str>, Option<&str>)> = BTreeMap::new();
    for (rest, value) in properties.children("filters") {
        let (index, field) = rest
            .split_once('.')
            .ok_or_else(|| eyre!("filters.{rest}: expected filters.N.trigger or filters.N.action"))?;
        let index: u32 = index
            .parse()
            .map_err(|_| eyre!("filters.{rest}: bad filter index"))?;
        let entry = grouped.entry(index).or_default();
        match field {
            "trigger" => entry.0 = Some(value),
            "action" => entry.1 = Some(value),
            other => bail!("filters.{index}.{other}: unknown filter field"),
        }
    }
    let mut rules = Vec::with_capacity(grouped.len());
    for (index, (trigger, action)) in grouped {
        let trigger = trigger
            .filter(|t| !t.is_empty())
            .ok_or_else(|| eyre!("filters.{index}.trigger is required"))?;
        let action = match action {
            Some(raw) => parse_enum(&format!("filters.{index}.action"), raw)?,
            None => FilterAction::Restart,
        };
        rules.push(FilterRule::new(trigger, action));
    }
    Ok(OutputFilters::new(rules))
}

fn indexed<'a>(properties: &'a Properties, prefix: &str) -> Result<Vec<(u32, &'a str)>> {
    let mut items = properties
        .children(prefix)
        .map(|(index, value)| {
            index
                .parse::<u32>()
                .map(|i| (i, value))
                .map_err(|_| eyre!("{prefix}.{index}: expected a numeric index"))
        })
        .collect::<Result<Vec<_>>>()?;
    items.sort_by_key(|(i, _)| *i);
    Ok(items)
}

fn parse_enum<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_yaml::from_str(&raw.trim().to_ascii_lowercase())
        .wrap_err_with(|| format!("{key}: unsupported value {raw:?}"))
}

fn clamp_timeout(key: &str, value: i32) -> i32 {
    if value <= 0 {
        0
    } else if value > TIMEOUT_MAX {
        warn!(key, value, "Timeout above {TIMEOUT_MAX} seconds, clamping");
        TIMEOUT_MAX
    } else {
        value
    }
}

fn clamp_port(value: i32) -> u16 {
    value.clamp(0, u16::MAX as i32) as u16
}

fn path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| PathBuf::from(raw))
}

fn separator(raw: &str) -> Result<u8> {
    let bytes = raw.as_bytes();
    match bytes {
        [b] if *b != 0 => Ok(*b),
        _ => bail!("expected a single non-NUL byte, got {raw:?}"),
    }
}
