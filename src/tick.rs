//! Tick based time keeping.
//!
//! Every timeout in the supervisor is an absolute [`Tick`] deadline. A tick is
//! one 100ms quantum stored in a `u32` that is allowed to wrap, so ticks are
//! only ever compared through wrapping subtraction.

use crate::configs::TimerConfig;
use chrono::Local;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, info_span};

pub const TICK_MS: u64 = 100;
pub const TICKS_PER_SECOND: i32 = (1000 / TICK_MS) as i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tick(pub u32);

impl Tick {
    pub fn add_seconds(self, seconds: i32) -> Tick {
        self.add_ticks(seconds.wrapping_mul(TICKS_PER_SECOND))
    }

    pub fn add_ticks(self, ticks: i32) -> Tick {
        Tick(self.0.wrapping_add(ticks as u32))
    }

    /// Signed distance from `start` to `self`.
    pub fn ticks_since(self, start: Tick) -> i32 {
        self.0.wrapping_sub(start.0) as i32
    }

    pub fn age_seconds(start: Tick, end: Tick) -> i32 {
        end.ticks_since(start) / TICKS_PER_SECOND
    }

    /// True once `now` has reached or passed `deadline`.
    pub fn expired(now: Tick, deadline: Tick) -> bool {
        now.ticks_since(deadline) >= 0
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Tick;
}

pub fn system_ticks() -> Tick {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    Tick((millis / TICK_MS as u128) as u32)
}

/// Ticks derived straight from the wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        system_ticks()
    }
}

/// Free running tick counter driven by a dedicated thread.
///
/// The counter only advances while the thread sleeps through a quantum, so
/// wall clock adjustments never move it. It is cross checked against the
/// system ticks on every quantum.
pub struct TimerClock {
    ticks: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
}

impl TimerClock {
    pub fn start(config: &TimerConfig) -> Result<Self> {
        let start = system_ticks();
        let ticks = Arc::new(AtomicU32::new(start.0));
        let running = Arc::new(AtomicBool::new(true));
        let mut monitor = DriftMonitor::new(config.fast_threshold, config.slow_threshold);
        let mut overflow = OverflowWatch::new(start, config.tick_output);

        let thread_ticks = ticks.clone();
        let thread_running = running.clone();
        thread::Builder::new()
            .name("warden-timer".into())
            .spawn(move || {
                let _span = info_span!("timer").entered();
                while thread_running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(TICK_MS));
                    let now = Tick(thread_ticks.fetch_add(1, Ordering::SeqCst).wrapping_add(1));
                    match monitor.observe(system_ticks(), now) {
                        Some(Drift::TimerBehind { millis }) => {
                            info!("The timer fell behind the system clock by {millis}ms")
                        }
                        Some(Drift::SystemBehind { millis }) => {
                            info!("The system clock fell behind the timer by {millis}ms")
                        }
                        None => {}
                    }
                    overflow.observe(now);
                }
                debug!("Timer stopped");
            })
            .wrap_err("Failed to start timer thread")?;

        Ok(Self { ticks, running })
    }
}

impl Clock for TimerClock {
    fn now(&self) -> Tick {
        Tick(self.ticks.load(Ordering::SeqCst))
    }
}

impl Drop for TimerClock {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    TimerBehind { millis: i64 },
    SystemBehind { millis: i64 },
}

/// Watches the offset between the system ticks and the timer ticks and
/// reports jumps larger than the configured thresholds.
#[derive(Debug)]
pub struct DriftMonitor {
    fast_ticks: i32,
    slow_ticks: i32,
    last_offset: Option<i32>,
}

impl DriftMonitor {
    pub fn new(fast_threshold_secs: i32, slow_threshold_secs: i32) -> Self {
        Self {
            fast_ticks: fast_threshold_secs.saturating_mul(TICKS_PER_SECOND),
            slow_ticks: slow_threshold_secs.saturating_mul(TICKS_PER_SECOND),
            last_offset: None,
        }
    }

    pub fn observe(&mut self, system: Tick, timer: Tick) -> Option<Drift> {
        let offset = system.ticks_since(timer);
        let previous = self.last_offset.replace(offset)?;
        let shift = offset.wrapping_sub(previous);
        let millis = shift.unsigned_abs() as i64 * TICK_MS as i64;
        if shift > self.slow_ticks {
            Some(Drift::TimerBehind { millis })
        } else if shift < -self.fast_ticks {
            Some(Drift::SystemBehind { millis })
        } else {
            None
        }
    }
}

struct OverflowWatch {
    enabled: bool,
    last: Tick,
}

impl OverflowWatch {
    fn new(start: Tick, enabled: bool) -> Self {
        if enabled {
            let remaining = u32::MAX.wrapping_sub(start.0) as u64 + 1;
            info!(
                tick = start.0,
                "Tick counter overflows in {}",
                humantime::format_duration(Duration::from_millis(remaining * TICK_MS))
            );
        }
        Self {
            enabled,
            last: start,
        }
    }

    fn observe(&mut self, now: Tick) {
        if self.enabled && now.0 < self.last.0 {
            info!(
                "Tick counter overflowed at {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
            );
        }
        self.last = now;
    }
}
