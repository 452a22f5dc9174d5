use crate::configs::RestartConfig;
use crate::supervisor::types::RestartMode;
use crate::tick::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Relaunch { delay: i32 },
    /// Restarts are switched off, either completely or for automatic ones.
    Disabled { automatic_only: bool },
    GiveUp { failed: u32 },
}

/// Decides what happens after the child went down.
#[derive(Debug)]
pub struct RestartPolicy {
    config: RestartConfig,
    launches: u32,
    failed_invocations: u32,
    launched_at: Option<Tick>,
}

impl RestartPolicy {
    pub fn new(config: RestartConfig) -> Self {
        Self {
            config,
            launches: 0,
            failed_invocations: 0,
            launched_at: None,
        }
    }

    pub fn launches(&self) -> u32 {
        self.launches
    }

    pub fn failed_invocations(&self) -> u32 {
        self.failed_invocations
    }

    pub fn record_launch(&mut self, now: Tick) {
        self.launched_at = Some(now);
    }

    /// Bumps the launch counter and returns the id of the new launch.
    pub fn next_launch_id(&mut self) -> u32 {
        self.launches = self.launches.wrapping_add(1);
        self.launches
    }

    pub fn reset_failures(&mut self) {
        self.failed_invocations = 0;
    }

    pub fn startup_delay(&self, service: bool) -> i32 {
        if service {
            self.config.startup_delay_service
        } else {
            self.config.startup_delay_console
        }
    }

    pub fn after_down(&mut self, mode: RestartMode, now: Tick) -> Decision {
        if mode == RestartMode::Automatic && self.config.automatic_disabled {
            return Decision::Disabled {
                automatic_only: !self.config.disabled,
            };
        }
        if self.config.disabled {
            return Decision::Disabled {
                automatic_only: false,
            };
        }

        let age = self
            .launched_at
            .map(|launched| Tick::age_seconds(launched, now))
            .unwrap_or(0);
        if age >= self.config.successful_invocation_time {
            self.failed_invocations = 0;
        } else {
            self.failed_invocations += 1;
            if self.failed_invocations >= self.config.max_failed_invocations {
                return Decision::GiveUp {
                    failed: self.failed_invocations,
                };
            }
        }
        Decision::Relaunch {
            delay: self.config.delay,
        }
    }
}
