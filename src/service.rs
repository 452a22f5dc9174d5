use crate::supervisor::types::SupervisorState;
use tracing::trace;

/// Wait hint reported while a timeout is disabled.
pub const WAIT_HINT_DAY_MS: u32 = 86_400_000;

/// Host service manager that is told about every supervisor transition.
pub trait ServiceHost: Send {
    fn report_status(&mut self, state: SupervisorState, exit_code: i32, wait_hint_ms: u32);
}

/// Console runs and Unix services have nobody to report to.
#[derive(Debug, Default)]
pub struct NoopHost;

impl ServiceHost for NoopHost {
    fn report_status(&mut self, state: SupervisorState, exit_code: i32, wait_hint_ms: u32) {
        trace!(%state, exit_code, wait_hint_ms, "Service status");
    }
}
