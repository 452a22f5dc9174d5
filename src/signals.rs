//! OS signals, turned into [`Request`]s for the event loop.

use crate::supervisor::types::{Request, UserSignal};
use color_eyre::Result;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tracing::{debug, info_span, warn, Instrument};

/// Capacity of the request queue between signal handlers and the event loop.
pub const REQUEST_QUEUE: usize = 32;

/// Queues a request without waiting. A full queue drops the request. Returns
/// false once the event loop is gone.
pub fn enqueue(requests: &Sender<Request>, request: Request) -> bool {
    match requests.try_send(request) {
        Ok(()) => true,
        Err(TrySendError::Full(request)) => {
            warn!(?request, "Request queue is full, dropping request");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(unix)]
pub fn install(requests: Sender<Request>) -> Result<()> {
    use color_eyre::eyre::WrapErr;
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).wrap_err("Failed to trap SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).wrap_err("Failed to trap SIGTERM")?;
    let mut sighup = signal(SignalKind::hangup()).wrap_err("Failed to trap SIGHUP")?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).wrap_err("Failed to trap SIGUSR1")?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).wrap_err("Failed to trap SIGUSR2")?;
    let mut sigquit = signal(SignalKind::quit()).wrap_err("Failed to trap SIGQUIT")?;
    let mut sigchld = signal(SignalKind::child()).wrap_err("Failed to trap SIGCHLD")?;

    tokio::spawn(
        async move {
            loop {
                let request = tokio::select! {
                    Some(_) = sigint.recv() => Request::Shutdown { signal: "INT" },
                    Some(_) = sigterm.recv() => Request::Shutdown { signal: "TERM" },
                    Some(_) = sighup.recv() => Request::Signal(UserSignal::Hangup),
                    Some(_) = sigusr1.recv() => Request::Signal(UserSignal::User1),
                    Some(_) = sigusr2.recv() => Request::Signal(UserSignal::User2),
                    Some(_) = sigquit.recv() => Request::Dump,
                    Some(_) = sigchld.recv() => Request::ChildDied,
                    else => break,
                };
                debug!(?request, "Signal received");
                if !enqueue(&requests, request) {
                    break;
                }
            }
        }
        .instrument(info_span!("signals")),
    );
    Ok(())
}

#[cfg(not(unix))]
pub fn install(requests: Sender<Request>) -> Result<()> {
    tokio::spawn(
        async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                debug!("Ctrl-C received");
                if !enqueue(&requests, Request::Shutdown { signal: "INT" }) {
                    break;
                }
            }
        }
        .instrument(info_span!("signals")),
    );
    Ok(())
}
