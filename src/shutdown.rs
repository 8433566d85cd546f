//! Ordered, single-shot teardown of the proxy

use crate::error::ExitStatus;
use crate::forward::ForwardingSupervisor;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Lifecycle of one proxy run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Terminated,
}

/// What started the shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// A termination signal, by name
    Signal(&'static str),
    /// Startup failed before the listener was serving
    StartupFailure(String),
    /// The listener failed while serving
    RuntimeFailure(String),
    /// The listener stopped on its own
    Completed,
}

impl ShutdownTrigger {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ShutdownTrigger::Signal(_) => ExitStatus::Signal,
            ShutdownTrigger::StartupFailure(_) => ExitStatus::StartupFailure,
            ShutdownTrigger::RuntimeFailure(_) => ExitStatus::RuntimeFailure,
            ShutdownTrigger::Completed => ExitStatus::Success,
        }
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Signal(name) => write!(f, "received {}", name),
            ShutdownTrigger::StartupFailure(reason) => write!(f, "startup failed: {}", reason),
            ShutdownTrigger::RuntimeFailure(reason) => write!(f, "listener failed: {}", reason),
            ShutdownTrigger::Completed => write!(f, "listener stopped"),
        }
    }
}

/// Drives Running → ShuttingDown → Terminated exactly once.
///
/// Any number of triggers may race (a signal arriving while forwarding
/// channels are still starting, a listener error during a signal); the first
/// one moves the state to ShuttingDown and performs the teardown, the rest
/// wait for Terminated and report nothing.
pub struct ShutdownCoordinator {
    supervisor: Arc<ForwardingSupervisor>,
    state: watch::Sender<LifecycleState>,
}

impl ShutdownCoordinator {
    pub fn new(supervisor: Arc<ForwardingSupervisor>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        Self { supervisor, state }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change; servers stop accepting
    /// once it leaves `Running`.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Tear down for `trigger`. Returns the exit status to use if this call
    /// performed the teardown, `None` if another trigger already had.
    pub async fn shutdown(&self, trigger: ShutdownTrigger) -> Option<ExitStatus> {
        let won = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::ShuttingDown;
                true
            } else {
                false
            }
        });

        if !won {
            info!(trigger = %trigger, "Shutdown already in progress");
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|state| *state == LifecycleState::Terminated).await;
            return None;
        }

        match &trigger {
            ShutdownTrigger::StartupFailure(_) | ShutdownTrigger::RuntimeFailure(_) => {
                error!(trigger = %trigger, "Shutting down");
            }
            _ => info!(trigger = %trigger, "Shutting down"),
        }

        let stopped = self.supervisor.shutdown().await;
        self.state.send_replace(LifecycleState::Terminated);

        info!(forwarding_channels = stopped, "Shutdown complete");
        Some(trigger.exit_status())
    }
}

/// Termination signal handlers, installed when constructed so that signals
/// arriving during startup are caught rather than killing the process.
#[cfg(unix)]
pub struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
            _ = self.hangup.recv() => "SIGHUP",
        }
    }
}

#[cfg(not(unix))]
pub struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}
