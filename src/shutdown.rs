//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Process-wide shutdown state, published through a watch channel.
//
// | Name           | Description                                         | Key Methods              |
// |----------------|-----------------------------------------------------|--------------------------|
// | ShutdownState  | Running -> Draining -> Stopped                      |                          |
// | Shutdown       | Owner of the state; performs the transitions        | drain, stop, signal      |
// | ShutdownSignal | Cloneable view handed to tasks that must wind down  | draining, is_running     |
//--------------------------------------------------------------------------------------------------

use std::io;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Accepting connections and relaying messages
    Running,
    /// Shutdown requested; tasks are winding down
    Draining,
    /// Everything has wound down
    Stopped,
}

/// Controller of the shutdown state.
///
/// States only move forward: a `Draining` process never goes back to
/// `Running`, and `Stopped` is final.
#[derive(Debug, Clone)]
pub struct Shutdown {
    state: Arc<watch::Sender<ShutdownState>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            state: self.state.subscribe(),
        }
    }

    /// Moves `Running` to `Draining`.
    ///
    /// # Returns
    /// `true` if this call started the drain, `false` if shutdown was
    /// already under way
    pub fn drain(&self) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });
        if started {
            debug!("shutdown state: draining");
        }
        started
    }

    /// Marks shutdown as complete.
    pub fn stop(&self) {
        self.state.send_if_modified(|state| {
            if *state == ShutdownState::Stopped {
                false
            } else {
                *state = ShutdownState::Stopped;
                true
            }
        });
        debug!("shutdown state: stopped");
    }
}

/// Read side of [`Shutdown`]
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state: watch::Receiver<ShutdownState>,
}

impl ShutdownSignal {
    pub fn is_running(&self) -> bool {
        *self.state.borrow() == ShutdownState::Running
    }

    /// Resolves once the process leaves `Running`, or if the controller is gone.
    pub async fn draining(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state != ShutdownState::Running)
            .await;
    }
}

/// Waits for SIGINT, or SIGTERM on unix.
pub async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
