//! Start/stop control for the engine
//!
//! `stop` only stops new work. Units already submitted keep their own
//! deadlines and resolve before the engine reports `Stopped`.

use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    /// No new opportunities; in-flight units are resolving
    Stopping,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Stopping => write!(f, "stopping"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

pub struct Lifecycle {
    state: watch::Sender<EngineState>,
    cancel: Mutex<CancellationToken>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            state,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Begin a run. Returns the token that ends intake for this run.
    pub fn start(&self) -> Result<CancellationToken> {
        let current = *self.state.borrow();
        match current {
            EngineState::Idle | EngineState::Stopped => {}
            other => {
                return Err(Error::Internal(format!(
                    "Cannot start engine while {}",
                    other
                )))
            }
        }

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        self.state.send_replace(EngineState::Running);
        info!("Engine started");
        Ok(token)
    }

    /// Stop accepting opportunities. Idempotent.
    pub fn stop(&self) {
        if *self.state.borrow() != EngineState::Running {
            return;
        }
        self.state.send_replace(EngineState::Stopping);
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        info!("Engine stopping; in-flight units will resolve");
    }

    /// Called by the engine once every in-flight unit has resolved
    pub fn mark_stopped(&self) {
        self.state.send_replace(EngineState::Stopped);
        info!("Engine stopped");
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn watch(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
