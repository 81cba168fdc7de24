//! Pause, resume and abort signalling for a bulk run.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// State of the run control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    /// Work proceeds normally.
    #[default]
    Running,
    /// A pause has been requested; it takes effect at the next item boundary.
    PauseRequested,
    /// The run is parked between items.
    Paused,
    /// The run should stop as soon as possible.
    Aborted,
}

/// Cloneable handle shared between a run and whoever steers it.
///
/// Pausing is cooperative: the run checks in between items. Aborting
/// also wakes anything awaiting [`cancelled`](Self::cancelled), so an
/// in-flight call can be dropped.
#[derive(Debug, Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<ControlState>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ControlState::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Returns the current state.
    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == ControlState::Aborted
    }

    pub fn is_paused(&self) -> bool {
        matches!(
            self.state(),
            ControlState::Paused | ControlState::PauseRequested
        )
    }

    /// Requests a pause. Returns false unless currently running.
    pub fn request_pause(&self) -> bool {
        self.transition(|s| (s == ControlState::Running).then_some(ControlState::PauseRequested))
    }

    /// Moves a requested pause into effect. Called by the run.
    pub fn execute_pause(&self) -> bool {
        self.transition(|s| (s == ControlState::PauseRequested).then_some(ControlState::Paused))
    }

    /// Resumes a paused or pause-requested run.
    pub fn resume(&self) -> bool {
        self.transition(|s| match s {
            ControlState::Paused | ControlState::PauseRequested => Some(ControlState::Running),
            _ => None,
        })
    }

    /// Aborts the run. Returns false if already aborted.
    pub fn abort(&self) -> bool {
        self.transition(|s| (s != ControlState::Aborted).then_some(ControlState::Aborted))
    }

    /// Returns to `Running` regardless of the current state.
    pub fn reset(&self) {
        self.tx.send_replace(ControlState::Running);
    }

    /// Item-boundary checkpoint.
    ///
    /// Puts a requested pause into effect and waits until the run is
    /// resumed or aborted. Returns false if the run was aborted.
    pub async fn checkpoint(&self) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ControlState::Running => return true,
                ControlState::Aborted => return false,
                ControlState::PauseRequested => {
                    if self.execute_pause() {
                        info!("bulk run paused");
                    }
                }
                ControlState::Paused => {
                    if rx.changed().await.is_err() {
                        return false;
                    }
                    if self.state() == ControlState::Running {
                        info!("bulk run resumed");
                    }
                }
            }
        }
    }

    /// Resolves once the run is aborted.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| *s == ControlState::Aborted).await;
    }

    fn transition(&self, f: impl FnOnce(ControlState) -> Option<ControlState>) -> bool {
        self.tx.send_if_modified(|state| match f(*state) {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        })
    }
}
