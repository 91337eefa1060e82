//! Transport link-state watching.
//!
//! The transport maintains its own long-lived connection to the hall server
//! and publishes lifecycle transitions on a watch channel. When the link
//! drops, any stream open on it is dead weight: the watcher cancels the
//! current attempt so the driver tears down and the service reopens once
//! the link is back. No retry or backoff logic lives here.

use std::sync::Arc;

use parking_lot::Mutex;
use tether_wire::LinkState;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Single-slot holder of the current per-attempt cancellation token.
///
/// The driver arms the slot at the start of each attempt and clears it when
/// the attempt ends; the watcher cancels whatever is armed. Arming cancels
/// any previous token first, so a stale attempt can never outlive its
/// replacement.
#[derive(Clone, Default)]
pub struct AttemptSlot {
    inner: Arc<Mutex<Option<CancellationToken>>>,
}

impl AttemptSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the token for a new attempt, cancelling any previous one.
    pub fn arm(&self, token: CancellationToken) {
        let mut slot = self.inner.lock();
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        *slot = Some(token);
    }

    /// Cancel the armed token, if any. The token stays armed: callers that
    /// observe the cancellation clear the slot themselves.
    pub fn cancel_active(&self) {
        if let Some(token) = self.inner.lock().as_ref() {
            token.cancel();
        }
    }

    /// Remove the armed token without cancelling it.
    pub fn clear(&self) {
        self.inner.lock().take();
    }

    /// True while an attempt's token is armed.
    pub fn is_armed(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl std::fmt::Debug for AttemptSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptSlot")
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Watches link-state transitions and cancels the active stream attempt
/// when the link goes down.
///
/// The subscription lives exactly as long as the watcher: dropping it
/// aborts the task, so a replaced watcher can never act on a stale slot.
pub struct LinkWatcher {
    task: JoinHandle<()>,
}

impl LinkWatcher {
    /// Subscribe to `states` and cancel through `slot` on severing
    /// transitions (`Disconnected`, `Closed`).
    pub fn spawn(mut states: watch::Receiver<LinkState>, slot: AttemptSlot) -> Self {
        let task = tokio::spawn(async move {
            loop {
                if states.changed().await.is_err() {
                    tracing::debug!("link state source dropped, watcher exiting");
                    break;
                }
                let state = *states.borrow_and_update();
                if state.severs_streams() {
                    tracing::debug!(%state, "link severed, cancelling active stream attempt");
                    slot.cancel_active();
                }
            }
        });
        Self { task }
    }

    /// True while the watcher task is alive. The owning service checks this
    /// so a dead watcher is noticed and logged rather than silently lost.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for LinkWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
