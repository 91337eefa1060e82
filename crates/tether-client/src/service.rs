//! Service façades: the restart loop around the stream drivers.
//!
//! [`CommandService`] and [`ProgressiveService`] are the public entry
//! points. Each owns a [`StreamDriver`], wires a [`LinkWatcher`] to the
//! driver's attempt slot for the lifetime of the service, and runs stream
//! attempts in a loop: attempt, wait the backoff, attempt again, until the
//! caller's token fires.

use std::time::Duration;

use parking_lot::Mutex;
use std::sync::Arc;
use tether_wire::{LinkState, MachineId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::driver::{AttemptOutcome, CommandProcessor, StreamDriver};
use crate::link::LinkWatcher;
use crate::retry::RetryPolicy;
use crate::transport::{LinkTransport, StreamKind};

/// Restart behavior between stream attempts.
///
/// `back_off` is the wait inserted before every reopen (read fresh at the
/// top of each iteration, so an operator can change it between attempts).
/// `max_restarts` caps how many times a service will reopen before giving
/// up; `None` restarts forever. `jitter` spreads waits by a factor in
/// [0.5, 1.5) so a floor of machines does not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Wait between attempts.
    pub back_off: Duration,
    /// Restart budget; `None` means unbounded.
    pub max_restarts: Option<u32>,
    /// Scale each wait pseudo-randomly.
    pub jitter: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            back_off: Duration::from_millis(200),
            max_restarts: None,
            jitter: false,
        }
    }
}

impl RestartPolicy {
    /// The wait before the given restart (1-indexed).
    pub fn wait_for(&self, restart: u32) -> Duration {
        if !self.jitter {
            return self.back_off;
        }
        // xorshift over the restart counter; cheap and dependency-free.
        let mut x = restart.wrapping_mul(0x9E37_79B9) | 1;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        let frac = f64::from(x) / (f64::from(u32::MAX) + 1.0);
        self.back_off.mul_f64(0.5 + frac)
    }
}

/// Shared restart loop for both stream kinds.
struct ServiceCore<T, P> {
    driver: StreamDriver<T, P>,
    restart: Mutex<RestartPolicy>,
    watcher: LinkWatcher,
}

impl<T: LinkTransport, P: CommandProcessor> ServiceCore<T, P> {
    fn new(
        transport: Arc<T>,
        processor: Arc<P>,
        states: watch::Receiver<LinkState>,
        kind: StreamKind,
    ) -> Self {
        let driver = StreamDriver::new(transport, processor, kind);
        let watcher = LinkWatcher::spawn(states, driver.slot());
        Self {
            driver,
            restart: Mutex::new(RestartPolicy::default()),
            watcher,
        }
    }

    fn back_off(&self) -> Duration {
        self.restart.lock().back_off
    }

    fn set_back_off(&self, back_off: Duration) {
        self.restart.lock().back_off = back_off;
    }

    fn restart_policy(&self) -> RestartPolicy {
        self.restart.lock().clone()
    }

    fn set_restart_policy(&self, policy: RestartPolicy) {
        *self.restart.lock() = policy;
    }

    /// Run attempts until the outer token cancels.
    ///
    /// Returns `true` once the token fired and the current attempt has
    /// unwound. Returns `false` only when the loop itself cannot go on: a
    /// terminal transport abort, or an exhausted restart budget.
    async fn run(&self, machine: MachineId, outer: &CancellationToken) -> bool {
        let kind = self.driver.kind();
        let mut restarts = 0u32;
        let mut watcher_warned = false;

        loop {
            if outer.is_cancelled() {
                return true;
            }
            if !self.watcher.is_running() && !watcher_warned {
                // The supervised watcher died with the state source; the
                // service keeps running but disconnects go unnoticed.
                tracing::warn!(stream = kind.name(), "link watcher stopped");
                watcher_warned = true;
            }

            let outcome = self.driver.run_attempt(&machine, outer).await;
            if outer.is_cancelled() {
                return true;
            }
            if outcome.is_terminal() {
                tracing::error!(
                    stream = kind.name(),
                    %machine,
                    "terminal stream fault, giving up"
                );
                return false;
            }

            restarts += 1;
            let policy = self.restart_policy();
            if let Some(max) = policy.max_restarts {
                if restarts > max {
                    tracing::error!(
                        stream = kind.name(),
                        restarts,
                        "restart budget exhausted, giving up"
                    );
                    return false;
                }
            }

            let wait = policy.wait_for(restarts);
            tracing::debug!(
                stream = kind.name(),
                restarts,
                wait_ms = wait.as_millis() as u64,
                "backing off before reopen"
            );
            tokio::select! {
                _ = outer.cancelled() => return true,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Client for the hall server's command stream.
///
/// Keeps a command stream open for as long as the caller's token lives,
/// reopening after every stream loss with the configured backoff.
pub struct CommandService<T, P> {
    core: ServiceCore<T, P>,
}

impl<T: LinkTransport, P: CommandProcessor> CommandService<T, P> {
    /// Create the service and subscribe its link watcher to `states`.
    pub fn new(
        transport: Arc<T>,
        processor: Arc<P>,
        states: watch::Receiver<LinkState>,
    ) -> Self {
        Self {
            core: ServiceCore::new(transport, processor, states, StreamKind::Command),
        }
    }

    /// Replace the per-write retry policy.
    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.core.driver.set_write_retry(policy);
        self
    }

    /// Current wait between stream attempts.
    pub fn back_off(&self) -> Duration {
        self.core.back_off()
    }

    /// Change the wait between stream attempts; read at the top of each
    /// restart iteration.
    pub fn set_back_off(&self, back_off: Duration) {
        self.core.set_back_off(back_off)
    }

    /// Replace the whole restart policy.
    pub fn set_restart_policy(&self, policy: RestartPolicy) {
        self.core.set_restart_policy(policy)
    }

    /// Handle commands for `machine` until `outer` cancels.
    ///
    /// Returns `true` on clean shutdown (token canceled, attempt unwound;
    /// if the token is already canceled, no stream is ever opened). Returns
    /// `false` only when the restart loop gives up: terminal transport
    /// abort or exhausted restart budget.
    pub async fn handle_commands(&self, machine: MachineId, outer: &CancellationToken) -> bool {
        self.core.run(machine, outer).await
    }
}

/// Client for the hall server's progressive update stream.
///
/// Same restart loop as [`CommandService`]; the stream registers with the
/// lighter `Register` handshake and mostly listens - the processor returns
/// a reply only for control sub-messages.
pub struct ProgressiveService<T, P> {
    core: ServiceCore<T, P>,
}

impl<T: LinkTransport, P: CommandProcessor> ProgressiveService<T, P> {
    /// Create the service and subscribe its link watcher to `states`.
    pub fn new(
        transport: Arc<T>,
        processor: Arc<P>,
        states: watch::Receiver<LinkState>,
    ) -> Self {
        Self {
            core: ServiceCore::new(transport, processor, states, StreamKind::Progressive),
        }
    }

    /// Replace the per-write retry policy used for control acks.
    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.core.driver.set_write_retry(policy);
        self
    }

    /// Current wait between stream attempts.
    pub fn back_off(&self) -> Duration {
        self.core.back_off()
    }

    /// Change the wait between stream attempts.
    pub fn set_back_off(&self, back_off: Duration) {
        self.core.set_back_off(back_off)
    }

    /// Replace the whole restart policy.
    pub fn set_restart_policy(&self, policy: RestartPolicy) {
        self.core.set_restart_policy(policy)
    }

    /// Keep the update stream registered for `machine` until `outer`
    /// cancels. Same return contract as
    /// [`CommandService::handle_commands`].
    pub async fn handle_commands(&self, machine: MachineId, outer: &CancellationToken) -> bool {
        self.core.run(machine, outer).await
    }
}
