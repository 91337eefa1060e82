//! One stream attempt, open to close.
//!
//! [`StreamDriver`] owns the lifecycle of a single duplex stream attempt:
//! open, handshake, listen, dispatch, tear down. The attempt walks
//!
//! ```text
//! Idle → Opening → HandshakeSent → Listening → (Dispatching)* → Closing
//!                                      │
//!                                      ├── read failure → Faulted
//!                                      └── token fired  → Cancelled
//! ```
//!
//! and reports how it ended as an [`AttemptOutcome`]; the service façade
//! decides whether to back off and run another attempt.
//!
//! Failure handling is deliberately asymmetric: a command that fails to
//! process or whose response write exhausts the retry budget is logged and
//! dropped - the stream lives on. Only stream-level open/read failures or
//! cancellation end the attempt.

use std::sync::Arc;

use tether_wire::{Envelope, Inbound, MachineId, Reply};
use tokio_util::sync::CancellationToken;

use crate::link::AttemptSlot;
use crate::retry::RetryPolicy;
use crate::stream::{GatedWriter, StreamHandle};
use crate::transport::{CommandSource, LinkTransport, ReplySink, StreamKind, TransportError};

/// Error from the command processor.
///
/// Opaque to the driver: whatever went wrong, the command is dropped and
/// the stream continues.
#[derive(Debug)]
pub struct ProcessorError(pub String);

impl ProcessorError {
    /// Wrap a message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "processor error: {}", self.0)
    }
}

impl std::error::Error for ProcessorError {}

impl From<String> for ProcessorError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for ProcessorError {
    fn from(msg: &str) -> Self {
        Self(msg.to_owned())
    }
}

/// Turns one inbound frame into at most one reply.
///
/// External collaborator: the driver treats it as an opaque function. It is
/// invoked one frame at a time, in arrival order, with the per-attempt
/// cancellation token. Failures are caught per command and never fault the
/// stream.
pub trait CommandProcessor: Send + Sync + 'static {
    /// Process one frame. `Ok(None)` means no reply is needed.
    fn process(
        &self,
        frame: Inbound,
        token: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<Option<Reply>, ProcessorError>> + Send;
}

/// How a stream attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The server closed its side; the outbound half was completed
    /// gracefully.
    ServerClosed,
    /// The per-attempt token fired (outer shutdown or link severed).
    Cancelled,
    /// A stream-level open/handshake/read failure ended the attempt.
    Faulted(TransportError),
}

impl AttemptOutcome {
    /// True when no restart will recover from this outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptOutcome::Faulted(e) if e.is_terminal())
    }
}

/// Drives one duplex stream attempt at a time.
///
/// At most one attempt is live per driver instance: arming the attempt slot
/// cancels any predecessor, and the previous handle is fully closed before
/// [`run_attempt`](Self::run_attempt) returns.
pub struct StreamDriver<T, P> {
    transport: Arc<T>,
    processor: Arc<P>,
    kind: StreamKind,
    write_retry: RetryPolicy,
    slot: AttemptSlot,
}

impl<T: LinkTransport, P: CommandProcessor> StreamDriver<T, P> {
    /// Create a driver for the given stream kind with the default write
    /// retry policy.
    pub fn new(transport: Arc<T>, processor: Arc<P>, kind: StreamKind) -> Self {
        Self {
            transport,
            processor,
            kind,
            write_retry: RetryPolicy::default(),
            slot: AttemptSlot::new(),
        }
    }

    /// Replace the write retry policy.
    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.set_write_retry(policy);
        self
    }

    /// Replace the write retry policy in place.
    pub fn set_write_retry(&mut self, policy: RetryPolicy) {
        self.write_retry = policy;
    }

    /// The stream kind this driver opens.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// The attempt slot a [`LinkWatcher`](crate::LinkWatcher) cancels
    /// through.
    pub fn slot(&self) -> AttemptSlot {
        self.slot.clone()
    }

    /// Run one attempt to completion.
    ///
    /// Creates a per-attempt token linked to `outer`, arms it in the slot
    /// (cancelling any predecessor), and returns only after the stream
    /// handle has been closed and the slot cleared.
    pub async fn run_attempt(
        &self,
        machine: &MachineId,
        outer: &CancellationToken,
    ) -> AttemptOutcome {
        if outer.is_cancelled() {
            return AttemptOutcome::Cancelled;
        }

        let attempt = outer.child_token();
        self.slot.arm(attempt.clone());
        let outcome = self.attempt_inner(machine, &attempt).await;
        // Clear before returning so the watcher never cancels a token
        // belonging to a finished attempt.
        self.slot.clear();

        match &outcome {
            AttemptOutcome::ServerClosed => {
                tracing::debug!(stream = self.kind.name(), "server closed stream")
            }
            AttemptOutcome::Cancelled => {
                tracing::debug!(stream = self.kind.name(), "stream attempt cancelled")
            }
            AttemptOutcome::Faulted(e) => tracing::warn!(
                stream = self.kind.name(),
                error = %e,
                outer_cancelled = outer.is_cancelled(),
                "stream attempt faulted"
            ),
        }
        outcome
    }

    async fn attempt_inner(
        &self,
        machine: &MachineId,
        attempt: &CancellationToken,
    ) -> AttemptOutcome {
        // Opening
        let opened = tokio::select! {
            _ = attempt.cancelled() => return AttemptOutcome::Cancelled,
            result = self.transport.open(self.kind, attempt) => result,
        };
        let (sink, source) = match opened {
            Ok(halves) => halves,
            Err(TransportError::Cancelled) => return AttemptOutcome::Cancelled,
            Err(e) => return AttemptOutcome::Faulted(e),
        };

        let mut handle = StreamHandle::new(sink, source);
        let writer = handle.writer();

        // HandshakeSent: first outbound message identifies the machine.
        let hello = Envelope::new(machine.clone(), self.kind.handshake());
        if let Err(e) = writer.send(&hello).await {
            handle.close().await;
            return match e {
                TransportError::Cancelled => AttemptOutcome::Cancelled,
                e => AttemptOutcome::Faulted(e),
            };
        }
        tracing::debug!(stream = self.kind.name(), %machine, "handshake sent, listening");

        // Listening
        loop {
            let frame = tokio::select! {
                _ = attempt.cancelled() => {
                    self.teardown(&writer, &mut handle).await;
                    return AttemptOutcome::Cancelled;
                }
                result = handle.recv() => result,
            };

            match frame {
                // Closing: inbound sequence exhausted, half-close and leave.
                Ok(None) => {
                    if let Err(e) = writer.complete().await {
                        tracing::debug!(
                            stream = self.kind.name(),
                            error = %e,
                            "graceful complete failed"
                        );
                    }
                    handle.close().await;
                    return AttemptOutcome::ServerClosed;
                }
                // Keepalive padding carries nothing to dispatch.
                Ok(Some(Inbound::Empty)) => continue,
                // Dispatching
                Ok(Some(frame)) => {
                    self.dispatch(machine, frame, &writer, attempt).await;
                }
                Err(TransportError::Cancelled) => {
                    self.teardown(&writer, &mut handle).await;
                    return AttemptOutcome::Cancelled;
                }
                // Faulted: stream-level read failures end the attempt.
                Err(e) => {
                    self.teardown(&writer, &mut handle).await;
                    return AttemptOutcome::Faulted(e);
                }
            }
        }
    }

    /// Invoke the processor for one frame and write back its reply, if any.
    ///
    /// Per-command failure domain: processor errors and retry-exhausted
    /// writes are logged and dropped here, the listening loop never sees
    /// them.
    async fn dispatch<K: ReplySink>(
        &self,
        machine: &MachineId,
        frame: Inbound,
        writer: &GatedWriter<K>,
        attempt: &CancellationToken,
    ) {
        let reply = match self.processor.process(frame, attempt).await {
            Ok(Some(reply)) => reply,
            // Push-only fast path: nothing to write, straight back to the
            // next read.
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    stream = self.kind.name(),
                    error = %e,
                    "command processor failed, dropping command"
                );
                return;
            }
        };

        let envelope = Envelope::new(machine.clone(), reply);
        match self
            .write_retry
            .execute(attempt, || writer.send(&envelope))
            .await
        {
            Ok(()) => {}
            Err(TransportError::Cancelled) => {
                tracing::debug!(stream = self.kind.name(), "response write cancelled");
            }
            Err(e) => {
                tracing::warn!(
                    stream = self.kind.name(),
                    error = %e,
                    "response write dropped after retries"
                );
            }
        }
    }

    /// Best-effort half-close on an abnormal exit, then release the handle.
    /// A failing complete is expected when the link is already gone.
    async fn teardown<K: ReplySink, R: CommandSource>(
        &self,
        writer: &GatedWriter<K>,
        handle: &mut StreamHandle<K, R>,
    ) {
        if let Err(e) = writer.complete().await {
            tracing::debug!(
                stream = self.kind.name(),
                error = %e,
                "best-effort complete failed"
            );
        }
        handle.close().await;
    }
}
