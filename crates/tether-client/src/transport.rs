//! Transport abstraction for the hall-server streams.
//!
//! The client does not know how bytes move; it consumes a [`LinkTransport`]
//! that can open one duplex stream at a time and hands back the two halves.
//! Implementations wrap whatever RPC framework carries the link.

use std::future::Future;
use std::io;

use tether_wire::{Envelope, Inbound, Reply};
use tokio_util::sync::CancellationToken;

/// Which of the two hall-server streams to open.
///
/// Selects the handshake shape and names the stream in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Command stream: server sends commands, machine replies.
    Command,
    /// Progressive stream: server pushes updates, machine mostly listens.
    Progressive,
}

impl StreamKind {
    /// Short name for log fields.
    pub const fn name(self) -> &'static str {
        match self {
            StreamKind::Command => "command",
            StreamKind::Progressive => "progressive",
        }
    }

    /// The first message written on a freshly opened stream of this kind.
    ///
    /// The command stream announces itself with `Hello`; the progressive
    /// stream registers for pushes with the lighter `Register`.
    pub const fn handshake(self) -> Reply {
        match self {
            StreamKind::Command => Reply::Hello,
            StreamKind::Progressive => Reply::Register,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Error raised by transport operations.
#[derive(Debug)]
pub enum TransportError {
    /// The transport could not accept the write right now (flow control,
    /// congested socket). Retriable.
    Congested,
    /// The operation timed out at the transport layer. Retriable.
    Timeout,
    /// Underlying IO failed.
    Io(io::Error),
    /// The peer aborted the stream and will not recover. Terminal: the
    /// restart loop gives up when it sees this.
    Aborted(String),
    /// The operation observed a cancellation.
    Cancelled,
}

impl TransportError {
    /// True for the closed set of failures worth retrying a single write
    /// over. Cancellation and terminal aborts are never transient, and an
    /// IO error means the stream itself is gone.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Congested | TransportError::Timeout)
    }

    /// True when no amount of reconnecting will help.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::Aborted(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Congested => write!(f, "transport congested"),
            TransportError::Timeout => write!(f, "transport timeout"),
            TransportError::Io(e) => write!(f, "io error: {e}"),
            TransportError::Aborted(reason) => write!(f, "stream aborted: {reason}"),
            TransportError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Outbound half of one open stream.
///
/// Single-writer: callers serialize through the driver's [`GatedWriter`]
/// gate, the sink itself performs no locking. `complete()` is the graceful
/// half-close of the outbound direction and must be the last operation.
///
/// [`GatedWriter`]: crate::GatedWriter
pub trait ReplySink: Send + 'static {
    /// Write one envelope to the stream.
    fn send(
        &mut self,
        envelope: &Envelope,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Gracefully half-close the outbound direction.
    fn complete(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Inbound half of one open stream.
///
/// A lazy, finite, non-restartable sequence of frames: `Ok(None)` means the
/// server closed its side and no further frames will arrive.
pub trait CommandSource: Send + 'static {
    /// Pull the next frame, waiting until one arrives or the stream ends.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Inbound>, TransportError>> + Send;
}

/// A factory for duplex streams on the hall-server link.
///
/// Called once per stream attempt. The returned halves are owned exclusively
/// by that attempt and dropped before the next one opens.
pub trait LinkTransport: Send + Sync + 'static {
    /// Outbound half type.
    type Sink: ReplySink;
    /// Inbound half type.
    type Source: CommandSource;

    /// Open a fresh stream of the given kind.
    ///
    /// Implementations should observe `token` and bail out with
    /// [`TransportError::Cancelled`] if it fires mid-open.
    fn open(
        &self,
        kind: StreamKind,
        token: &CancellationToken,
    ) -> impl Future<Output = Result<(Self::Sink, Self::Source), TransportError>> + Send;
}
