#![deny(unsafe_code)]

//! Message types for the hall-server duplex streams.
//!
//! A machine on the floor keeps two long-lived streams open to the hall
//! server: the *command* stream (server sends commands, machine replies) and
//! the *progressive* stream (server pushes level updates, machine mostly
//! listens). Both directions exchange the types defined here; how they are
//! encoded on a particular transport is the transport's business.

use serde::{Deserialize, Serialize};

/// Machine serial identifying this cabinet to the hall server.
///
/// Every outbound message carries the serial so the server can correlate
/// replies without per-stream session state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MachineId(pub String);

impl MachineId {
    /// Create a machine ID from a serial string.
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    /// Get the raw serial.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MachineId {
    fn from(serial: &str) -> Self {
        Self(serial.to_owned())
    }
}

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "machine:{}", self.0)
    }
}

/// Identifier of one progressive pool on the hall server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ProgressiveId(pub u32);

impl ProgressiveId {
    /// Create a new progressive ID.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw u32 value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ProgressiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "prog:{}", self.0)
    }
}

/// A frame read from a duplex stream.
///
/// The command stream delivers `Command` frames; the progressive stream
/// delivers `Level` and `Control` frames. `Empty` may appear on either as
/// keepalive padding and carries no meaning.
#[repr(u8)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inbound {
    /// Keepalive / padding frame. Ignored by drivers.
    Empty = 0,

    /// A command addressed to this machine. `body` is opaque to the stream
    /// layer; the command processor interprets it.
    Command { seq: u64, body: Vec<u8> } = 1,

    /// A progressive level broadcast. Informational, no reply expected.
    Level {
        progressive: ProgressiveId,
        level: u32,
        amount_millis: u64,
    } = 2,

    /// A progressive control sub-message. The only progressive frames the
    /// machine acknowledges.
    Control(ProgressiveControl) = 3,
}

/// Enable/disable instruction for one progressive pool.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressiveControl {
    /// Attach the machine to the pool.
    Enable { progressive: ProgressiveId } = 0,
    /// Detach the machine from the pool.
    Disable { progressive: ProgressiveId } = 1,
}

impl ProgressiveControl {
    /// The pool this instruction targets.
    pub fn progressive(&self) -> ProgressiveId {
        match self {
            ProgressiveControl::Enable { progressive } => *progressive,
            ProgressiveControl::Disable { progressive } => *progressive,
        }
    }
}

/// Outbound payload written by the machine.
///
/// This is a closed set: the two handshakes (one per stream kind), command
/// results, status updates, and control acknowledgements.
#[repr(u8)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Command-stream handshake. First message on a fresh command stream.
    Hello = 0,

    /// Progressive-stream handshake. Registers for update pushes; no
    /// acknowledgement payload.
    Register = 1,

    /// Result of a processed command, correlated by `seq`.
    CommandResult { seq: u64, body: Vec<u8> } = 2,

    /// Unsolicited machine status.
    Status(StatusUpdate) = 3,

    /// Acknowledgement of a progressive control sub-message.
    ControlAck { progressive: ProgressiveId } = 4,
}

impl Reply {
    /// True for the stream-opening handshake variants.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Reply::Hello | Reply::Register)
    }
}

/// Machine status snapshot pushed to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// True while the machine is available for play.
    pub online: bool,
    /// Active fault code, if any.
    pub fault_code: Option<u32>,
}

/// Envelope for every outbound write: identity tag plus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Machine serial of the sender.
    pub machine: MachineId,
    /// The payload.
    pub reply: Reply,
}

impl Envelope {
    /// Wrap a reply in an envelope for the given machine.
    pub fn new(machine: MachineId, reply: Reply) -> Self {
        Self { machine, reply }
    }
}

/// Lifecycle state of the transport-level connection to the hall server.
///
/// Driven entirely by the transport; the stream client only reads it to
/// decide when to tear down the active stream attempt.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkState {
    /// Link is up.
    #[default]
    Connected = 0,
    /// Link dropped; the transport may or may not come back.
    Disconnected = 1,
    /// Link shut down for good.
    Closed = 2,
    /// Transport is re-establishing the link.
    Reconnecting = 3,
}

impl LinkState {
    /// True for states that invalidate any stream currently open on the link.
    pub fn severs_streams(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Closed)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Closed => "closed",
            LinkState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}
