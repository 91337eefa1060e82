#![deny(unsafe_code)]

//! Stream client for the hall server's duplex command and progressive
//! update streams.
//!
//! A machine keeps two long-lived bidirectional streams open to the hall
//! server. On the *command* stream the server sends commands and the machine
//! writes back results; on the *progressive* stream the server pushes level
//! updates and the machine only acknowledges control sub-messages. Both
//! streams share the same lifecycle: open, handshake, listen, dispatch,
//! tear down, back off, reopen.
//!
//! # Architecture
//!
//! ```text
//!  CommandService / ProgressiveService        (restart loop + backoff)
//!          │
//!          ├── LinkWatcher ──── cancels ──┐   (transport state events)
//!          ▼                              ▼
//!     StreamDriver ──────────── per-attempt CancellationToken
//!          │
//!          ├── LinkTransport::open()      (one stream per attempt)
//!          ├── handshake + replies        (serialized through GatedWriter)
//!          └── CommandProcessor           (one frame at a time, in order)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tether_client::{CommandService, RestartPolicy};
//! use tether_wire::MachineId;
//! use tokio_util::sync::CancellationToken;
//!
//! let service = CommandService::new(transport, processor, link_states);
//! let shutdown = CancellationToken::new();
//!
//! // Runs until `shutdown` fires; reconnects on every stream loss.
//! let clean = service.handle_commands(MachineId::new("SN-1042"), &shutdown).await;
//! assert!(clean);
//! ```

mod driver;
mod link;
mod retry;
mod service;
mod stream;
mod transport;

pub use driver::{AttemptOutcome, CommandProcessor, ProcessorError, StreamDriver};
pub use link::{AttemptSlot, LinkWatcher};
pub use retry::{RetryDelay, RetryPolicy};
pub use service::{CommandService, ProgressiveService, RestartPolicy};
pub use stream::{GatedWriter, StreamHandle};
pub use transport::{CommandSource, LinkTransport, ReplySink, StreamKind, TransportError};

pub use tether_wire as wire;
pub use tether_wire::{Envelope, Inbound, LinkState, MachineId, Reply};
