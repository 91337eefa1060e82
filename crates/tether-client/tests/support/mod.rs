//! Scripted in-memory transport for exercising the stream client.
//!
//! Each stream attempt pops one [`Script`] describing what the fake server
//! feeds and how writes behave. A shared [`Log`] records everything the
//! client did, which is what the tests assert on.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_client::{
    CommandProcessor, CommandSource, LinkTransport, ProcessorError, ReplySink, StreamKind,
    TransportError,
};
use tether_wire::{Envelope, Inbound, ProgressiveControl, Reply};
use tokio_util::sync::CancellationToken;

/// Install the test subscriber once per binary; filtered by `RUST_LOG`.
pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One step of the fake server's inbound feed.
pub enum Feed {
    /// Deliver a frame.
    Frame(Inbound),
    /// Close the server side of the stream.
    End,
    /// Fail the read with a stream-level error.
    Fault(TransportError),
}

/// Behavior of one stream attempt.
#[derive(Default)]
pub struct Script {
    /// Inbound steps, in order. When exhausted the stream hangs until the
    /// attempt is cancelled.
    pub feeds: Vec<Feed>,
    /// Results of successive `send` calls (handshake first). Entries
    /// beyond the list succeed.
    pub send_results: Vec<Result<(), TransportError>>,
    /// Fail `open` itself with this error.
    pub fail_open: Option<TransportError>,
    /// Make `complete` fail.
    pub fail_complete: bool,
}

impl Script {
    /// Feed these frames, then close the server side.
    pub fn serve_then_close(frames: Vec<Inbound>) -> Self {
        let mut feeds: Vec<Feed> = frames.into_iter().map(Feed::Frame).collect();
        feeds.push(Feed::End);
        Self {
            feeds,
            ..Self::default()
        }
    }

    /// Deliver nothing and hang until cancelled.
    pub fn hang() -> Self {
        Self::default()
    }

    /// Fail the open call.
    pub fn refuse(error: TransportError) -> Self {
        Self {
            fail_open: Some(error),
            ..Self::default()
        }
    }
}

/// Everything the client did, across all attempts.
#[derive(Default)]
pub struct Log {
    /// Calls to `open` (including refused ones).
    pub opens: AtomicUsize,
    /// Streams open right now.
    pub open_now: AtomicUsize,
    /// High-water mark of concurrently open streams.
    pub max_open: AtomicUsize,
    /// Calls to `complete`.
    pub completes: AtomicUsize,
    /// Every envelope successfully written, in order.
    pub sent: Mutex<Vec<Envelope>>,
}

impl Log {
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Just the reply payloads, in write order.
    pub fn replies(&self) -> Vec<Reply> {
        self.sent.lock().iter().map(|e| e.reply.clone()).collect()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn completes(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn open_now(&self) -> usize {
        self.open_now.load(Ordering::SeqCst)
    }
}

/// Tracks how many streams are open at once: held by both halves of an
/// open stream, decremented when the last half drops.
pub struct OpenGauge {
    log: Arc<Log>,
}

impl OpenGauge {
    fn acquire(log: &Arc<Log>) -> Arc<Self> {
        let now = log.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        log.max_open.fetch_max(now, Ordering::SeqCst);
        Arc::new(Self {
            log: Arc::clone(log),
        })
    }
}

impl Drop for OpenGauge {
    fn drop(&mut self) {
        self.log.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted [`LinkTransport`].
pub struct MemoryLink {
    scripts: Mutex<VecDeque<Script>>,
    pub log: Arc<Log>,
}

impl MemoryLink {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            log: Arc::new(Log::default()),
        })
    }

    pub fn push_script(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }
}

impl LinkTransport for MemoryLink {
    type Sink = MemorySink;
    type Source = MemorySource;

    async fn open(
        &self,
        _kind: StreamKind,
        _token: &CancellationToken,
    ) -> Result<(Self::Sink, Self::Source), TransportError> {
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        // Attempts beyond the script just hang, like a server that went
        // quiet.
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        if let Some(error) = script.fail_open {
            return Err(error);
        }

        let gauge = OpenGauge::acquire(&self.log);
        let sink = MemorySink {
            log: Arc::clone(&self.log),
            send_results: script.send_results.into(),
            fail_complete: script.fail_complete,
            _gauge: Arc::clone(&gauge),
        };
        let source = MemorySource {
            feeds: script.feeds.into(),
            _gauge: gauge,
        };
        Ok((sink, source))
    }
}

pub struct MemorySink {
    log: Arc<Log>,
    send_results: VecDeque<Result<(), TransportError>>,
    fail_complete: bool,
    _gauge: Arc<OpenGauge>,
}

impl ReplySink for MemorySink {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        match self.send_results.pop_front() {
            Some(Err(error)) => Err(error),
            _ => {
                self.log.sent.lock().push(envelope.clone());
                Ok(())
            }
        }
    }

    async fn complete(&mut self) -> Result<(), TransportError> {
        self.log.completes.fetch_add(1, Ordering::SeqCst);
        if self.fail_complete {
            Err(TransportError::Io(std::io::Error::other("link gone")))
        } else {
            Ok(())
        }
    }
}

pub struct MemorySource {
    feeds: VecDeque<Feed>,
    _gauge: Arc<OpenGauge>,
}

impl CommandSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.feeds.pop_front() {
            Some(Feed::Frame(frame)) => Ok(Some(frame)),
            Some(Feed::End) => Ok(None),
            Some(Feed::Fault(error)) => Err(error),
            None => std::future::pending().await,
        }
    }
}

/// Processor that echoes command bodies back and acks progressive control
/// messages. Records every invocation for ordering assertions.
#[derive(Default)]
pub struct EchoProcessor {
    /// Command seqs that fail processing.
    pub fail_seqs: Vec<u64>,
    /// Seqs of every dispatched command, in order.
    pub processed: Mutex<Vec<u64>>,
}

impl EchoProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(seqs: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            fail_seqs: seqs,
            ..Self::default()
        })
    }

    pub fn processed(&self) -> Vec<u64> {
        self.processed.lock().clone()
    }
}

impl CommandProcessor for EchoProcessor {
    async fn process(
        &self,
        frame: Inbound,
        _token: &CancellationToken,
    ) -> Result<Option<Reply>, ProcessorError> {
        match frame {
            Inbound::Command { seq, body } => {
                self.processed.lock().push(seq);
                if self.fail_seqs.contains(&seq) {
                    return Err(ProcessorError::new(format!("scripted failure on {seq}")));
                }
                Ok(Some(Reply::CommandResult { seq, body }))
            }
            Inbound::Level { .. } => Ok(None),
            Inbound::Control(control) => Ok(Some(Reply::ControlAck {
                progressive: control.progressive(),
            })),
            Inbound::Empty => Err(ProcessorError::new("empty frame reached the processor")),
        }
    }
}

/// A command frame with a one-byte body derived from the seq.
pub fn cmd(seq: u64) -> Inbound {
    Inbound::Command {
        seq,
        body: vec![seq as u8],
    }
}

/// The enable-control frame for a pool.
pub fn enable(progressive: u32) -> Inbound {
    Inbound::Control(ProgressiveControl::Enable {
        progressive: tether_wire::ProgressiveId::new(progressive),
    })
}
