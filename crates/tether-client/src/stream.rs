//! Ownership of one open duplex stream attempt.
//!
//! [`StreamHandle`] holds both halves of a stream for exactly one attempt.
//! Reads go through the handle (single reader: the attempt loop). Writes go
//! through the [`GatedWriter`], the mutual-exclusion gate shared by the
//! handshake write, every response write and the final `complete()`. The
//! gate is held for the duration of one call, never across a read.

use std::sync::Arc;

use tether_wire::{Envelope, Inbound};
use tokio::sync::Mutex;

use crate::transport::{CommandSource, ReplySink, TransportError};

/// Both halves of one open stream.
///
/// Destroyed when the attempt ends; never shared across attempts. `close()`
/// is idempotent.
pub struct StreamHandle<K, R> {
    sink: Arc<Mutex<Option<K>>>,
    source: Option<R>,
}

impl<K: ReplySink, R: CommandSource> StreamHandle<K, R> {
    /// Take ownership of a freshly opened stream's halves.
    pub fn new(sink: K, source: R) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Some(sink))),
            source: Some(source),
        }
    }

    /// Writer gate for this stream.
    pub fn writer(&self) -> GatedWriter<K> {
        GatedWriter {
            sink: Arc::clone(&self.sink),
        }
    }

    /// Pull the next inbound frame.
    ///
    /// Returns `Ok(None)` once the server has closed its side, or
    /// immediately after `close()`.
    pub async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.source.as_mut() {
            Some(source) => source.recv().await,
            None => Ok(None),
        }
    }

    /// Drop both halves and release the transport resources. Idempotent.
    pub async fn close(&mut self) {
        self.source.take();
        self.sink.lock().await.take();
    }
}

/// Serialized writer for one stream.
///
/// Clones share the same gate, so no two writes ever interleave on the
/// stream. Once `complete()` has run (or the handle was closed), further
/// sends fail with [`TransportError::Cancelled`].
pub struct GatedWriter<K> {
    sink: Arc<Mutex<Option<K>>>,
}

impl<K> Clone for GatedWriter<K> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<K: ReplySink> GatedWriter<K> {
    /// Write one envelope. The gate is held for exactly this call.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => sink.send(envelope).await,
            None => Err(TransportError::Cancelled),
        }
    }

    /// Gracefully half-close the outbound direction.
    ///
    /// Takes the sink out of the gate, so this runs at most once per
    /// stream; later calls are no-ops.
    pub async fn complete(&self) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        match guard.take() {
            Some(mut sink) => sink.complete().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSink {
        sends: Arc<AtomicU32>,
        completes: Arc<AtomicU32>,
    }

    impl ReplySink for CountingSink {
        async fn send(&mut self, _envelope: &Envelope) -> Result<(), TransportError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn complete(&mut self) -> Result<(), TransportError> {
            self.completes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SilentSource;

    impl CommandSource for SilentSource {
        async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
            Ok(None)
        }
    }

    fn handle() -> (StreamHandle<CountingSink, SilentSource>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let sends = Arc::new(AtomicU32::new(0));
        let completes = Arc::new(AtomicU32::new(0));
        let sink = CountingSink {
            sends: Arc::clone(&sends),
            completes: Arc::clone(&completes),
        };
        (StreamHandle::new(sink, SilentSource), sends, completes)
    }

    #[tokio::test]
    async fn complete_runs_at_most_once() {
        let (handle, _sends, completes) = handle();
        let writer = handle.writer();

        assert!(writer.complete().await.is_ok());
        assert!(writer.complete().await.is_ok());
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_after_complete_fails() {
        let (handle, sends, _completes) = handle();
        let writer = handle.writer();

        writer.complete().await.unwrap();
        let envelope = Envelope::new("SN-1".into(), tether_wire::Reply::Hello);
        assert!(matches!(
            writer.send(&envelope).await,
            Err(TransportError::Cancelled)
        ));
        assert_eq!(sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_silences_recv() {
        let (mut handle, _sends, completes) = handle();
        handle.close().await;
        handle.close().await;

        assert!(matches!(handle.recv().await, Ok(None)));
        // close drops the sink without a graceful complete
        assert_eq!(completes.load(Ordering::SeqCst), 0);
    }
}
