//! Fan-out of the input PCM stream
//!
//! One pump task reads the current source and broadcasts frame-aligned chunks.
//! Every attached sink has its own writer task fed from a broadcast receiver.
//! A discard receiver is always subscribed so the pump never runs without a
//! consumer. Sinks that fall behind lose chunks instead of stalling the pump.
//!
//! Sources and sinks are independent: replacing the source never closes a sink.

use crate::process::{PcmReader, PcmWriter, ProcessId};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bytes per frame: 2 channels of 16-bit samples
pub const FRAME_BYTES: usize = 4;

/// Read size of the pump
const CHUNK_BYTES: usize = 4096;

/// Chunks buffered per sink before it starts losing audio (~1.5s)
const CHANNEL_CHUNKS: usize = 64;

/// Identifier of an attached sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(pub u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink#{}", self.0)
    }
}

/// Notifications from the duplicator tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicatorEvent {
    /// First audio arrived from this source
    SourceFlowing(ProcessId),
    /// The source reached EOF or failed to read
    SourceEnded(ProcessId),
    /// Writing to a sink failed; the sink is no longer fed
    SinkFailed { sink: SinkId, error: String },
}

struct Source {
    tag: ProcessId,
    pump: JoinHandle<()>,
}

struct Inner {
    tx: broadcast::Sender<Bytes>,
    events: mpsc::UnboundedSender<DuplicatorEvent>,
    source: Mutex<Option<Source>>,
    sinks: Mutex<HashMap<SinkId, JoinHandle<()>>>,
    next_sink: AtomicU64,
    discard: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(source) = lock(&self.source).take() {
            source.pump.abort();
        }
        for (_, task) in lock(&self.sinks).drain() {
            task.abort();
        }
        self.discard.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sink side of the fan-out, owned by the output registry
#[derive(Clone)]
pub struct Duplicator {
    inner: Arc<Inner>,
}

/// Source side of the fan-out, used by the input session
#[derive(Clone)]
pub struct Feeder {
    inner: Arc<Inner>,
}

impl Duplicator {
    pub fn new(events: mpsc::UnboundedSender<DuplicatorEvent>) -> Self {
        let (tx, mut discard_rx) = broadcast::channel::<Bytes>(CHANNEL_CHUNKS);
        let discard = tokio::spawn(async move {
            loop {
                match discard_rx.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            inner: Arc::new(Inner {
                tx,
                events,
                source: Mutex::new(None),
                sinks: Mutex::new(HashMap::new()),
                next_sink: AtomicU64::new(1),
                discard,
            }),
        }
    }

    pub fn feeder(&self) -> Feeder {
        Feeder {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Start copying the stream into `writer`
    pub fn attach_sink(&self, label: &str, writer: PcmWriter) -> SinkId {
        let id = SinkId(self.inner.next_sink.fetch_add(1, Ordering::Relaxed));
        let rx = self.inner.tx.subscribe();
        let task = tokio::spawn(feed_sink(
            id,
            label.to_string(),
            rx,
            writer,
            self.inner.events.clone(),
        ));
        lock(&self.inner.sinks).insert(id, task);
        tracing::debug!("Attached {} ({})", id, label);
        id
    }

    /// Stop feeding a sink; its writer is dropped
    pub fn detach_sink(&self, id: SinkId) -> bool {
        match lock(&self.inner.sinks).remove(&id) {
            Some(task) => {
                task.abort();
                tracing::debug!("Detached {}", id);
                true
            }
            None => false,
        }
    }

    pub fn sink_count(&self) -> usize {
        lock(&self.inner.sinks).len()
    }
}

impl Feeder {
    /// Make `reader` the only source, dropping the previous one
    pub fn set_source(&self, tag: ProcessId, reader: PcmReader) {
        let pump = tokio::spawn(pump(
            tag,
            reader,
            self.inner.tx.clone(),
            self.inner.events.clone(),
        ));
        let previous = lock(&self.inner.source).replace(Source { tag, pump });
        if let Some(previous) = previous {
            tracing::debug!("Source {} replaced by {}", previous.tag, tag);
            previous.pump.abort();
        }
    }

    /// Detach the source; sinks stay attached and idle
    pub fn clear_source(&self) {
        if let Some(previous) = lock(&self.inner.source).take() {
            tracing::debug!("Source {} detached", previous.tag);
            previous.pump.abort();
        }
    }

    /// Tag of the source currently feeding the duplicator
    pub fn source(&self) -> Option<ProcessId> {
        lock(&self.inner.source).as_ref().map(|s| s.tag)
    }
}

async fn pump(
    tag: ProcessId,
    mut reader: PcmReader,
    tx: broadcast::Sender<Bytes>,
    events: mpsc::UnboundedSender<DuplicatorEvent>,
) {
    let mut buf = BytesMut::with_capacity(CHUNK_BYTES);
    let mut flowing = false;

    loop {
        buf.reserve(CHUNK_BYTES);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let aligned = buf.len() - buf.len() % FRAME_BYTES;
                if aligned == 0 {
                    continue;
                }
                if !flowing {
                    flowing = true;
                    let _ = events.send(DuplicatorEvent::SourceFlowing(tag));
                }
                let chunk = buf.split_to(aligned).freeze();
                tracing::trace!("Source {} chunk of {} bytes", tag, chunk.len());
                // The discard receiver keeps at least one subscriber alive
                let _ = tx.send(chunk);
            }
            Err(e) => {
                tracing::debug!("Source {} read failed: {}", tag, e);
                break;
            }
        }
    }

    let _ = events.send(DuplicatorEvent::SourceEnded(tag));
}

async fn feed_sink(
    id: SinkId,
    label: String,
    mut rx: broadcast::Receiver<Bytes>,
    mut writer: PcmWriter,
    events: mpsc::UnboundedSender<DuplicatorEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(chunk) => {
                if let Err(e) = writer.write_all(&chunk).await {
                    tracing::warn!("Writing to {} failed: {}", label, e);
                    let _ = events.send(DuplicatorEvent::SinkFailed {
                        sink: id,
                        error: e.to_string(),
                    });
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("{} fell behind, skipped {} chunks", label, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    fn duplicator() -> (Duplicator, mpsc::UnboundedReceiver<DuplicatorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Duplicator::new(tx), rx)
    }

    async fn read_exact(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
            .await
            .expect("timed out waiting for audio")
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_every_sink_receives_the_stream() {
        let (dup, _events) = duplicator();
        let (a_in, mut a_out) = duplex(1024);
        let (b_in, mut b_out) = duplex(1024);
        dup.attach_sink("a", Box::new(a_in));
        dup.attach_sink("b", Box::new(b_in));

        let (mut src, src_out) = duplex(1024);
        dup.feeder().set_source(ProcessId(1), Box::new(src_out));
        src.write_all(b"LLRRllrr").await.unwrap();

        assert_eq!(read_exact(&mut a_out, 8).await, b"LLRRllrr");
        assert_eq!(read_exact(&mut b_out, 8).await, b"LLRRllrr");
    }

    #[tokio::test]
    async fn test_replacing_source_keeps_sinks_open() {
        let (dup, _events) = duplicator();
        let feeder = dup.feeder();
        let (sink_in, mut sink_out) = duplex(1024);
        dup.attach_sink("receiver", Box::new(sink_in));

        let (mut first, first_out) = duplex(1024);
        feeder.set_source(ProcessId(1), Box::new(first_out));
        first.write_all(b"AAAA").await.unwrap();
        assert_eq!(read_exact(&mut sink_out, 4).await, b"AAAA");

        let (mut second, second_out) = duplex(1024);
        feeder.set_source(ProcessId(2), Box::new(second_out));
        assert_eq!(feeder.source(), Some(ProcessId(2)));

        // The old source is no longer pumped
        let _ = first.write_all(b"XXXX").await;
        second.write_all(b"BBBB").await.unwrap();
        assert_eq!(read_exact(&mut sink_out, 4).await, b"BBBB");
        assert_eq!(dup.sink_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_frames_are_held_back() {
        let (dup, _events) = duplicator();
        let (sink_in, mut sink_out) = duplex(1024);
        dup.attach_sink("local", Box::new(sink_in));

        let (mut src, src_out) = duplex(1024);
        dup.feeder().set_source(ProcessId(1), Box::new(src_out));
        src.write_all(b"123456").await.unwrap();
        assert_eq!(read_exact(&mut sink_out, 4).await, b"1234");
        src.write_all(b"78").await.unwrap();
        assert_eq!(read_exact(&mut sink_out, 4).await, b"5678");
    }

    #[tokio::test]
    async fn test_source_events() {
        let (dup, mut events) = duplicator();
        let (mut src, src_out) = duplex(1024);
        dup.feeder().set_source(ProcessId(5), Box::new(src_out));

        src.write_all(b"abcdabcd").await.unwrap();
        drop(src);

        assert_eq!(events.recv().await, Some(DuplicatorEvent::SourceFlowing(ProcessId(5))));
        assert_eq!(events.recv().await, Some(DuplicatorEvent::SourceEnded(ProcessId(5))));
    }

    #[tokio::test]
    async fn test_pump_runs_without_sinks() {
        let (dup, mut events) = duplicator();
        let (mut src, src_out) = duplex(64);
        dup.feeder().set_source(ProcessId(3), Box::new(src_out));

        // Far more than the channel holds; only the discard sink consumes it
        let block = vec![0u8; 4096];
        for _ in 0..200 {
            src.write_all(&block).await.unwrap();
        }
        drop(src);

        assert_eq!(events.recv().await, Some(DuplicatorEvent::SourceFlowing(ProcessId(3))));
        assert_eq!(events.recv().await, Some(DuplicatorEvent::SourceEnded(ProcessId(3))));
    }

    #[tokio::test]
    async fn test_failed_write_is_reported() {
        let (dup, mut events) = duplicator();
        let (sink_in, sink_out) = duplex(64);
        drop(sink_out);
        let id = dup.attach_sink("gone", Box::new(sink_in));

        let (mut src, src_out) = duplex(64);
        dup.feeder().set_source(ProcessId(1), Box::new(src_out));
        src.write_all(b"abcd").await.unwrap();

        loop {
            match events.recv().await {
                Some(DuplicatorEvent::SinkFailed { sink, .. }) => {
                    assert_eq!(sink, id);
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_clear_and_detach() {
        let (dup, _events) = duplicator();
        let feeder = dup.feeder();
        let (_src, src_out) = duplex(64);
        feeder.set_source(ProcessId(9), Box::new(src_out));
        feeder.clear_source();
        assert_eq!(feeder.source(), None);

        let (sink_in, _sink_out) = duplex(64);
        let id = dup.attach_sink("x", Box::new(sink_in));
        assert!(dup.detach_sink(id));
        assert!(!dup.detach_sink(id));
        assert_eq!(dup.sink_count(), 0);
    }
}
