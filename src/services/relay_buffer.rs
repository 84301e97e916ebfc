//! Per-client relay buffering
//!
//! Every attached client owns a bounded queue filled by the session's upstream
//! loop. Pushing is a short synchronous critical section; when the queue is full
//! the oldest chunk is discarded, so a stalled reader only loses its own data
//! and never holds up the session or other clients.

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::Notify;

use crate::models::relay::EndReason;

#[derive(Debug, Default)]
struct BufferInner {
    queue: VecDeque<Bytes>,
    end: Option<EndReason>,
}

/// Bounded single-reader chunk queue with drop-oldest overflow
#[derive(Debug)]
pub struct ClientBuffer {
    inner: Mutex<BufferInner>,
    notify: Notify,
    capacity: usize,
    bytes_delivered: AtomicU64,
    chunks_dropped: AtomicU64,
}

impl ClientBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            bytes_delivered: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
        }
    }

    /// Queue a chunk. Returns `true` when an older chunk had to be dropped.
    /// Chunks pushed after close are ignored.
    pub fn push(&self, chunk: Bytes) -> bool {
        let dropped = {
            let mut inner = self.inner.lock();
            if inner.end.is_some() {
                return false;
            }
            let dropped = if inner.queue.len() >= self.capacity {
                inner.queue.pop_front();
                true
            } else {
                false
            };
            inner.queue.push_back(chunk);
            dropped
        };
        if dropped {
            self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    /// End the stream. Queued chunks are still delivered unless the client was
    /// removed. The first reason wins.
    pub fn close(&self, reason: EndReason) {
        {
            let mut inner = self.inner.lock();
            if inner.end.is_some() {
                return;
            }
            if reason == EndReason::Removed {
                inner.queue.clear();
            }
            inner.end = Some(reason);
        }
        self.notify.notify_one();
    }

    /// Next chunk, or `None` once the buffer is closed and empty
    pub async fn next_chunk(&self) -> Option<Bytes> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(chunk) = inner.queue.pop_front() {
                    self.bytes_delivered
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    return Some(chunk);
                }
                if inner.end.is_some() {
                    return None;
                }
            }
            // notify_one stores a permit when nobody is waiting, so a push
            // between the unlock above and this await is not lost
            self.notify.notified().await;
        }
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.inner.lock().end.clone()
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered.load(Ordering::Relaxed)
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }
}

/// Runs once when a byte stream is dropped
pub(crate) struct DetachGuard(Option<Box<dyn FnOnce() + Send>>);

impl DetachGuard {
    pub(crate) fn new(on_detach: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(on_detach)))
    }
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        if let Some(on_detach) = self.0.take() {
            on_detach();
        }
    }
}

/// A client's view of a relay session.
///
/// Yields upstream bytes in order until the client is removed or the session
/// ends, then `None`; [`RelayByteStream::end_reason`] tells which. Dropping the
/// stream detaches the client from its session.
pub struct RelayByteStream {
    inner: Pin<Box<dyn Stream<Item = Bytes> + Send>>,
    buffer: Arc<ClientBuffer>,
    _detach: DetachGuard,
}

impl RelayByteStream {
    pub(crate) fn new(buffer: Arc<ClientBuffer>, detach: DetachGuard) -> Self {
        let reader = buffer.clone();
        let inner = async_stream::stream! {
            while let Some(chunk) = reader.next_chunk().await {
                yield chunk;
            }
        };
        Self {
            inner: Box::pin(inner),
            buffer,
            _detach: detach,
        }
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.buffer.end_reason()
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.buffer.chunks_dropped()
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.buffer.bytes_delivered()
    }
}

impl Stream for RelayByteStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for RelayByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayByteStream")
            .field("queued", &self.buffer.queued())
            .field("end_reason", &self.buffer.end_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_drop_oldest_on_overflow() {
        let buffer = ClientBuffer::new(2);
        assert!(!buffer.push(Bytes::from_static(b"a")));
        assert!(!buffer.push(Bytes::from_static(b"b")));
        assert!(buffer.push(Bytes::from_static(b"c")));
        assert_eq!(buffer.queued(), 2);
        assert_eq!(buffer.chunks_dropped(), 1);
    }

    #[tokio::test]
    async fn test_order_preserved_and_close_drains() {
        let buffer = ClientBuffer::new(8);
        buffer.push(Bytes::from_static(b"1"));
        buffer.push(Bytes::from_static(b"2"));
        buffer.close(EndReason::SessionStopped);
        buffer.push(Bytes::from_static(b"ignored"));

        assert_eq!(buffer.next_chunk().await, Some(Bytes::from_static(b"1")));
        assert_eq!(buffer.next_chunk().await, Some(Bytes::from_static(b"2")));
        assert_eq!(buffer.next_chunk().await, None);
        assert_eq!(buffer.bytes_delivered(), 2);
    }

    #[tokio::test]
    async fn test_removed_discards_queue() {
        let buffer = ClientBuffer::new(8);
        buffer.push(Bytes::from_static(b"1"));
        buffer.close(EndReason::Removed);
        buffer.close(EndReason::SessionStopped);
        assert_eq!(buffer.next_chunk().await, None);
        assert_eq!(buffer.end_reason(), Some(EndReason::Removed));
    }

    #[tokio::test]
    async fn test_waiting_reader_is_woken() {
        let buffer = Arc::new(ClientBuffer::new(4));
        let reader = buffer.clone();
        let task = tokio::spawn(async move { reader.next_chunk().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.push(Bytes::from_static(b"late"));
        let got = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_stream_detaches_on_drop() {
        let detached = Arc::new(AtomicBool::new(false));
        let flag = detached.clone();
        let buffer = Arc::new(ClientBuffer::new(4));
        buffer.push(Bytes::from_static(b"x"));

        let mut stream = RelayByteStream::new(
            buffer.clone(),
            DetachGuard::new(move || flag.store(true, Ordering::SeqCst)),
        );
        assert_eq!(stream.next().await, Some(Bytes::from_static(b"x")));
        assert!(!detached.load(Ordering::SeqCst));
        drop(stream);
        assert!(detached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_next_chunk_pending_until_push() {
        let buffer = ClientBuffer::new(2);
        let mut next = tokio_test::task::spawn(buffer.next_chunk());
        tokio_test::assert_pending!(next.poll());

        buffer.push(Bytes::from_static(b"a"));
        assert!(next.is_woken());
        assert_eq!(
            tokio_test::assert_ready!(next.poll()),
            Some(Bytes::from_static(b"a"))
        );
    }
}
