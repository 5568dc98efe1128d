//! Per-tunnel outbound frame queue.
//!
//! All Mux frames leave through this FIFO. Dequeue advances a head index
//! instead of shifting the vector, and the buffer compacts once the head
//! passes a threshold. A push beyond the soft cap fails — that is the
//! back-pressure signal, and the caller drops the frame.

use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

/// Enqueue fails once this many frames are waiting.
pub const SOFT_CAP: usize = 100;

/// Head index at which the consumed prefix of the buffer is reclaimed.
const COMPACT_THRESHOLD: usize = 32;

struct Inner {
    items: Vec<Bytes>,
    head: usize,
    closed: bool,
}

pub struct WriteQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                head: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a frame. Returns false when the queue is closed or over the
    /// soft cap; the frame is dropped in that case.
    pub fn push(&self, frame: Bytes) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed || inner.items.len() - inner.head >= SOFT_CAP {
                return false;
            }
            inner.items.push(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Dequeue the oldest frame, if any.
    pub fn pop(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock().unwrap();
        if inner.head >= inner.items.len() {
            return None;
        }
        let head = inner.head;
        let frame = std::mem::take(&mut inner.items[head]);
        inner.head += 1;
        if inner.head >= COMPACT_THRESHOLD {
            let head = inner.head;
            inner.items.drain(..head);
            inner.head = 0;
        }
        Some(frame)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.items.len() - inner.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue: further pushes fail and the pump drains then exits.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Wait until a push or close wakes the pump.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}
