//! Bounded hand-off queue between the capture context and the transport.
//!
//! The capture side must never wait on the network. When the transport
//! falls behind and the queue is full, the oldest queued frame is dropped
//! to make room (the newest audio is the most useful to a live
//! conversation). Frames that do get through always keep capture order.

use crate::pipeline::messages::AudioFrame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::warn;

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; the frame with this sequence number was discarded.
    DroppedOldest(u64),
    /// The consumer is gone; the frame was discarded.
    Closed,
}

struct Inner {
    frames: VecDeque<AudioFrame>,
    closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Producer half, owned by the capture pipeline.
pub struct FrameQueueSender {
    shared: Arc<Shared>,
}

/// Consumer half, owned by the frame forwarder.
pub struct FrameQueueReceiver {
    shared: Arc<Shared>,
}

/// Create a queue holding at most `capacity` frames (minimum 1).
pub fn frame_queue(capacity: usize) -> (FrameQueueSender, FrameQueueReceiver) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            frames: VecDeque::with_capacity(capacity.max(1)),
            closed: false,
        }),
        notify: Notify::new(),
        capacity: capacity.max(1),
        dropped: AtomicU64::new(0),
    });
    (
        FrameQueueSender {
            shared: Arc::clone(&shared),
        },
        FrameQueueReceiver { shared },
    )
}

impl FrameQueueSender {
    /// Queue a frame without waiting. Drops the oldest frame when full.
    pub fn push(&self, frame: AudioFrame) -> PushOutcome {
        let outcome = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            let outcome = if inner.frames.len() >= self.shared.capacity {
                match inner.frames.pop_front() {
                    Some(old) => PushOutcome::DroppedOldest(old.seq),
                    None => PushOutcome::Queued,
                }
            } else {
                PushOutcome::Queued
            };
            inner.frames.push_back(frame);
            outcome
        };

        if let PushOutcome::DroppedOldest(seq) = outcome {
            let total = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(seq, total, "transport behind, dropped oldest capture frame");
        }
        self.shared.notify.notify_one();
        outcome
    }

    /// Total frames dropped on overflow so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for FrameQueueSender {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl FrameQueueReceiver {
    /// Wait for the next frame. Returns `None` once the sender is gone and
    /// every queued frame has been taken.
    pub async fn pop(&self) -> Option<AudioFrame> {
        loop {
            {
                let mut inner = self.shared.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            // notify_one stores a permit when nobody is waiting, so a push
            // between the check above and this await is not lost.
            self.shared.notify.notified().await;
        }
    }

    /// Total frames dropped on overflow so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for FrameQueueReceiver {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
    }
}
