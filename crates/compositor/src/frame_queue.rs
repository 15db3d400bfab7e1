use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use frame::{Frame, FrameFormat, Packet, PixelBuffer};
use parking_lot::Mutex;
use tracing::debug;

/// A frame whose resource is a CPU pixel buffer, produced by readback.
pub type BufferFrame = Frame<PixelBuffer>;

struct QueueState {
    /// Idle buffers ready for reuse.
    pool: VecDeque<PixelBuffer>,
    /// Buffers currently allocated, pooled or dequeued.
    allocated: usize,
    /// Fired once when a buffer is returned after a failed dequeue.
    wakeup: Option<Box<dyn FnOnce() + Send>>,
}

struct QueueInner {
    capacity: usize,
    state: Mutex<QueueState>,
    output: Mutex<Option<Sender<Packet<BufferFrame>>>>,
    eos_sent: AtomicBool,
    released: AtomicBool,
}

/// Bounded recycling queue for CPU frames.
///
/// A producer dequeues an idle buffer, fills it, stamps a timestamp, and
/// queues it downstream; the consumer releases the frame and the buffer
/// returns to the pool. At most `capacity` buffers exist at once, so a
/// slow consumer backpressures the producer through failed dequeues.
pub struct PooledFrameQueue {
    inner: Arc<QueueInner>,
}

impl PooledFrameQueue {
    pub const DEFAULT_CAPACITY: usize = 5;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 1, "frame queue capacity must be at least 1");
        Self {
            inner: Arc::new(QueueInner {
                capacity,
                state: Mutex::new(QueueState {
                    pool: VecDeque::new(),
                    allocated: 0,
                    wakeup: None,
                }),
                output: Mutex::new(None),
                eos_sent: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Connects the downstream channel. May be set once.
    pub fn set_output(&self, output: Sender<Packet<BufferFrame>>) {
        let mut slot = self.inner.output.lock();
        assert!(slot.is_none(), "output already set");
        *slot = Some(output);
    }

    /// Takes an idle buffer compatible with `format`, allocating one when
    /// under capacity. Returns `None` at capacity and arms `wakeup` to
    /// fire once a buffer comes back. Pooled buffers with a different
    /// format are dropped and replaced.
    pub fn dequeue(
        &self,
        format: &FrameFormat,
        wakeup: impl FnOnce() + Send + 'static,
    ) -> Option<BufferFrame> {
        assert!(
            !self.inner.released.load(Ordering::SeqCst),
            "dequeue after queue release"
        );
        let mut state = self.inner.state.lock();
        while let Some(buffer) = state.pool.pop_front() {
            if buffer.format() == format {
                drop(state);
                return Some(self.wrap(buffer));
            }
            // Stale format: drop the buffer and its capacity slot so a
            // matching one can be allocated below.
            state.allocated -= 1;
        }
        if state.allocated >= self.inner.capacity {
            state.wakeup = Some(Box::new(wakeup));
            return None;
        }
        state.allocated += 1;
        drop(state);
        debug!(?format, "allocated frame queue buffer");
        Some(self.wrap(PixelBuffer::new(*format)))
    }

    /// Publishes a filled frame downstream. The frame keeps its pool
    /// releaser, so the consumer hands the buffer back by releasing the
    /// frame.
    pub fn queue(&self, frame: BufferFrame) {
        assert!(
            !self.inner.eos_sent.load(Ordering::SeqCst),
            "frame queued after end of stream"
        );
        let output = self.inner.output.lock();
        let sender = output.as_ref().expect("output not set");
        let _ = sender.send(Packet::Payload(frame));
    }

    /// Sends the end-of-stream marker downstream, at most once.
    pub fn signal_end_of_stream(&self) {
        if self.inner.eos_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sender) = self.inner.output.lock().as_ref() {
            let _ = sender.send(Packet::EndOfStream);
        }
    }

    /// Drops pooled buffers and stops reclaiming outstanding ones; frames
    /// still held by the consumer just free their buffers on release.
    pub fn release(&self) {
        self.inner.released.store(true, Ordering::SeqCst);
        let mut state = self.inner.state.lock();
        state.pool.clear();
        state.allocated = 0;
        state.wakeup = None;
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn pooled_count(&self) -> usize {
        self.inner.state.lock().pool.len()
    }

    fn wrap(&self, buffer: PixelBuffer) -> BufferFrame {
        let inner = Arc::downgrade(&self.inner);
        let format = *buffer.format();
        Frame::new(buffer, format, 0, move |buffer| {
            let Some(inner) = inner.upgrade() else { return };
            if inner.released.load(Ordering::SeqCst) {
                return;
            }
            let wakeup = {
                let mut state = inner.state.lock();
                state.pool.push_back(buffer);
                state.wakeup.take()
            };
            // Fired outside the lock; the callback may dequeue again.
            if let Some(wakeup) = wakeup {
                wakeup();
            }
        })
    }
}

impl Default for PooledFrameQueue {
    fn default() -> Self {
        Self::new()
    }
}
