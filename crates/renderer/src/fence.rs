use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use frame::Fence;

use crate::GpuContext;

/// Completion fence for a batch of submitted GPU work.
///
/// Signals once the queue reports all work submitted before the fence was
/// created as done. Waiting pumps the device so progress is made even
/// when no other thread polls it.
pub struct GpuFence {
    ctx: Arc<GpuContext>,
    done: Receiver<()>,
    signaled: AtomicBool,
}

impl GpuFence {
    /// Must be called after the submission it guards.
    pub fn after_submission(ctx: Arc<GpuContext>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        ctx.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        Self {
            ctx,
            done: rx,
            signaled: AtomicBool::new(false),
        }
    }
}

impl Fence for GpuFence {
    fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.signaled.load(Ordering::Acquire) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            match self.done.try_recv() {
                Ok(()) => {
                    self.signaled.store(true, Ordering::Release);
                    return true;
                }
                // The callback sender is dropped once fired; a disconnect
                // without a message means the queue itself went away, and
                // there is nothing left to wait for.
                Err(TryRecvError::Disconnected) => {
                    self.signaled.store(true, Ordering::Release);
                    return true;
                }
                Err(TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    self.ctx.device.poll(wgpu::Maintain::Poll);
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}
