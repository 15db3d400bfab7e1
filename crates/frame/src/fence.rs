use std::time::Duration;

/// Synchronization point published alongside a composited frame. The
/// consumer waits on it before sampling the frame's texture.
pub trait Fence: Send + Sync {
    /// Blocks until the fence signals or `timeout` elapses. Returns whether
    /// the fence signaled. A zero timeout polls.
    fn wait_timeout(&self, timeout: Duration) -> bool;

    fn is_signaled(&self) -> bool {
        self.wait_timeout(Duration::ZERO)
    }
}

pub type BoxFence = Box<dyn Fence>;

/// A fence that is already signaled, for producers whose work completes
/// synchronously.
#[derive(Debug, Default)]
pub struct SignaledFence;

impl Fence for SignaledFence {
    fn wait_timeout(&self, _timeout: Duration) -> bool {
        true
    }
}
