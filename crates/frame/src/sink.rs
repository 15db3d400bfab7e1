/// Callback fired when a sink that previously rejected an item regains
/// capacity. At most one waker is registered at a time; registering a new
/// one replaces the old.
pub type CapacityWaker = Box<dyn Fn() + Send + Sync>;

/// Non-blocking consumer of a frame stream.
///
/// `try_queue` either takes ownership of the item or hands it back when
/// the sink is at capacity. A producer that got the item back should
/// register interest through [`FrameSink::set_capacity_waker`] and retry
/// when woken rather than spin.
pub trait FrameSink<T>: Send + Sync {
    /// Offers an item to the sink. Returns the item on rejection; the sink
    /// takes ownership on success.
    fn try_queue(&self, item: T) -> Result<(), T>;

    fn set_capacity_waker(&self, waker: CapacityWaker);

    fn clear_capacity_waker(&self);
}
