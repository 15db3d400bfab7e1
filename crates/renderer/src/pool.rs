use std::sync::Arc;
use std::thread::ThreadId;

use frame::PipelineError;

/// Handle to a pool slot, returned by [`TexturePool::acquire`] and handed
/// back through [`TexturePool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(usize);

struct Slot<T> {
    texture: Arc<T>,
    in_use: bool,
    /// Presentation time the slot was last acquired for, for tracing.
    last_used_us: Option<i64>,
}

/// Fixed-capacity pool of render targets.
///
/// The pool is confined to the GPU worker thread; the resource type is
/// generic so pool behavior can be tested with a counting allocator and
/// no device. Acquire and release preconditions are caller bugs and
/// panic rather than returning errors.
pub struct TexturePool<T> {
    slots: Vec<Slot<T>>,
    capacity: usize,
    size: Option<(u32, u32)>,
    owner: Option<ThreadId>,
}

impl<T> TexturePool<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "texture pool capacity must be at least 1");
        Self {
            slots: Vec::new(),
            capacity,
            size: None,
            owner: None,
        }
    }

    /// Allocates all slots at the given size, or does nothing when the
    /// pool is already configured for it. Reconfiguring to a different
    /// size drops every texture and requires that none is in use.
    pub fn ensure_configured(
        &mut self,
        allocator: &mut dyn FnMut(u32, u32) -> Result<T, PipelineError>,
        width: u32,
        height: u32,
    ) -> Result<(), PipelineError> {
        self.check_owner();
        if self.size == Some((width, height)) {
            return Ok(());
        }
        assert_eq!(
            self.in_use_count(),
            0,
            "cannot reconfigure a texture pool with textures in use"
        );
        self.slots.clear();
        for _ in 0..self.capacity {
            self.slots.push(Slot {
                texture: Arc::new(allocator(width, height)?),
                in_use: false,
                last_used_us: None,
            });
        }
        self.size = Some((width, height));
        Ok(())
    }

    /// Takes a free slot, tagging it with the presentation time it will
    /// hold. Panics when unconfigured or when every slot is in use; the
    /// caller is expected to check [`TexturePool::free_count`] first.
    pub fn acquire(&mut self, presentation_time_us: i64) -> (SlotId, Arc<T>) {
        self.check_owner();
        assert!(self.size.is_some(), "texture pool is not configured");
        let index = self
            .slots
            .iter()
            .position(|slot| !slot.in_use)
            .unwrap_or_else(|| panic!("no free texture in pool of {}", self.capacity));
        let slot = &mut self.slots[index];
        slot.in_use = true;
        slot.last_used_us = Some(presentation_time_us);
        (SlotId(index), Arc::clone(&slot.texture))
    }

    /// Returns a slot to the pool. Panics on double release.
    pub fn release(&mut self, slot: SlotId) {
        self.check_owner();
        let slot = &mut self.slots[slot.0];
        assert!(slot.in_use, "texture slot released twice");
        slot.in_use = false;
    }

    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.in_use).count()
    }

    pub fn in_use_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_use).count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_configured(&self) -> bool {
        self.size.is_some()
    }

    /// Drops all textures and returns the pool to its unconfigured state.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.size = None;
    }

    fn check_owner(&mut self) {
        let current = std::thread::current().id();
        match self.owner {
            None => self.owner = Some(current),
            Some(owner) => debug_assert_eq!(
                owner, current,
                "texture pool touched from a different thread"
            ),
        }
    }
}
