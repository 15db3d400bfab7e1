//! Frame bookkeeping and selection for the compositor.
//!
//! These functions operate on plain data guarded by the compositor's
//! source lock, so the pairing and eviction rules are testable without
//! an executor or a device.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use frame::{ColorInfo, OverlaySettings};

use crate::compositor::FrameReleaser;

pub(crate) struct QueuedFrame<T> {
    pub texture: Arc<T>,
    pub size: (u32, u32),
    pub presentation_time_us: i64,
    pub settings: OverlaySettings,
    pub releaser: FrameReleaser,
}

impl<T> QueuedFrame<T> {
    fn release(self) {
        self.releaser.release(self.presentation_time_us);
    }
}

pub(crate) struct InputSource<T> {
    pub frames: VecDeque<QueuedFrame<T>>,
    pub ended: bool,
}

impl<T> InputSource<T> {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
            ended: false,
        }
    }
}

/// All registered sources plus the stream-level state shared with them.
pub(crate) struct SourceSet<T> {
    pub sources: BTreeMap<usize, InputSource<T>>,
    pub primary: Option<usize>,
    pub color: Option<ColorInfo>,
    pub ended_sent: bool,
}

impl<T> SourceSet<T> {
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
            primary: None,
            color: None,
            ended_sent: false,
        }
    }

    pub fn all_ended(&self) -> bool {
        !self.sources.is_empty() && self.sources.values().all(|source| source.ended)
    }

    pub fn primary_source(&self) -> &InputSource<T> {
        let index = self.primary.expect("no primary source registered");
        self.sources
            .get(&index)
            .expect("primary source not registered")
    }

    /// Whether the stream is fully drained: everything ended and no
    /// primary frame left to pace an output.
    pub fn drained(&self) -> bool {
        self.all_ended() && self.primary_source().frames.is_empty()
    }
}

/// A frame chosen to participate in one composite.
pub(crate) struct SelectedLayer<T> {
    pub texture: Arc<T>,
    pub size: (u32, u32),
    pub presentation_time_us: i64,
    pub settings: OverlaySettings,
}

/// Picks the frames for the next output, primary first, or `None` when
/// some source cannot yet contribute.
///
/// The output timestamp is the primary frame's. Each secondary stream
/// contributes its queued frame closest to that timestamp, with the
/// earlier frame winning a distance tie. A secondary stream with a single
/// queued frame holds the composite back until a second frame or its end
/// of stream proves that frame is the closest.
pub(crate) fn select_frames<T>(set: &SourceSet<T>) -> Option<Vec<SelectedLayer<T>>> {
    let primary_index = set.primary?;
    let primary_frame = set.sources.get(&primary_index)?.frames.front()?;
    let primary_time = primary_frame.presentation_time_us;

    let mut layers = Vec::with_capacity(set.sources.len());
    layers.push(to_layer(primary_frame));
    for (&index, source) in &set.sources {
        if index == primary_index {
            continue;
        }
        if source.frames.is_empty() {
            return None;
        }
        if source.frames.len() == 1 && !source.ended {
            return None;
        }
        let mut best: Option<&QueuedFrame<T>> = None;
        let mut best_distance = i64::MAX;
        for candidate in &source.frames {
            let distance = (candidate.presentation_time_us - primary_time).abs();
            if distance < best_distance {
                best_distance = distance;
                best = Some(candidate);
            }
        }
        layers.push(to_layer(best?));
    }
    Some(layers)
}

fn to_layer<T>(frame: &QueuedFrame<T>) -> SelectedLayer<T> {
    SelectedLayer {
        texture: Arc::clone(&frame.texture),
        size: frame.size,
        presentation_time_us: frame.presentation_time_us,
        settings: frame.settings,
    }
}

/// Releases queued secondary frames that can no longer be selected.
///
/// When the primary stream is drained, every pending secondary frame is
/// released. Otherwise a frame is released while its successor is still
/// no later than the next primary timestamp, keeping at least one frame
/// so the stream always has a candidate.
pub(crate) fn release_excess_in_secondary<T>(set: &mut SourceSet<T>, index: usize) {
    let primary_index = set.primary.expect("no primary source registered");
    if index == primary_index {
        return;
    }
    let count = {
        let primary = set
            .sources
            .get(&primary_index)
            .expect("primary source not registered");
        let Some(secondary) = set.sources.get(&index) else {
            return;
        };
        if primary.frames.is_empty() && primary.ended {
            secondary.frames.len()
        } else if let Some(next_primary) = primary.frames.front() {
            let next_primary_time = next_primary.presentation_time_us;
            let mut count = 0;
            for i in 0..secondary.frames.len().saturating_sub(1) {
                if secondary.frames[i + 1].presentation_time_us <= next_primary_time {
                    count += 1;
                } else {
                    break;
                }
            }
            count
        } else {
            0
        }
    };
    let secondary = set
        .sources
        .get_mut(&index)
        .expect("secondary source not registered");
    for _ in 0..count {
        if let Some(frame) = secondary.frames.pop_front() {
            frame.release();
        }
    }
}

pub(crate) fn release_excess_in_all_secondary<T>(set: &mut SourceSet<T>) {
    let indices: Vec<usize> = set.sources.keys().copied().collect();
    for index in indices {
        release_excess_in_secondary(set, index);
    }
}
