use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use frame::{BoxFence, FrameFormat, OverlaySettings, PipelineError};
use gpu_tasks::TaskExecutor;
use parking_lot::Mutex;
use renderer::{SlotId, TexturePool};
use tracing::debug;

use crate::blender::{BlendLayer, LayerBlender};
use crate::select::{
    release_excess_in_all_secondary, release_excess_in_secondary, select_frames, InputSource,
    QueuedFrame, SourceSet,
};

/// Events delivered on the compositor's output channel, in order.
/// `Ended` is sent exactly once, after the last `Frame`.
pub enum CompositorOutput<T> {
    Frame {
        texture: Arc<T>,
        presentation_time_us: i64,
        /// Signals when the texture's contents are ready to sample.
        fence: BoxFence,
    },
    Ended,
    Error(PipelineError),
}

/// Returns an input frame to its producer once the compositor is done
/// with it, identified by presentation time.
#[derive(Clone)]
pub struct FrameReleaser(Arc<dyn Fn(i64) + Send + Sync>);

impl FrameReleaser {
    pub fn new(callback: impl Fn(i64) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn release(&self, presentation_time_us: i64) {
        (self.0)(presentation_time_us)
    }
}

/// Supplies per-frame overlay placement and the output size.
pub trait CompositeSettingsProvider: Send + Sync {
    fn overlay_settings(&self, input_index: usize, presentation_time_us: i64) -> OverlaySettings {
        let _ = (input_index, presentation_time_us);
        OverlaySettings::default()
    }

    /// Output dimensions given the selected layer sizes, primary first.
    /// Defaults to the primary layer's size.
    fn output_size(&self, input_sizes: &[(u32, u32)]) -> (u32, u32) {
        input_sizes[0]
    }
}

/// Identity placement, output sized to the primary stream.
pub struct DefaultCompositeSettings;

impl CompositeSettingsProvider for DefaultCompositeSettings {}

struct GpuSide<B: LayerBlender> {
    blender: B,
    pool: TexturePool<B::Texture>,
    /// Output slots handed to the consumer, oldest first.
    in_flight: VecDeque<(SlotId, i64)>,
}

struct Shared<B: LayerBlender> {
    sources: Mutex<SourceSet<B::Texture>>,
    gpu: Mutex<GpuSide<B>>,
    output: Sender<CompositorOutput<B::Texture>>,
    settings: Box<dyn CompositeSettingsProvider>,
    executor: TaskExecutor,
}

/// Merges frames from registered sources into a single output stream.
///
/// The first registered source is the primary: its timestamps pace the
/// output, one composite per primary frame, in order. Producer-facing
/// calls are non-blocking; GPU work runs on the compositor's own
/// executor thread and failures arrive as [`CompositorOutput::Error`].
pub struct Compositor<B: LayerBlender> {
    shared: Arc<Shared<B>>,
}

impl<B: LayerBlender> Compositor<B> {
    /// `output_pool_capacity` bounds how many composited textures can be
    /// pending with the consumer at once; compositing pauses when the
    /// pool is exhausted and resumes on [`Compositor::release_output_texture`].
    pub fn new(
        blender: B,
        settings: Box<dyn CompositeSettingsProvider>,
        output_pool_capacity: usize,
    ) -> (Self, Receiver<CompositorOutput<B::Texture>>) {
        let (output, receiver) = crossbeam_channel::unbounded();
        let error_output = output.clone();
        let executor = TaskExecutor::new("compositor", move |error| {
            let _ = error_output.send(CompositorOutput::Error(error));
        });
        let shared = Arc::new(Shared {
            sources: Mutex::new(SourceSet::new()),
            gpu: Mutex::new(GpuSide {
                blender,
                pool: TexturePool::new(output_pool_capacity),
                in_flight: VecDeque::new(),
            }),
            output,
            settings,
            executor,
        });
        (Self { shared }, receiver)
    }

    /// Registers a source under a caller-chosen index. The first
    /// registration becomes the primary source.
    pub fn register_source(&self, index: usize) {
        let mut sources = self.shared.sources.lock();
        assert!(
            !sources.sources.contains_key(&index),
            "source {index} already registered"
        );
        sources.sources.insert(index, InputSource::new());
        if sources.primary.is_none() {
            sources.primary = Some(index);
        }
    }

    /// Queues a frame from source `index`. Timestamps must be
    /// non-decreasing within a source, and every source must carry the
    /// same color configuration; SDR only.
    pub fn queue_input_texture(
        &self,
        index: usize,
        texture: Arc<B::Texture>,
        format: FrameFormat,
        presentation_time_us: i64,
        releaser: FrameReleaser,
    ) {
        assert!(
            !format.color.is_hdr(),
            "HDR input is not supported"
        );
        let mut sources = self.shared.sources.lock();
        match sources.color {
            None => sources.color = Some(format.color),
            Some(color) => assert_eq!(
                color, format.color,
                "mixing color configurations is not supported"
            ),
        }
        let settings = self
            .shared
            .settings
            .overlay_settings(index, presentation_time_us);
        let primary_index = sources.primary.expect("no source registered");
        let source = sources
            .sources
            .get_mut(&index)
            .unwrap_or_else(|| panic!("source {index} not registered"));
        assert!(!source.ended, "frame queued after end of input");
        if let Some(last) = source.frames.back() {
            assert!(
                last.presentation_time_us <= presentation_time_us,
                "timestamps must be non-decreasing within a source"
            );
        }
        source.frames.push_back(QueuedFrame {
            texture,
            size: format.size(),
            presentation_time_us,
            settings,
            releaser,
        });
        if index == primary_index {
            release_excess_in_all_secondary(&mut sources);
        } else {
            release_excess_in_secondary(&mut sources, index);
        }
        drop(sources);
        self.submit_maybe_composite();
    }

    /// Marks source `index` as ended. Once every source has ended and the
    /// primary queue drains, `Ended` is emitted exactly once.
    pub fn signal_end_of_input(&self, index: usize) {
        let mut sources = self.shared.sources.lock();
        let primary_index = sources.primary.expect("no source registered");
        let source = sources
            .sources
            .get_mut(&index)
            .unwrap_or_else(|| panic!("source {index} not registered"));
        assert!(!source.ended, "end of input signaled twice");
        source.ended = true;

        if sources.sources[&primary_index].frames.is_empty() {
            if index == primary_index {
                release_excess_in_all_secondary(&mut sources);
            }
            if sources.all_ended() && !sources.ended_sent {
                sources.ended_sent = true;
                drop(sources);
                let _ = self.shared.output.send(CompositorOutput::Ended);
                return;
            }
        } else if index != primary_index && sources.sources[&index].frames.len() == 1 {
            // The pending composite may have been holding back on this
            // stream's look-ahead.
            drop(sources);
            self.submit_maybe_composite();
        }
    }

    /// Returns an output texture to the pool once the consumer is done
    /// sampling it. Textures must be returned in presentation order.
    pub fn release_output_texture(&self, presentation_time_us: i64) {
        let shared = Arc::clone(&self.shared);
        self.shared.executor.submit(move || {
            {
                let mut gpu = shared.gpu.lock();
                while let Some(&(slot, time_us)) = gpu.in_flight.front() {
                    if time_us > presentation_time_us {
                        break;
                    }
                    gpu.pool.release(slot);
                    gpu.in_flight.pop_front();
                }
            }
            maybe_composite(&shared)
        });
    }

    /// Releases GPU state and returns any queued input frames to their
    /// producers. Blocks up to `timeout`; on timeout the error listener
    /// output carries a report and teardown continues in the background.
    pub fn release(&self, timeout: Duration) {
        let shared = Arc::clone(&self.shared);
        self.shared.executor.release(
            move || {
                {
                    let mut gpu = shared.gpu.lock();
                    gpu.in_flight.clear();
                    gpu.pool.clear();
                }
                let mut sources = shared.sources.lock();
                for source in sources.sources.values_mut() {
                    while let Some(frame) = source.frames.pop_front() {
                        frame.releaser.release(frame.presentation_time_us);
                    }
                }
                Ok(())
            },
            timeout,
        );
    }

    fn submit_maybe_composite(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.executor.submit(move || maybe_composite(&shared));
    }
}

/// Runs on the executor thread. Composites at most one output per call;
/// every queue, end-of-input, and texture-release event schedules one.
fn maybe_composite<B: LayerBlender>(shared: &Arc<Shared<B>>) -> Result<(), PipelineError> {
    let mut gpu = shared.gpu.lock();

    if let Some(event) = drained_event(shared) {
        drop(gpu);
        let _ = shared.output.send(event);
        return Ok(());
    }

    if gpu.pool.is_configured() && gpu.pool.free_count() == 0 {
        // Retried when the consumer releases an output texture.
        return Ok(());
    }

    let selected = {
        let sources = shared.sources.lock();
        match select_frames(&sources) {
            Some(selected) => selected,
            None => return Ok(()),
        }
    };
    let sizes: Vec<(u32, u32)> = selected.iter().map(|layer| layer.size).collect();
    let (out_width, out_height) = shared.settings.output_size(&sizes);
    let output_time_us = selected[0].presentation_time_us;

    let GpuSide {
        blender,
        pool,
        in_flight,
    } = &mut *gpu;
    pool.ensure_configured(&mut |w, h| blender.allocate(w, h), out_width, out_height)?;
    let (slot, texture) = pool.acquire(output_time_us);
    let layers: Vec<BlendLayer<'_, B::Texture>> = selected
        .iter()
        .map(|layer| BlendLayer {
            texture: &*layer.texture,
            size: layer.size,
            presentation_time_us: layer.presentation_time_us,
            settings: layer.settings,
        })
        .collect();
    let fence = match blender.draw(&layers, &texture) {
        Ok(fence) => fence,
        Err(error) => {
            pool.release(slot);
            return Err(error);
        }
    };
    in_flight.push_back((slot, output_time_us));
    debug!(
        presentation_time_us = output_time_us,
        layers = layers.len(),
        "composited output frame"
    );
    let _ = shared.output.send(CompositorOutput::Frame {
        texture,
        presentation_time_us: output_time_us,
        fence,
    });
    drop(gpu);

    {
        let mut sources = shared.sources.lock();
        let primary_index = sources.primary.expect("no source registered");
        if let Some(primary) = sources.sources.get_mut(&primary_index) {
            if let Some(frame) = primary.frames.pop_front() {
                frame.releaser.release(frame.presentation_time_us);
            }
        }
        release_excess_in_all_secondary(&mut sources);
    }
    if let Some(event) = drained_event(shared) {
        let _ = shared.output.send(event);
    }
    Ok(())
}

/// When the stream is fully drained, consumes the end-of-stream latch
/// and returns the `Ended` event to send. Releases any secondary
/// leftovers as a side effect.
fn drained_event<B: LayerBlender>(shared: &Shared<B>) -> Option<CompositorOutput<B::Texture>> {
    let mut sources = shared.sources.lock();
    if sources.primary.is_none() || !sources.drained() {
        return None;
    }
    release_excess_in_all_secondary(&mut sources);
    if sources.ended_sent {
        return None;
    }
    sources.ended_sent = true;
    Some(CompositorOutput::Ended)
}
