use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use frame::{CapacityWaker, Frame, FrameSink, Packet, PipelineError};
use gpu_tasks::TaskExecutor;
use parking_lot::Mutex;
use tracing::debug;

/// A single-input, single-output frame transformation running on the
/// pipeline's executor thread. Implementations own their GPU objects and
/// are only ever called from that thread.
pub trait ShaderStage: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Produces the output frame for `input`. The returned frame carries
    /// the stage's output format; the processor preserves the input's
    /// timestamp and metadata around it.
    fn process(&mut self, input: &Frame<Self::Input>)
        -> Result<Frame<Self::Output>, PipelineError>;

    /// Discards any internal state tied to in-flight frames.
    fn flush(&mut self) {}

    /// Frees the stage's resources; the stage is never called again.
    fn release(&mut self) {}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Gate {
    Idle,
    Processing,
}

struct Forwarding<O> {
    /// Processed packets not yet accepted downstream, oldest first.
    pending: VecDeque<Packet<Frame<O>>>,
    downstream: Option<Arc<dyn FrameSink<Packet<Frame<O>>>>>,
}

struct StageShared<S: ShaderStage> {
    executor: TaskExecutor,
    /// Input capacity: exactly one frame may be in flight.
    gate: Mutex<Gate>,
    stage: Mutex<S>,
    forwarding: Mutex<Forwarding<S::Output>>,
    input_waker: Mutex<Option<CapacityWaker>>,
    released: AtomicBool,
    /// Bumped by flush; a queued processing task whose captured value is
    /// stale releases its frame instead of running the stage.
    flush_generation: AtomicU64,
}

/// Drives a [`ShaderStage`]: accepts at most one frame at a time on its
/// input sink, runs the stage on the executor thread, and forwards
/// outputs downstream as capacity allows. End-of-stream propagates after
/// the last processed frame.
pub struct StageProcessor<S: ShaderStage> {
    shared: Arc<StageShared<S>>,
    input: Arc<StageInput<S>>,
}

/// The input side of a [`StageProcessor`], usable as a [`FrameSink`].
pub struct StageInput<S: ShaderStage> {
    shared: Arc<StageShared<S>>,
}

impl<S: ShaderStage> StageProcessor<S> {
    pub fn new(stage: S, executor: TaskExecutor) -> Self {
        let shared = Arc::new(StageShared {
            executor,
            gate: Mutex::new(Gate::Idle),
            stage: Mutex::new(stage),
            forwarding: Mutex::new(Forwarding {
                pending: VecDeque::new(),
                downstream: None,
            }),
            input_waker: Mutex::new(None),
            released: AtomicBool::new(false),
            flush_generation: AtomicU64::new(0),
        });
        let input = Arc::new(StageInput {
            shared: Arc::clone(&shared),
        });
        Self { shared, input }
    }

    pub fn input(&self) -> Arc<StageInput<S>> {
        Arc::clone(&self.input)
    }

    /// Connects the downstream sink, registering a capacity waker so
    /// pending outputs are retried when it frees up. Replaces any
    /// previous sink.
    pub fn set_output(&self, sink: Arc<dyn FrameSink<Packet<Frame<S::Output>>>>) {
        let shared = Arc::clone(&self.shared);
        self.shared.executor.submit(move || {
            {
                let mut forwarding = shared.forwarding.lock();
                if let Some(old) = forwarding.downstream.take() {
                    old.clear_capacity_waker();
                }
                let waker_target = Arc::downgrade(&shared);
                sink.set_capacity_waker(Box::new(move || {
                    if let Some(shared) = waker_target.upgrade() {
                        let target = Arc::clone(&shared);
                        shared.executor.submit(move || {
                            forward_pending(&target);
                            Ok(())
                        });
                    }
                }));
                forwarding.downstream = Some(sink);
            }
            forward_pending(&shared);
            Ok(())
        });
    }

    /// Discards in-flight and pending work ahead of queued tasks and
    /// reopens the input gate. Discarded frames are released to their
    /// producers.
    pub fn flush(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.executor.submit_high_priority(move || {
            shared.flush_generation.fetch_add(1, Ordering::SeqCst);
            shared.forwarding.lock().pending.clear();
            shared.stage.lock().flush();
            open_gate(&shared);
            Ok(())
        });
    }

    /// Releases the stage. Idempotent; queueing afterwards is an error.
    pub fn release(&self) {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.shared.executor.submit(move || {
            {
                let mut forwarding = shared.forwarding.lock();
                forwarding.pending.clear();
                if let Some(downstream) = forwarding.downstream.take() {
                    downstream.clear_capacity_waker();
                }
            }
            shared.stage.lock().release();
            *shared.input_waker.lock() = None;
            Ok(())
        });
    }
}

impl<S: ShaderStage> FrameSink<Packet<Frame<S::Input>>> for StageInput<S> {
    fn try_queue(
        &self,
        packet: Packet<Frame<S::Input>>,
    ) -> Result<(), Packet<Frame<S::Input>>> {
        assert!(
            !self.shared.released.load(Ordering::SeqCst),
            "frame queued after stage release"
        );
        match packet {
            Packet::EndOfStream => {
                // End-of-stream takes no capacity; it queues behind any
                // in-flight frame and drains out in order.
                let shared = Arc::clone(&self.shared);
                self.shared.executor.submit(move || {
                    shared
                        .forwarding
                        .lock()
                        .pending
                        .push_back(Packet::EndOfStream);
                    forward_pending(&shared);
                    Ok(())
                });
                Ok(())
            }
            Packet::Payload(input) => {
                {
                    let mut gate = self.shared.gate.lock();
                    if *gate == Gate::Processing {
                        return Err(Packet::Payload(input));
                    }
                    *gate = Gate::Processing;
                }
                let generation = self.shared.flush_generation.load(Ordering::SeqCst);
                let shared = Arc::clone(&self.shared);
                self.shared
                    .executor
                    .submit(move || process_input(&shared, input, generation));
                Ok(())
            }
        }
    }

    fn set_capacity_waker(&self, waker: CapacityWaker) {
        *self.shared.input_waker.lock() = Some(waker);
    }

    fn clear_capacity_waker(&self) {
        *self.shared.input_waker.lock() = None;
    }
}

fn process_input<S: ShaderStage>(
    shared: &Arc<StageShared<S>>,
    input: Frame<S::Input>,
    generation: u64,
) -> Result<(), PipelineError> {
    if shared.released.load(Ordering::SeqCst) {
        input.release();
        return Ok(());
    }
    if shared.flush_generation.load(Ordering::SeqCst) != generation {
        // A flush ran while this frame waited its turn; the flush task
        // already reopened the gate.
        input.release();
        return Ok(());
    }
    let result = {
        let mut stage = shared.stage.lock();
        stage.process(&input)
    };
    let time_us = input.presentation_time_us();
    let metadata = input.metadata().cloned();
    input.release();
    let output = match result {
        Ok(output) => output,
        Err(error) => {
            open_gate(shared);
            return Err(error);
        }
    };
    let mut output = output.with_presentation_time(time_us);
    if let Some(metadata) = metadata {
        output = output.with_metadata(metadata);
    }
    debug!(presentation_time_us = time_us, "stage processed frame");
    shared
        .forwarding
        .lock()
        .pending
        .push_back(Packet::Payload(output));
    open_gate(shared);
    forward_pending(shared);
    Ok(())
}

/// Reopens the input gate and fires the upstream capacity waker. The
/// waker is taken out for the call so it can re-register without
/// deadlocking, and is restored if it did not.
fn open_gate<S: ShaderStage>(shared: &Arc<StageShared<S>>) {
    *shared.gate.lock() = Gate::Idle;
    let waker = shared.input_waker.lock().take();
    if let Some(waker) = waker {
        waker();
        let mut slot = shared.input_waker.lock();
        if slot.is_none() {
            *slot = Some(waker);
        }
    }
}

fn forward_pending<S: ShaderStage>(shared: &Arc<StageShared<S>>) {
    if shared.released.load(Ordering::SeqCst) {
        return;
    }
    let mut forwarding = shared.forwarding.lock();
    while let Some(packet) = forwarding.pending.pop_front() {
        let Some(downstream) = forwarding.downstream.clone() else {
            forwarding.pending.push_front(packet);
            return;
        };
        if let Err(packet) = downstream.try_queue(packet) {
            forwarding.pending.push_front(packet);
            return;
        }
    }
}

/// Wires `upstream`'s output into `downstream`'s input.
pub fn connect<A, B>(upstream: &StageProcessor<A>, downstream: &StageProcessor<B>)
where
    A: ShaderStage,
    B: ShaderStage<Input = A::Output>,
{
    let sink: Arc<dyn FrameSink<Packet<Frame<A::Output>>>> = downstream.input();
    upstream.set_output(sink);
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame::FrameFormat;
    use std::time::Duration;

    /// Doubles the input value; blocks on a gate when one is installed so
    /// tests can observe the in-flight state.
    struct DoublingStage {
        hold: Option<crossbeam_channel::Receiver<()>>,
        flushes: Arc<Mutex<u32>>,
        released: Arc<Mutex<bool>>,
    }

    impl DoublingStage {
        fn new() -> Self {
            Self {
                hold: None,
                flushes: Arc::new(Mutex::new(0)),
                released: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl ShaderStage for DoublingStage {
        type Input = u32;
        type Output = u32;

        fn process(&mut self, input: &Frame<u32>) -> Result<Frame<u32>, PipelineError> {
            if let Some(hold) = &self.hold {
                let _ = hold.recv();
            }
            Ok(Frame::unmanaged(
                input.resource() * 2,
                *input.format(),
                input.presentation_time_us(),
            ))
        }

        fn flush(&mut self) {
            *self.flushes.lock() += 1;
        }

        fn release(&mut self) {
            *self.released.lock() = true;
        }
    }

    /// Collects forwarded packets; can be toggled full to exercise
    /// capacity handling.
    struct CollectSink {
        received: Mutex<Vec<Packet<Frame<u32>>>>,
        full: AtomicBool,
        waker: Mutex<Option<CapacityWaker>>,
    }

    impl CollectSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                full: AtomicBool::new(false),
                waker: Mutex::new(None),
            })
        }

        fn values(&self) -> Vec<Option<u32>> {
            self.received
                .lock()
                .iter()
                .map(|p| p.payload_ref().map(|f| *f.resource()))
                .collect()
        }

        fn set_full(&self, full: bool) {
            self.full.store(full, Ordering::SeqCst);
            if !full {
                if let Some(waker) = &*self.waker.lock() {
                    waker();
                }
            }
        }
    }

    impl FrameSink<Packet<Frame<u32>>> for CollectSink {
        fn try_queue(&self, packet: Packet<Frame<u32>>) -> Result<(), Packet<Frame<u32>>> {
            if self.full.load(Ordering::SeqCst) {
                return Err(packet);
            }
            self.received.lock().push(packet);
            Ok(())
        }

        fn set_capacity_waker(&self, waker: CapacityWaker) {
            *self.waker.lock() = Some(waker);
        }

        fn clear_capacity_waker(&self) {
            *self.waker.lock() = None;
        }
    }

    fn frame(value: u32, time_us: i64) -> Frame<u32> {
        Frame::unmanaged(value, FrameFormat::sdr(16, 16), time_us)
    }

    fn wait_until(deadline_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn processes_and_forwards_in_order() {
        let executor = TaskExecutor::new("stage-test", |_| {});
        let processor = StageProcessor::new(DoublingStage::new(), executor.clone());
        let sink = CollectSink::new();
        processor.set_output(sink.clone());

        let input = processor.input();
        assert!(input.try_queue(Packet::Payload(frame(1, 0))).is_ok());
        assert!(wait_until(1_000, || sink.received.lock().len() == 1));
        assert!(input.try_queue(Packet::Payload(frame(2, 33_000))).is_ok());
        assert!(input.try_queue(Packet::EndOfStream).is_ok());

        assert!(wait_until(1_000, || sink.received.lock().len() == 3));
        assert_eq!(sink.values(), vec![Some(2), Some(4), None]);
        let times: Vec<i64> = sink
            .received
            .lock()
            .iter()
            .filter_map(|p| p.payload_ref().map(|f| f.presentation_time_us()))
            .collect();
        assert_eq!(times, vec![0, 33_000]);
        executor.release(|| Ok(()), Duration::from_secs(5));
    }

    #[test]
    fn rejects_second_frame_while_processing() {
        let executor = TaskExecutor::new("stage-test", |_| {});
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let mut stage = DoublingStage::new();
        stage.hold = Some(gate_rx);
        let processor = StageProcessor::new(stage, executor.clone());
        let sink = CollectSink::new();
        processor.set_output(sink.clone());

        let input = processor.input();
        let woken = Arc::new(AtomicBool::new(false));
        let w = Arc::clone(&woken);
        input.set_capacity_waker(Box::new(move || w.store(true, Ordering::SeqCst)));

        assert!(input.try_queue(Packet::Payload(frame(1, 0))).is_ok());
        // The first frame is blocked inside process(); a second is refused.
        let rejected = input.try_queue(Packet::Payload(frame(2, 1)));
        assert!(rejected.is_err());

        gate_tx.send(()).unwrap();
        assert!(wait_until(1_000, || woken.load(Ordering::SeqCst)));
        assert!(input.try_queue(Packet::Payload(frame(2, 1))).is_ok());
        gate_tx.send(()).unwrap();
        assert!(wait_until(1_000, || sink.received.lock().len() == 2));
        executor.release(|| Ok(()), Duration::from_secs(5));
    }

    #[test]
    fn holds_output_until_downstream_has_capacity() {
        let executor = TaskExecutor::new("stage-test", |_| {});
        let processor = StageProcessor::new(DoublingStage::new(), executor.clone());
        let sink = CollectSink::new();
        sink.set_full(true);
        processor.set_output(sink.clone());

        let input = processor.input();
        let woken = Arc::new(AtomicBool::new(false));
        let w = Arc::clone(&woken);
        input.set_capacity_waker(Box::new(move || w.store(true, Ordering::SeqCst)));

        assert!(input.try_queue(Packet::Payload(frame(5, 0))).is_ok());
        assert!(input.try_queue(Packet::EndOfStream).is_ok());
        // Input capacity reopens once processing is done even though the
        // output has not been delivered yet.
        assert!(wait_until(1_000, || woken.load(Ordering::SeqCst)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(sink.received.lock().is_empty());

        sink.set_full(false);
        assert!(wait_until(1_000, || sink.received.lock().len() == 2));
        assert_eq!(sink.values(), vec![Some(10), None]);
        executor.release(|| Ok(()), Duration::from_secs(5));
    }

    #[test]
    fn flush_discards_pending_output() {
        let executor = TaskExecutor::new("stage-test", |_| {});
        let stage = DoublingStage::new();
        let flushes = Arc::clone(&stage.flushes);
        let processor = StageProcessor::new(stage, executor.clone());
        let sink = CollectSink::new();
        sink.set_full(true);
        processor.set_output(sink.clone());

        let input = processor.input();
        let woken = Arc::new(AtomicBool::new(false));
        let w = Arc::clone(&woken);
        input.set_capacity_waker(Box::new(move || w.store(true, Ordering::SeqCst)));

        assert!(input.try_queue(Packet::Payload(frame(3, 0))).is_ok());
        // Wait for processing to finish; the output is now parked behind
        // the full sink.
        assert!(wait_until(1_000, || woken.load(Ordering::SeqCst)));
        processor.flush();
        assert!(wait_until(1_000, || *flushes.lock() == 1));

        sink.set_full(false);
        std::thread::sleep(Duration::from_millis(20));
        assert!(sink.received.lock().is_empty());
        executor.release(|| Ok(()), Duration::from_secs(5));
    }

    #[test]
    fn flush_discards_frame_awaiting_processing() {
        let executor = TaskExecutor::new("stage-test", |_| {});
        let stage = DoublingStage::new();
        let flushes = Arc::clone(&stage.flushes);
        let processor = StageProcessor::new(stage, executor.clone());
        let sink = CollectSink::new();
        processor.set_output(sink.clone());

        // Occupy the worker so the accepted frame's processing task sits
        // queued behind it when the flush arrives.
        let (hold_tx, hold_rx) = crossbeam_channel::bounded::<()>(0);
        executor.submit(move || {
            let _ = hold_rx.recv();
            Ok(())
        });

        let input = processor.input();
        let frame_released = Arc::new(AtomicBool::new(false));
        let released = Arc::clone(&frame_released);
        let held_frame = Frame::new(7u32, FrameFormat::sdr(16, 16), 0, move |_| {
            released.store(true, Ordering::SeqCst);
        });
        assert!(input.try_queue(Packet::Payload(held_frame)).is_ok());
        processor.flush();

        hold_tx.send(()).unwrap();
        assert!(wait_until(1_000, || *flushes.lock() == 1));
        assert!(wait_until(1_000, || frame_released.load(Ordering::SeqCst)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(sink.received.lock().is_empty());

        // The gate is open again; a frame queued after the flush runs.
        assert!(input.try_queue(Packet::Payload(frame(4, 33_000))).is_ok());
        assert!(wait_until(1_000, || sink.received.lock().len() == 1));
        assert_eq!(sink.values(), vec![Some(8)]);
        executor.release(|| Ok(()), Duration::from_secs(5));
    }

    #[test]
    fn release_is_idempotent_and_reaches_stage() {
        let executor = TaskExecutor::new("stage-test", |_| {});
        let stage = DoublingStage::new();
        let released = Arc::clone(&stage.released);
        let processor = StageProcessor::new(stage, executor.clone());
        processor.release();
        processor.release();
        assert!(wait_until(1_000, || *released.lock()));
        executor.release(|| Ok(()), Duration::from_secs(5));
    }

    #[test]
    #[should_panic(expected = "after stage release")]
    fn queue_after_release_panics() {
        let executor = TaskExecutor::new("stage-test", |_| {});
        let processor = StageProcessor::new(DoublingStage::new(), executor);
        let input = processor.input();
        processor.release();
        let _ = input.try_queue(Packet::Payload(frame(1, 0)));
    }
}
