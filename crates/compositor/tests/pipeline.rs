/// End-to-end CPU pipeline: a pooled frame queue feeding a two-stage
/// processing chain, with buffers recycled back into the pool as each
/// stage finishes with its input.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use compositor::{connect, PooledFrameQueue, ShaderStage, StageProcessor};
use frame::{CapacityWaker, Frame, FrameFormat, FrameSink, Packet, PipelineError, PixelBuffer};
use gpu_tasks::TaskExecutor;
use parking_lot::Mutex;

struct InvertStage;

impl ShaderStage for InvertStage {
    type Input = PixelBuffer;
    type Output = PixelBuffer;

    fn process(
        &mut self,
        input: &Frame<PixelBuffer>,
    ) -> Result<Frame<PixelBuffer>, PipelineError> {
        let mut output = PixelBuffer::new(*input.format());
        for (out, byte) in output.data_mut().iter_mut().zip(input.resource().data()) {
            *out = 255 - byte;
        }
        Ok(Frame::unmanaged(
            output,
            *input.format(),
            input.presentation_time_us(),
        ))
    }
}

struct HalveStage;

impl ShaderStage for HalveStage {
    type Input = PixelBuffer;
    type Output = PixelBuffer;

    fn process(
        &mut self,
        input: &Frame<PixelBuffer>,
    ) -> Result<Frame<PixelBuffer>, PipelineError> {
        let mut output = PixelBuffer::new(*input.format());
        for (out, byte) in output.data_mut().iter_mut().zip(input.resource().data()) {
            *out = byte / 2;
        }
        Ok(Frame::unmanaged(
            output,
            *input.format(),
            input.presentation_time_us(),
        ))
    }
}

/// Terminal consumer: records each frame's timestamp and first byte, then
/// releases it immediately.
struct EndSink {
    received: Mutex<Vec<(i64, u8)>>,
    ended: AtomicBool,
}

impl EndSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        })
    }
}

impl FrameSink<Packet<Frame<PixelBuffer>>> for EndSink {
    fn try_queue(
        &self,
        packet: Packet<Frame<PixelBuffer>>,
    ) -> Result<(), Packet<Frame<PixelBuffer>>> {
        match packet {
            Packet::Payload(frame) => {
                self.received
                    .lock()
                    .push((frame.presentation_time_us(), frame.resource().data()[0]));
                frame.release();
            }
            Packet::EndOfStream => self.ended.store(true, Ordering::SeqCst),
        }
        Ok(())
    }

    fn set_capacity_waker(&self, _waker: CapacityWaker) {}

    fn clear_capacity_waker(&self) {}
}

fn wait_until(deadline_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn frame_queue_feeds_stage_chain_and_recycles_buffers() {
    let format = FrameFormat::sdr(8, 8);
    let queue = Arc::new(PooledFrameQueue::with_capacity(2));
    let (frames_tx, frames_rx) = crossbeam_channel::unbounded();
    queue.set_output(frames_tx);

    let executor = TaskExecutor::new("pipeline-test", |_| {});
    let invert = StageProcessor::new(InvertStage, executor.clone());
    let halve = StageProcessor::new(HalveStage, executor.clone());
    connect(&invert, &halve);
    let sink = EndSink::new();
    halve.set_output(sink.clone());

    // Producer: six frames through a two-buffer pool, so it gets
    // backpressured and has to wait for buffers to come back.
    let producer_queue = Arc::clone(&queue);
    let producer = thread::spawn(move || {
        for i in 0..6u8 {
            let mut frame = loop {
                let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
                match producer_queue.dequeue(&format, move || {
                    let _ = ready_tx.send(());
                }) {
                    Some(frame) => break frame,
                    None => {
                        let _ = ready_rx.recv_timeout(Duration::from_secs(5));
                    }
                }
            };
            frame.resource_mut().data_mut().fill(i * 10);
            producer_queue.queue(frame.with_presentation_time(i64::from(i) * 33_000));
        }
        producer_queue.signal_end_of_stream();
    });

    // Bridge the queue's output channel onto the chain's bounded input,
    // retrying while the first stage is busy.
    let input = invert.input();
    for packet in frames_rx.iter() {
        let is_end = matches!(packet, Packet::EndOfStream);
        let mut packet = packet;
        loop {
            match input.try_queue(packet) {
                Ok(()) => break,
                Err(rejected) => {
                    packet = rejected;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
        if is_end {
            break;
        }
    }

    producer.join().unwrap();
    assert!(wait_until(5_000, || sink.ended.load(Ordering::SeqCst)));

    let received = sink.received.lock().clone();
    let expected: Vec<(i64, u8)> = (0..6u8)
        .map(|i| (i64::from(i) * 33_000, (255 - i * 10) / 2))
        .collect();
    assert_eq!(received, expected);

    // Every buffer came home: the pool never grew past its capacity and
    // holds both buffers again after the drain.
    assert_eq!(queue.pooled_count(), 2);

    invert.release();
    halve.release();
    executor.release(|| Ok(()), Duration::from_secs(5));
}
