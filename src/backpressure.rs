use crate::buffer::RingBuffer;
use crate::error::Result;
use crate::event::{Event, BACKPRESSURE};
use crate::stage::{Element, ElementStream, Fused, Stage, StageContext};
use std::collections::VecDeque;
use tracing::debug;

/// Default queue bound when `max_buffer` is not configured
pub const DEFAULT_MAX_BUFFER: usize = 1000;

/// Threshold-based flow control
///
/// Elements accumulate in a bounded queue. When an element arrives while the
/// queue already holds `max_buffer` elements, the whole queue (oldest first)
/// and the triggering element are released downstream together, the queue
/// resets, and a backpressure event records the buffer size at that moment.
/// Whatever is still queued flushes when the input completes.
#[derive(Debug, Default)]
pub struct BackpressureStage;

impl Stage for BackpressureStage {
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream> {
        let max_buffer = ctx
            .options()
            .positive_or(ctx.label(), "max_buffer", DEFAULT_MAX_BUFFER)?;
        let queue: RingBuffer<Element> = RingBuffer::new(max_buffer);
        let ctx = ctx.clone();
        let mut upstream = Fused::new(input);
        let mut released: VecDeque<Element> = VecDeque::new();
        let mut exhausted = false;

        Ok(Box::new(std::iter::from_fn(move || loop {
            if let Some(element) = released.pop_front() {
                return Some(Ok(element));
            }
            if exhausted {
                return None;
            }
            match upstream.pull() {
                Some(Ok(element)) => {
                    if let Err(element) = queue.try_push(element) {
                        let buffer_size = queue.len();
                        released.extend(queue.drain());
                        released.push_back(element);
                        debug!(stage = ctx.label(), buffer_size, "backpressure threshold reached");
                        ctx.events().emit(
                            Event::new(BACKPRESSURE)
                                .measure("buffer_size", buffer_size)
                                .meta("stage", ctx.label())
                                .meta("index", ctx.index()),
                        );
                    }
                }
                Some(Err(e)) => {
                    exhausted = true;
                    return Some(Err(e));
                }
                None => {
                    exhausted = true;
                    if !queue.is_empty() {
                        released.extend(queue.drain());
                    }
                }
            }
        })))
    }

    fn describe(&self) -> String {
        "backpressure".to_string()
    }
}
