use crate::error::Result;
use crate::stage::{Element, ElementStream, Fused, Stage, StageContext};
use std::time::{Duration, Instant};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(1000);

/// Accumulation state of the batch being built
#[derive(Debug)]
struct BatchState {
    buffer: Vec<Element>,
    count: usize,
    started_at: Instant,
}

impl BatchState {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            count: 0,
            started_at: Instant::now(),
        }
    }

    fn release(&mut self) -> Element {
        let batch = std::mem::take(&mut self.buffer);
        self.count = 0;
        self.started_at = Instant::now();
        Element::Array(batch)
    }
}

/// Groups elements into size- or time-bounded batches
///
/// A batch is released once it holds `size` elements or once `timeout` has
/// elapsed since it began, whichever is noticed first when an element
/// arrives. The timeout is only checked on arrival; it never fires on an idle
/// stream. A partial batch is flushed when the input completes.
#[derive(Debug, Default)]
pub struct BatchStage;

impl Stage for BatchStage {
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream> {
        let size = ctx
            .options()
            .positive_or(ctx.label(), "size", DEFAULT_BATCH_SIZE)?;
        let timeout = ctx
            .options()
            .optional_duration(ctx.label(), "timeout")?
            .unwrap_or(DEFAULT_BATCH_TIMEOUT);
        let mut upstream = Fused::new(input);
        let mut state: Option<BatchState> = None;

        Ok(Box::new(std::iter::from_fn(move || {
            let batch = state.get_or_insert_with(BatchState::new);
            loop {
                match upstream.pull() {
                    Some(Ok(element)) => {
                        batch.buffer.push(element);
                        batch.count += 1;
                        if batch.count >= size || batch.started_at.elapsed() >= timeout {
                            return Some(Ok(batch.release()));
                        }
                    }
                    Some(Err(e)) => {
                        batch.buffer.clear();
                        batch.count = 0;
                        return Some(Err(e));
                    }
                    None if batch.count > 0 => return Some(Ok(batch.release())),
                    None => return None,
                }
            }
        })))
    }

    fn describe(&self) -> String {
        "batch".to_string()
    }
}
