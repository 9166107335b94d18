use crate::error::{BoxError, PipelineError, Result};
use crate::stage::{Element, ElementStream, Fused, Stage, StageContext};
use crate::transform::{panic_message, Transform};
use std::collections::VecDeque;
use std::sync::Arc;

/// Default fan-out when `parallelism` is not configured
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Map with bounded concurrency and ordered output
///
/// Input is cut into consecutive groups of `parallelism` elements. Every
/// element of a group is transformed on its own scoped thread; the group's
/// results are re-sequenced into input order before any of them is yielded,
/// and the next group is only pulled once the current one is fully delivered.
/// If any transform in a group fails (or panics) the stage fails and none of
/// that group's results are delivered.
pub struct ParallelMapStage {
    mapper: Transform,
}

impl ParallelMapStage {
    pub fn new<F>(mapper: F) -> Self
    where
        F: Fn(&Element) -> std::result::Result<Element, BoxError> + Send + Sync + 'static,
    {
        Self {
            mapper: Arc::new(mapper),
        }
    }
}

impl Stage for ParallelMapStage {
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream> {
        let parallelism = ctx
            .options()
            .positive_or(ctx.label(), "parallelism", default_parallelism())?;
        let mapper = Arc::clone(&self.mapper);
        let label = ctx.label().to_string();
        let mut upstream = Fused::new(input);
        let mut ready: VecDeque<Element> = VecDeque::new();
        let mut deferred: Option<PipelineError> = None;
        let mut failed = false;

        Ok(Box::new(std::iter::from_fn(move || {
            if let Some(element) = ready.pop_front() {
                return Some(Ok(element));
            }
            if let Some(e) = deferred.take() {
                return Some(Err(e));
            }
            if failed {
                return None;
            }

            let mut group = Vec::with_capacity(parallelism);
            while group.len() < parallelism {
                match upstream.pull() {
                    Some(Ok(element)) => group.push(element),
                    Some(Err(e)) => {
                        deferred = Some(e);
                        break;
                    }
                    None => break,
                }
            }
            if group.is_empty() {
                return deferred.take().map(Err);
            }

            match run_group(&mapper, &label, group) {
                Ok(results) => {
                    ready.extend(results);
                    ready.pop_front().map(Ok)
                }
                Err(e) => {
                    failed = true;
                    deferred = None;
                    upstream.finish();
                    Some(Err(e))
                }
            }
        })))
    }

    fn describe(&self) -> String {
        "parallel_map".to_string()
    }
}

fn run_group(mapper: &Transform, label: &str, group: Vec<Element>) -> Result<Vec<Element>> {
    let outcomes = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = group
            .iter()
            .map(|element| scope.spawn(move |_| mapper(element)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    })
    .map_err(|panic| PipelineError::ThreadError(panic_message(panic.as_ref())))?;

    let mut results = Vec::with_capacity(group.len());
    for (element, outcome) in group.into_iter().zip(outcomes) {
        let source: BoxError = match outcome {
            Ok(Ok(mapped)) => {
                results.push(mapped);
                continue;
            }
            Ok(Err(e)) => e,
            Err(panic) => panic_message(panic.as_ref()).into(),
        };
        return Err(PipelineError::StageExecution {
            stage: label.to_string(),
            element,
            source,
        });
    }
    Ok(results)
}
