//! Runtime adapters that sit between stages: the buffered source adapter,
//! per-stage instrumentation and the outer flow handed back by `Pipeline::run`.

use crate::error::Result;
use crate::event::{
    Emitter, Event, FLOW_START, FLOW_STOP, PIPELINE_COMPLETE, PIPELINE_START, STAGE_ERROR,
    STAGE_STOP,
};
use crate::source::{Source, SourceIter};
use crate::stage::{Element, ElementStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

fn micros(since: Instant) -> u64 {
    since.elapsed().as_micros() as u64
}

enum AdapterState {
    Pending,
    Open {
        iter: SourceIter,
        opened_at: Instant,
        count: u64,
    },
    Released,
}

/// Pulls from a [`Source`] one element at a time.
///
/// The source is opened on the first pull and released exactly once: on
/// exhaustion, on an open failure, or when the adapter is dropped early.
/// A flow-start / flow-stop event pair brackets the open period.
pub struct SourceAdapter {
    source: Arc<dyn Source>,
    state: AdapterState,
    events: Emitter,
}

impl SourceAdapter {
    pub fn new(source: Arc<dyn Source>, events: Emitter) -> Self {
        Self {
            source,
            state: AdapterState::Pending,
            events,
        }
    }

    /// Whether the underlying source has been released
    pub fn is_released(&self) -> bool {
        matches!(self.state, AdapterState::Released)
    }

    fn release(&mut self) {
        let previous = std::mem::replace(&mut self.state, AdapterState::Released);
        if let AdapterState::Open {
            iter,
            opened_at,
            count,
        } = previous
        {
            drop(iter);
            self.events.emit(
                Event::new(FLOW_STOP)
                    .measure("duration", micros(opened_at))
                    .measure("element_count", count)
                    .meta("source", self.source.describe()),
            );
        }
    }
}

impl Iterator for SourceAdapter {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if let AdapterState::Pending = self.state {
            self.events
                .emit(Event::new(FLOW_START).meta("source", self.source.describe()));
            let opened_at = Instant::now();
            match self.source.open() {
                Ok(iter) => {
                    self.state = AdapterState::Open {
                        iter,
                        opened_at,
                        count: 0,
                    }
                }
                Err(e) => {
                    self.state = AdapterState::Open {
                        iter: Box::new(std::iter::empty()),
                        opened_at,
                        count: 0,
                    };
                    self.release();
                    return Some(Err(e));
                }
            }
        }

        let pulled = match &mut self.state {
            AdapterState::Open { iter, count, .. } => {
                let next = iter.next();
                if next.is_some() {
                    *count += 1;
                }
                next
            }
            _ => return None,
        };
        match pulled {
            Some(element) => Some(Ok(element)),
            None => {
                self.release();
                None
            }
        }
    }
}

impl Drop for SourceAdapter {
    fn drop(&mut self) {
        self.release();
    }
}

/// Marks, on a shared flag, that an error came from upstream of a stage
pub(crate) struct UpstreamMark {
    inner: ElementStream,
    failed: Arc<AtomicBool>,
}

impl UpstreamMark {
    pub(crate) fn new(inner: ElementStream, failed: Arc<AtomicBool>) -> Self {
        Self { inner, failed }
    }
}

impl Iterator for UpstreamMark {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next();
        if matches!(item, Some(Err(_))) {
            self.failed.store(true, Ordering::Relaxed);
        }
        item
    }
}

/// Instruments one stage's output with stop and error events
pub(crate) struct StageProbe {
    inner: Option<ElementStream>,
    label: String,
    index: usize,
    events: Emitter,
    upstream_failed: Arc<AtomicBool>,
    started_at: Option<Instant>,
    count: u64,
}

impl StageProbe {
    pub(crate) fn new(
        inner: ElementStream,
        label: String,
        index: usize,
        events: Emitter,
        upstream_failed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: Some(inner),
            label,
            index,
            events,
            upstream_failed,
            started_at: None,
            count: 0,
        }
    }

    fn stop(&mut self) {
        if self.inner.take().is_none() {
            return;
        }
        if let Some(started_at) = self.started_at {
            self.events.emit(
                Event::new(STAGE_STOP)
                    .measure("duration", micros(started_at))
                    .measure("element_count", self.count)
                    .meta("stage", self.label.as_str())
                    .meta("index", self.index),
            );
        }
    }
}

impl Iterator for StageProbe {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.as_mut()?;
        self.started_at.get_or_insert_with(Instant::now);
        match inner.next() {
            Some(Ok(element)) => {
                self.count += 1;
                Some(Ok(element))
            }
            Some(Err(e)) => {
                if !self.upstream_failed.load(Ordering::Relaxed) {
                    self.events.emit(
                        Event::new(STAGE_ERROR)
                            .measure("error", e.to_string())
                            .measure("element", e.element().cloned().unwrap_or_default())
                            .meta("stage", self.label.as_str())
                            .meta("index", self.index)
                            .meta("fatal", true),
                    );
                }
                self.stop();
                Some(Err(e))
            }
            None => {
                self.stop();
                None
            }
        }
    }
}

impl Drop for StageProbe {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The lazy output of one pipeline run
///
/// The pipeline-start event fires on the first pull. The pipeline-complete
/// event fires exactly once: on exhaustion, on the first error, or when the
/// flow is dropped before either. Nothing is yielded after an error.
pub struct Flow {
    inner: Option<ElementStream>,
    events: Emitter,
    stage_count: usize,
    started_at: Option<Instant>,
    produced: u64,
}

impl Flow {
    pub(crate) fn new(inner: ElementStream, stage_count: usize, events: Emitter) -> Self {
        Self {
            inner: Some(inner),
            events,
            stage_count,
            started_at: None,
            produced: 0,
        }
    }

    /// Whether the flow has finished (exhausted, failed or halted)
    pub fn is_finished(&self) -> bool {
        self.inner.is_none()
    }

    /// Elements yielded so far
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Stop pulling and release everything upstream
    pub fn halt(&mut self) {
        self.complete("halted");
    }

    fn complete(&mut self, status: &'static str) {
        // Drop the stage chain first so the source is released before the
        // completion event is observed.
        if self.inner.take().is_none() {
            return;
        }
        if let Some(started_at) = self.started_at {
            let duration = micros(started_at);
            debug!(pipeline = self.events.pipeline(), duration, status, "pipeline complete");
            self.events.emit(
                Event::new(PIPELINE_COMPLETE)
                    .measure("duration", duration)
                    .measure("element_count", self.produced)
                    .meta("status", status),
            );
        }
    }
}

impl Iterator for Flow {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.as_mut()?;
        if self.started_at.is_none() {
            debug!(pipeline = self.events.pipeline(), stages = self.stage_count, "pipeline start");
            self.events
                .emit(Event::new(PIPELINE_START).measure("stage_count", self.stage_count));
            self.started_at = Some(Instant::now());
        }
        match inner.next() {
            Some(Ok(element)) => {
                self.produced += 1;
                Some(Ok(element))
            }
            Some(Err(e)) => {
                self.complete("error");
                Some(Err(e))
            }
            None => {
                self.complete("ok");
                None
            }
        }
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.complete("halted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::event::EventRecorder;
    use crate::source::{IterSource, VecSource};
    use serde_json::json;

    fn emitter() -> (Emitter, Arc<EventRecorder>) {
        let recorder = Arc::new(EventRecorder::new());
        (Emitter::new(recorder.clone(), "test"), recorder)
    }

    #[test]
    fn test_adapter_is_lazy() {
        let (events, recorder) = emitter();
        let adapter = SourceAdapter::new(Arc::new(VecSource::new(vec![json!(1)])), events);
        assert!(recorder.events().is_empty());
        drop(adapter);
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_adapter_releases_once_on_exhaustion() {
        let (events, recorder) = emitter();
        let mut adapter = SourceAdapter::new(Arc::new(VecSource::new(vec![json!(1), json!(2)])), events);
        assert_eq!(adapter.by_ref().count(), 2);
        assert!(adapter.is_released());
        assert!(adapter.next().is_none());
        drop(adapter);

        assert_eq!(recorder.named(&["pipeline", "flow", "start"]).len(), 1);
        let stops = recorder.named(&["pipeline", "flow", "stop"]);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].measurement_u64("element_count"), Some(2));
    }

    #[test]
    fn test_adapter_releases_once_on_early_halt() {
        let (events, recorder) = emitter();
        let mut adapter = SourceAdapter::new(
            Arc::new(IterSource::new((0..).map(|n| json!(n)))),
            events,
        );
        assert!(adapter.next().is_some());
        drop(adapter);
        assert_eq!(recorder.named(&["pipeline", "flow", "stop"]).len(), 1);
    }

    #[test]
    fn test_adapter_reports_open_failure() {
        let (events, recorder) = emitter();
        let source = Arc::new(IterSource::new(vec![json!(1)]));
        let _ = source.open();
        let mut adapter = SourceAdapter::new(source, events);
        assert!(matches!(adapter.next(), Some(Err(PipelineError::SourceUnavailable(_)))));
        assert!(adapter.next().is_none());
        drop(adapter);
        assert_eq!(recorder.named(&["pipeline", "flow", "stop"]).len(), 1);
    }

    #[test]
    fn test_flow_completes_once_when_abandoned() {
        let (events, recorder) = emitter();
        let inner: ElementStream = Box::new((0..).map(|n| Ok(json!(n))));
        let mut flow = Flow::new(inner, 0, events);
        assert!(flow.next().is_some());
        flow.halt();
        assert!(flow.next().is_none());
        drop(flow);

        let completes = recorder.named(&["pipeline", "complete"]);
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].metadata["status"], "halted");
    }

    #[test]
    fn test_flow_stops_after_error() {
        let (events, recorder) = emitter();
        let inner: ElementStream = Box::new(
            vec![Ok(json!(1)), Err(PipelineError::MissingSource), Ok(json!(2))].into_iter(),
        );
        let flow = Flow::new(inner, 1, events);
        let items: Vec<_> = flow.collect();
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
        assert_eq!(recorder.named(&["pipeline", "complete"])[0].metadata["status"], "error");
    }
}
