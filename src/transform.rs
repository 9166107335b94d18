//! Element-wise built-in stages: map, filter, flat-map, take, drop,
//! deduplicate and tap.

use crate::error::{BoxError, PipelineError, Result};
use crate::event::{Event, STAGE_ERROR};
use crate::stage::{Element, ElementStream, Fused, Stage, StageContext};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Fallible element transform shared by map-like stages
pub type Transform = Arc<dyn Fn(&Element) -> std::result::Result<Element, BoxError> + Send + Sync>;

/// Fallible element predicate
pub type Predicate = Arc<dyn Fn(&Element) -> std::result::Result<bool, BoxError> + Send + Sync>;

/// Side effect run by [`TapStage`]
pub type Effect = Arc<dyn Fn(&Element) -> std::result::Result<(), BoxError> + Send + Sync>;

/// Key extractor for [`DedupStage`]
pub type KeyFn = Arc<dyn Fn(&Element) -> Element + Send + Sync>;

/// A mapping stage that transforms each item
pub struct MapStage {
    mapper: Transform,
}

impl MapStage {
    pub fn new<F>(mapper: F) -> Self
    where
        F: Fn(&Element) -> std::result::Result<Element, BoxError> + Send + Sync + 'static,
    {
        Self {
            mapper: Arc::new(mapper),
        }
    }
}

impl Stage for MapStage {
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream> {
        let mapper = Arc::clone(&self.mapper);
        let label = ctx.label().to_string();
        let mut upstream = Fused::new(input);
        let mut failed = false;
        Ok(Box::new(std::iter::from_fn(move || {
            if failed {
                return None;
            }
            let element = match upstream.pull()? {
                Ok(element) => element,
                Err(e) => return Some(Err(e)),
            };
            match mapper(&element) {
                Ok(mapped) => Some(Ok(mapped)),
                Err(source) => {
                    failed = true;
                    Some(Err(PipelineError::StageExecution {
                        stage: label.clone(),
                        element,
                        source,
                    }))
                }
            }
        })))
    }

    fn describe(&self) -> String {
        "map".to_string()
    }
}

/// A filtering stage that passes through items matching a predicate
pub struct FilterStage {
    predicate: Predicate,
}

impl FilterStage {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Element) -> std::result::Result<bool, BoxError> + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

impl Stage for FilterStage {
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream> {
        let predicate = Arc::clone(&self.predicate);
        let label = ctx.label().to_string();
        let mut upstream = Fused::new(input);
        Ok(Box::new(std::iter::from_fn(move || loop {
            let element = match upstream.pull()? {
                Ok(element) => element,
                Err(e) => return Some(Err(e)),
            };
            match predicate(&element) {
                Ok(true) => return Some(Ok(element)),
                Ok(false) => continue,
                Err(source) => {
                    upstream.finish();
                    return Some(Err(PipelineError::StageExecution {
                        stage: label.clone(),
                        element,
                        source,
                    }));
                }
            }
        })))
    }

    fn describe(&self) -> String {
        "filter".to_string()
    }
}

/// Expands each element into the array its transform returns
pub struct FlatMapStage {
    mapper: Transform,
}

impl FlatMapStage {
    pub fn new<F>(mapper: F) -> Self
    where
        F: Fn(&Element) -> std::result::Result<Element, BoxError> + Send + Sync + 'static,
    {
        Self {
            mapper: Arc::new(mapper),
        }
    }
}

impl Stage for FlatMapStage {
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream> {
        let mapper = Arc::clone(&self.mapper);
        let label = ctx.label().to_string();
        let mut upstream = Fused::new(input);
        let mut pending: VecDeque<Element> = VecDeque::new();
        Ok(Box::new(std::iter::from_fn(move || loop {
            if let Some(next) = pending.pop_front() {
                return Some(Ok(next));
            }
            let element = match upstream.pull()? {
                Ok(element) => element,
                Err(e) => return Some(Err(e)),
            };
            match mapper(&element) {
                Ok(Element::Array(items)) => pending.extend(items),
                Ok(other) => {
                    upstream.finish();
                    return Some(Err(PipelineError::InvalidStageResult {
                        stage: label.clone(),
                        element,
                        found: value_kind(&other).to_string(),
                    }));
                }
                Err(source) => {
                    upstream.finish();
                    return Some(Err(PipelineError::StageExecution {
                        stage: label.clone(),
                        element,
                        source,
                    }));
                }
            }
        })))
    }

    fn describe(&self) -> String {
        "flat_map".to_string()
    }
}

fn value_kind(value: &Element) -> &'static str {
    match value {
        Element::Null => "null",
        Element::Bool(_) => "a boolean",
        Element::Number(_) => "a number",
        Element::String(_) => "a string",
        Element::Array(_) => "an array",
        Element::Object(_) => "an object",
    }
}

/// Emits at most the first `count` elements, then stops pulling upstream
#[derive(Debug, Default)]
pub struct TakeStage;

impl Stage for TakeStage {
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream> {
        let mut remaining = ctx.options().require_usize(ctx.label(), "count")?;
        // Dropping upstream as soon as the quota is met releases the source.
        let mut upstream = Some(Fused::new(input));
        Ok(Box::new(std::iter::from_fn(move || {
            if remaining == 0 {
                upstream = None;
                return None;
            }
            let item = upstream.as_mut()?.pull();
            match item {
                Some(Ok(element)) => {
                    remaining -= 1;
                    if remaining == 0 {
                        upstream = None;
                    }
                    Some(Ok(element))
                }
                other => {
                    upstream = None;
                    other
                }
            }
        })))
    }

    fn describe(&self) -> String {
        "take".to_string()
    }
}

/// Discards the first `count` elements and passes the rest through
#[derive(Debug, Default)]
pub struct DropStage;

impl Stage for DropStage {
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream> {
        let mut to_skip = ctx.options().require_usize(ctx.label(), "count")?;
        let mut upstream = Fused::new(input);
        Ok(Box::new(std::iter::from_fn(move || loop {
            match upstream.pull()? {
                Ok(_) if to_skip > 0 => to_skip -= 1,
                item => return Some(item),
            }
        })))
    }

    fn describe(&self) -> String {
        "drop".to_string()
    }
}

/// Removes consecutive repeats, comparing keys against the last emitted element
pub struct DedupStage {
    key: Option<KeyFn>,
}

impl DedupStage {
    /// Deduplicate on the elements themselves
    pub fn new() -> Self {
        Self { key: None }
    }

    /// Deduplicate on a derived key
    pub fn by_key<F>(key: F) -> Self
    where
        F: Fn(&Element) -> Element + Send + Sync + 'static,
    {
        Self {
            key: Some(Arc::new(key)),
        }
    }
}

impl Default for DedupStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for DedupStage {
    fn process(&self, input: ElementStream, _ctx: &StageContext) -> Result<ElementStream> {
        let key_fn = self.key.clone();
        let mut upstream = Fused::new(input);
        let mut last_key: Option<Element> = None;
        Ok(Box::new(std::iter::from_fn(move || loop {
            let element = match upstream.pull()? {
                Ok(element) => element,
                Err(e) => return Some(Err(e)),
            };
            let key = match &key_fn {
                Some(f) => f(&element),
                None => element.clone(),
            };
            if last_key.as_ref() != Some(&key) {
                last_key = Some(key);
                return Some(Ok(element));
            }
        })))
    }

    fn describe(&self) -> String {
        match self.key {
            Some(_) => "dedup_by".to_string(),
            None => "dedup".to_string(),
        }
    }
}

/// Runs a side effect per element and passes the element through.
///
/// Unlike every other user-code stage, effect failures (errors or panics) are
/// not fatal: they are logged and reported as a `fatal: false` stage error
/// event, and the element continues downstream.
pub struct TapStage {
    effect: Effect,
}

impl TapStage {
    pub fn new<F>(effect: F) -> Self
    where
        F: Fn(&Element) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            effect: Arc::new(effect),
        }
    }
}

impl Stage for TapStage {
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream> {
        let effect = Arc::clone(&self.effect);
        let ctx = ctx.clone();
        let mut upstream = Fused::new(input);
        Ok(Box::new(std::iter::from_fn(move || {
            let element = match upstream.pull()? {
                Ok(element) => element,
                Err(e) => return Some(Err(e)),
            };
            let failure = match catch_unwind(AssertUnwindSafe(|| effect(&element))) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(error) = failure {
                warn!(stage = ctx.label(), %element, %error, "tap effect failed");
                ctx.events().emit(
                    Event::new(STAGE_ERROR)
                        .measure("error", error)
                        .measure("element", element.clone())
                        .meta("stage", ctx.label())
                        .meta("index", ctx.index())
                        .meta("fatal", false),
                );
            }
            Some(Ok(element))
        })))
    }

    fn describe(&self) -> String {
        "tap".to_string()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::test_support::*;
    use crate::stage::StageOptions;
    use serde_json::json;

    fn ints(values: &[i64]) -> Vec<Element> {
        values.iter().map(|v| json!(v)).collect()
    }

    #[test]
    fn test_map_stage() {
        let stage = MapStage::new(|v| Ok(json!(v.as_i64().unwrap_or(0) * 2)));
        let output = run_stage(&stage, StageOptions::new(), ints(&[1, 2, 3])).unwrap();
        assert_eq!(output, ints(&[2, 4, 6]));
    }

    #[test]
    fn test_map_identity() {
        let stage = MapStage::new(|v| Ok(v.clone()));
        let input = vec![json!("a"), json!({"k": [1, 2]}), json!(null), json!(1.5)];
        let output = run_stage(&stage, StageOptions::new(), input.clone()).unwrap();
        assert_eq!(output, input);
        assert!(run_stage(&stage, StageOptions::new(), vec![]).unwrap().is_empty());
    }

    #[test]
    fn test_map_error_terminates() {
        let stage = MapStage::new(|v| {
            if v == &json!(2) {
                Err("two is not allowed".into())
            } else {
                Ok(v.clone())
            }
        });
        let ctx = context("map", StageOptions::new());
        let output: Vec<_> = stage.process(stream(ints(&[1, 2, 3])), &ctx).unwrap().collect();

        assert_eq!(output.len(), 2);
        assert_eq!(output[0].as_ref().unwrap(), &json!(1));
        match &output[1] {
            Err(PipelineError::StageExecution { stage, element, source }) => {
                assert_eq!(stage, "map");
                assert_eq!(element, &json!(2));
                assert_eq!(source.to_string(), "two is not allowed");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_filter_stage() {
        let stage = FilterStage::new(|v| Ok(v.as_i64().unwrap_or(0) % 2 == 0));
        let output = run_stage(&stage, StageOptions::new(), ints(&[1, 2, 3, 4])).unwrap();
        assert_eq!(output, ints(&[2, 4]));
    }

    #[test]
    fn test_filter_error_propagates() {
        let stage = FilterStage::new(|v| v.as_i64().map(|n| n > 0).ok_or_else(|| "not a number".into()));
        let result = run_stage(&stage, StageOptions::new(), vec![json!(1), json!("x"), json!(2)]);
        assert!(matches!(result, Err(PipelineError::StageExecution { .. })));
    }

    #[test]
    fn test_flat_map_concatenates() {
        let stage = FlatMapStage::new(|v| {
            let n = v.as_i64().unwrap_or(0);
            Ok(json!(vec![n; n as usize]))
        });
        let output = run_stage(&stage, StageOptions::new(), ints(&[1, 0, 2])).unwrap();
        assert_eq!(output, ints(&[1, 2, 2]));
    }

    #[test]
    fn test_flat_map_rejects_non_array() {
        let stage = FlatMapStage::new(|v| Ok(v.clone()));
        let result = run_stage(&stage, StageOptions::new(), ints(&[1]));
        match result {
            Err(PipelineError::InvalidStageResult { found, .. }) => assert_eq!(found, "a number"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_flat_map_error_terminates() {
        let stage = FlatMapStage::new(|v| {
            if v == &json!(2) {
                Err("cannot expand".into())
            } else {
                Ok(json!([v.clone(), v.clone()]))
            }
        });
        let ctx = context("flat_map", StageOptions::new());
        let output: Vec<_> = stage.process(stream(ints(&[1, 2, 3])), &ctx).unwrap().collect();

        assert_eq!(output.len(), 3);
        assert_eq!(output[0].as_ref().unwrap(), &json!(1));
        assert_eq!(output[1].as_ref().unwrap(), &json!(1));
        match &output[2] {
            Err(PipelineError::StageExecution { stage, element, source }) => {
                assert_eq!(stage, "flat_map");
                assert_eq!(element, &json!(2));
                assert_eq!(source.to_string(), "cannot expand");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_take_stage() {
        let options = StageOptions::new().with("count", 5);
        let all = run_stage(&TakeStage, options.clone(), ints(&[1, 2, 3, 4, 5])).unwrap();
        assert_eq!(all, ints(&[1, 2, 3, 4, 5]));

        let some = run_stage(&TakeStage, StageOptions::new().with("count", 2), ints(&[1, 2, 3])).unwrap();
        assert_eq!(some, ints(&[1, 2]));

        let short = run_stage(&TakeStage, options, ints(&[1, 2])).unwrap();
        assert_eq!(short, ints(&[1, 2]));
    }

    #[test]
    fn test_take_stops_pulling() {
        let pulled = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let input: ElementStream = Box::new((0..).map(move |n| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(json!(n))
        }));
        let ctx = context("take", StageOptions::new().with("count", 3));
        let output: Vec<_> = TakeStage.process(input, &ctx).unwrap().collect();
        assert_eq!(output.len(), 3);
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn test_take_rejects_negative_count() {
        let ctx = context("take", StageOptions::new().with("count", -1));
        assert!(matches!(
            TakeStage.process(stream(vec![]), &ctx),
            Err(PipelineError::Configuration { .. })
        ));
    }

    #[test]
    fn test_drop_stage() {
        let output = run_stage(&DropStage, StageOptions::new().with("count", 2), ints(&[1, 2, 3, 4])).unwrap();
        assert_eq!(output, ints(&[3, 4]));
        let none = run_stage(&DropStage, StageOptions::new().with("count", 9), ints(&[1, 2])).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_drop_zero_passes_everything() {
        let output = run_stage(&DropStage, StageOptions::new().with("count", 0), ints(&[1, 2, 3])).unwrap();
        assert_eq!(output, ints(&[1, 2, 3]));
    }

    #[test]
    fn test_dedup_consecutive_only() {
        let output = run_stage(&DedupStage::new(), StageOptions::new(), ints(&[1, 1, 2, 2, 2, 3, 1, 1])).unwrap();
        assert_eq!(output, ints(&[1, 2, 3, 1]));

        let again = run_stage(&DedupStage::new(), StageOptions::new(), output.clone()).unwrap();
        assert_eq!(again, output);
    }

    #[test]
    fn test_dedup_by_key() {
        let stage = DedupStage::by_key(|v| v["user"].clone());
        let input = vec![
            json!({"user": "a", "n": 1}),
            json!({"user": "a", "n": 2}),
            json!({"user": "b", "n": 3}),
        ];
        let output = run_stage(&stage, StageOptions::new(), input).unwrap();
        assert_eq!(output.len(), 2);
        assert_eq!(output[1]["n"], 3);
    }

    #[test]
    fn test_tap_failure_is_not_fatal() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let stage = TapStage::new(move |v| {
            log.lock().push(v.clone());
            if v == &json!(2) {
                return Err("effect failed".into());
            }
            if v == &json!(3) {
                panic!("effect panicked");
            }
            Ok(())
        });
        let (ctx, recorder) = recording_context("tap", StageOptions::new());
        let output: Result<Vec<_>> = stage.process(stream(ints(&[1, 2, 3, 4])), &ctx).unwrap().collect();

        assert_eq!(output.unwrap(), ints(&[1, 2, 3, 4]));
        assert_eq!(seen.lock().len(), 4);

        let errors = recorder.named(&["pipeline", "stage", "error"]);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].measurements["error"], "effect failed");
        assert_eq!(errors[1].measurements["error"], "effect panicked");
        assert_eq!(errors[0].metadata["fatal"], false);
    }
}
