use crate::error::{PipelineError, Result};
use crate::stage::Element;
use parking_lot::Mutex;
use std::sync::Arc;

/// Raw element iterator produced by a source
pub type SourceIter = Box<dyn Iterator<Item = Element> + Send>;

/// A producer of a finite or infinite element sequence
///
/// `open` is called once per run. Sources that cannot replay their sequence
/// return `SourceUnavailable` on a second `open`.
pub trait Source: Send + Sync + 'static {
    fn open(&self) -> Result<SourceIter>;

    fn describe(&self) -> String {
        "source".to_string()
    }
}

/// Wraps an existing iterator; can be opened exactly once
pub struct IterSource {
    iter: Mutex<Option<SourceIter>>,
}

impl IterSource {
    /// Wrap `iter`; the source can be opened once
    pub fn new<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Element>,
        I::IntoIter: Send + 'static,
    {
        Self {
            iter: Mutex::new(Some(Box::new(iter.into_iter()))),
        }
    }
}

impl Source for IterSource {
    fn open(&self) -> Result<SourceIter> {
        self.iter
            .lock()
            .take()
            .ok_or_else(|| PipelineError::SourceUnavailable("iterator source already consumed".into()))
    }

    fn describe(&self) -> String {
        "iter".to_string()
    }
}

/// A finite list of elements, replayed from the start on every open
#[derive(Debug, Clone)]
pub struct VecSource {
    elements: Arc<Vec<Element>>,
}

impl VecSource {
    /// Create a replayable source over `elements`
    pub fn new(elements: Vec<Element>) -> Self {
        Self {
            elements: Arc::new(elements),
        }
    }

    /// Number of elements produced per open
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the source produces nothing
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl Source for VecSource {
    fn open(&self) -> Result<SourceIter> {
        let elements = Arc::clone(&self.elements);
        Ok(Box::new((0..elements.len()).map(move |i| elements[i].clone())))
    }

    fn describe(&self) -> String {
        format!("vec[{}]", self.elements.len())
    }
}

/// Builds a fresh iterator from a factory on every open
pub struct FnSource<F> {
    factory: F,
}

impl<F> FnSource<F>
where
    F: Fn() -> SourceIter + Send + Sync + 'static,
{
    /// Call `factory` for a fresh iterator on every open
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F> Source for FnSource<F>
where
    F: Fn() -> SourceIter + Send + Sync + 'static,
{
    fn open(&self) -> Result<SourceIter> {
        Ok((self.factory)())
    }

    fn describe(&self) -> String {
        "fn".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_iter_source_is_one_shot() {
        let source = IterSource::new((1..=3).map(|n| json!(n)));
        let first: Vec<Element> = source.open().unwrap().collect();
        assert_eq!(first, vec![json!(1), json!(2), json!(3)]);
        assert!(matches!(source.open(), Err(PipelineError::SourceUnavailable(_))));
    }

    #[test]
    fn test_vec_source_replays() {
        let source = VecSource::new(vec![json!("a"), json!("b")]);
        assert_eq!(source.open().unwrap().count(), 2);
        assert_eq!(source.open().unwrap().count(), 2);
        assert_eq!(source.describe(), "vec[2]");
    }

    #[test]
    fn test_fn_source_is_restartable() {
        let source = FnSource::new(|| Box::new((0..).map(|n| json!(n))) as SourceIter);
        assert_eq!(source.open().unwrap().take(2).count(), 2);
        assert_eq!(source.open().unwrap().next(), Some(json!(0)));
    }
}
