//! Tumbling and sliding windows.
//!
//! Windows are emitted as `Element::Array` values holding the grouped
//! elements in arrival order.
//!
//! | mode     | trigger  | options                          | trailing partial |
//! |----------|----------|----------------------------------|------------------|
//! | tumbling | count    | `size`                           | emitted          |
//! | tumbling | duration | `duration_us` or `duration_ms`   | emitted          |
//! | sliding  | count    | `size`, `slide` (default `size`) | never            |

use crate::error::{PipelineError, Result};
use crate::stage::{Element, ElementStream, Fused, Stage, StageContext, StageOptions};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A validated window configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    /// Non-overlapping groups of `size` consecutive elements
    TumblingCount { size: usize },
    /// Non-overlapping groups spanning `duration` from their first element
    TumblingDuration { duration: Duration },
    /// Overlapping groups of `size` elements advancing by `slide`
    Sliding { size: usize, slide: usize },
}

impl WindowSpec {
    /// Validate window options.
    ///
    /// `type` defaults to `tumbling`. Tumbling windows need either `size` or
    /// a duration (`duration_us` or `duration_ms`); sliding windows need
    /// `size` and accept `slide <= size`.
    pub fn from_options(options: &StageOptions) -> Result<Self> {
        const STAGE: &str = "window";
        match options.optional_str(STAGE, "type")?.unwrap_or("tumbling") {
            "tumbling" => {
                if options.contains("size") {
                    Ok(WindowSpec::TumblingCount {
                        size: options.require_positive(STAGE, "size")?,
                    })
                } else if let Some(duration) = options.optional_duration(STAGE, "duration")? {
                    Ok(WindowSpec::TumblingDuration { duration })
                } else {
                    Err(PipelineError::config(
                        STAGE,
                        "tumbling window requires `size` or `duration_ms`",
                    ))
                }
            }
            "sliding" => {
                let has_duration =
                    options.contains("duration_us") || options.contains("duration_ms");
                if has_duration && !options.contains("size") {
                    return Err(PipelineError::config(
                        STAGE,
                        "sliding window requires a count `size`, duration is not supported",
                    ));
                }
                let size = options.require_positive(STAGE, "size")?;
                let slide = options.positive_or(STAGE, "slide", size)?;
                if slide > size {
                    return Err(PipelineError::config(
                        STAGE,
                        format!("slide ({slide}) must not exceed size ({size})"),
                    ));
                }
                Ok(WindowSpec::Sliding { size, slide })
            }
            other => Err(PipelineError::config(
                STAGE,
                format!("unknown window type `{other}`"),
            )),
        }
    }

    /// Stage options equivalent to this window
    pub fn to_options(&self) -> StageOptions {
        match *self {
            WindowSpec::TumblingCount { size } => {
                StageOptions::new().with("type", "tumbling").with("size", size)
            }
            WindowSpec::TumblingDuration { duration } => StageOptions::new()
                .with("type", "tumbling")
                .with("duration_us", duration.as_micros() as u64),
            WindowSpec::Sliding { size, slide } => StageOptions::new()
                .with("type", "sliding")
                .with("size", size)
                .with("slide", slide),
        }
    }
}

/// Accumulator for the window currently being filled
#[derive(Debug)]
struct WindowState {
    elements: Vec<Element>,
    count: usize,
    started_at: Option<Instant>,
}

impl WindowState {
    fn new() -> Self {
        Self {
            elements: Vec::new(),
            count: 0,
            started_at: None,
        }
    }

    fn push(&mut self, element: Element) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        self.elements.push(element);
        self.count += 1;
    }

    fn take(&mut self) -> Option<Element> {
        if self.elements.is_empty() {
            return None;
        }
        self.count = 0;
        self.started_at = None;
        Some(Element::Array(std::mem::take(&mut self.elements)))
    }

    fn elapsed(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }
}

/// Groups elements into windows
///
/// The stage reads its configuration from the stage options at process time;
/// `Pipeline::window` also validates them eagerly when the stage is added.
#[derive(Debug, Default)]
pub struct WindowStage;

impl Stage for WindowStage {
    fn process(&self, input: ElementStream, ctx: &StageContext) -> Result<ElementStream> {
        let upstream = Fused::new(input);
        let output: ElementStream = match WindowSpec::from_options(ctx.options())? {
            WindowSpec::TumblingCount { size } => Box::new(tumbling_count(upstream, size)),
            WindowSpec::TumblingDuration { duration } => {
                Box::new(tumbling_duration(upstream, duration))
            }
            WindowSpec::Sliding { size, slide } => Box::new(sliding(upstream, size, slide)),
        };
        Ok(output)
    }

    fn describe(&self) -> String {
        "window".to_string()
    }
}

fn tumbling_count(
    mut upstream: Fused,
    size: usize,
) -> impl Iterator<Item = Result<Element>> + Send {
    let mut state = WindowState::new();
    std::iter::from_fn(move || loop {
        match upstream.pull() {
            Some(Ok(element)) => {
                state.push(element);
                if state.count >= size {
                    return state.take().map(Ok);
                }
            }
            Some(Err(e)) => {
                state = WindowState::new();
                return Some(Err(e));
            }
            None => return state.take().map(Ok),
        }
    })
}

fn tumbling_duration(
    mut upstream: Fused,
    duration: Duration,
) -> impl Iterator<Item = Result<Element>> + Send {
    let mut state = WindowState::new();
    std::iter::from_fn(move || loop {
        match upstream.pull() {
            Some(Ok(element)) => {
                if state.count > 0 && state.elapsed() >= duration {
                    let window = state.take();
                    state.push(element);
                    return window.map(Ok);
                }
                state.push(element);
            }
            Some(Err(e)) => {
                state = WindowState::new();
                return Some(Err(e));
            }
            None => return state.take().map(Ok),
        }
    })
}

fn sliding(
    mut upstream: Fused,
    size: usize,
    slide: usize,
) -> impl Iterator<Item = Result<Element>> + Send {
    let mut buffer: VecDeque<Element> = VecDeque::with_capacity(size);
    let mut received: usize = 0;
    std::iter::from_fn(move || loop {
        match upstream.pull()? {
            Ok(element) => {
                buffer.push_back(element);
                received += 1;
                if buffer.len() >= size && (received - size) % slide == 0 {
                    let window: Vec<Element> =
                        buffer.iter().skip(buffer.len() - size).cloned().collect();
                    let trim = slide.min(buffer.len());
                    buffer.drain(..trim);
                    return Some(Ok(Element::Array(window)));
                }
            }
            Err(e) => return Some(Err(e)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::test_support::*;
    use serde_json::json;
    use std::time::Duration;

    fn range(from: i64, to: i64) -> Vec<Element> {
        (from..=to).map(|n| json!(n)).collect()
    }

    fn windows(options: StageOptions, input: Vec<Element>) -> Vec<Element> {
        run_stage(&WindowStage, options, input).unwrap()
    }

    #[test]
    fn test_tumbling_count_partitions_input() {
        for len in 0..12i64 {
            for size in 1..5usize {
                let input = range(1, len);
                let output = windows(StageOptions::new().with("size", size), input.clone());

                let flattened: Vec<Element> = output
                    .iter()
                    .flat_map(|w| w.as_array().cloned().unwrap_or_default())
                    .collect();
                assert_eq!(flattened, input);

                let lengths: Vec<usize> = output.iter().map(|w| w.as_array().map_or(0, Vec::len)).collect();
                if let Some((last, full)) = lengths.split_last() {
                    assert!(full.iter().all(|&l| l == size));
                    let rem = len as usize % size;
                    assert_eq!(*last, if rem == 0 { size } else { rem });
                }
            }
        }
    }

    #[test]
    fn test_tumbling_emits_trailing_window() {
        let output = windows(StageOptions::new().with("type", "tumbling").with("size", 2), range(1, 5));
        assert_eq!(output, vec![json!([1, 2]), json!([3, 4]), json!([5])]);
    }

    #[test]
    fn test_sliding_never_emits_partial() {
        let output = windows(
            StageOptions::new().with("type", "sliding").with("size", 3).with("slide", 1),
            range(1, 5),
        );
        assert_eq!(output, vec![json!([1, 2, 3]), json!([2, 3, 4]), json!([3, 4, 5])]);
    }

    #[test]
    fn test_sliding_with_step() {
        let output = windows(
            StageOptions::new().with("type", "sliding").with("size", 3).with("slide", 2),
            range(1, 8),
        );
        assert_eq!(output, vec![json!([1, 2, 3]), json!([3, 4, 5]), json!([5, 6, 7])]);
    }

    #[test]
    fn test_sliding_default_slide_is_size() {
        let output = windows(StageOptions::new().with("type", "sliding").with("size", 2), range(1, 5));
        assert_eq!(output, vec![json!([1, 2]), json!([3, 4])]);
    }

    #[test]
    fn test_tumbling_duration() {
        let input: ElementStream = Box::new((1..=4).map(|n| {
            if n == 3 {
                std::thread::sleep(Duration::from_millis(60));
            }
            Ok(json!(n))
        }));
        let ctx = context("window", StageOptions::new().with("duration_ms", 30));
        let output: Vec<Element> = WindowStage
            .process(input, &ctx)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(output, vec![json!([1, 2]), json!([3, 4])]);
    }

    #[test]
    fn test_duration_keeps_microseconds() {
        let spec = WindowSpec::TumblingDuration {
            duration: Duration::from_micros(1500),
        };
        assert_eq!(WindowSpec::from_options(&spec.to_options()).unwrap(), spec);
    }

    #[test]
    fn test_upstream_error_surfaces_once() {
        for options in [
            StageOptions::new().with("size", 3),
            StageOptions::new().with("duration_ms", 1000),
            StageOptions::new().with("type", "sliding").with("size", 2),
        ] {
            let input: ElementStream = Box::new(
                vec![
                    Ok(json!(1)),
                    Ok(json!(2)),
                    Err(PipelineError::MissingSource),
                    Ok(json!(3)),
                    Ok(json!(4)),
                ]
                .into_iter(),
            );
            let ctx = context("window", options.clone());
            let output: Vec<Result<Element>> = WindowStage.process(input, &ctx).unwrap().collect();
            let errors = output.iter().filter(|item| item.is_err()).count();
            assert_eq!(errors, 1, "{options:?}");
            assert!(output.last().map_or(false, |item| item.is_err()), "{options:?}");
        }
    }

    #[test]
    fn test_invalid_window_options() {
        let cases = vec![
            StageOptions::new().with("type", "hopping").with("size", 2),
            StageOptions::new().with("type", "tumbling"),
            StageOptions::new().with("size", 0),
            StageOptions::new().with("type", "sliding").with("size", 2).with("slide", 3),
            StageOptions::new().with("type", "sliding").with("duration_ms", 100),
            StageOptions::new().with("duration_us", 0),
            StageOptions::new().with("type", "sliding"),
        ];
        for options in cases {
            assert!(
                matches!(WindowSpec::from_options(&options), Err(PipelineError::Configuration { .. })),
                "{options:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_unknown_type_names_issue() {
        let err = WindowSpec::from_options(&StageOptions::new().with("type", "hopping")).unwrap_err();
        assert!(err.to_string().contains("hopping"));
    }

    #[test]
    fn test_window_options_round_trip() {
        let spec = WindowSpec::Sliding { size: 4, slide: 2 };
        assert_eq!(WindowSpec::from_options(&spec.to_options()).unwrap(), spec);
    }
}
