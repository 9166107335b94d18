//! One-for-one supervised execution of pipelines.
//!
//! Each submission gets its own monitor thread, which drives the pipeline on a
//! dedicated runner thread per attempt and decides, per restart policy and
//! restart budget, whether a terminated attempt is restarted. A runner that
//! crashes or gives up never touches its siblings.

use crate::error::{PipelineError, Result};
use crate::event::{global_bus, Event, EventSink, RUNNER_EXIT, RUNNER_RESTART, RUNNER_START};
use crate::pipeline::Pipeline;
use crate::stage::Element;
use crate::transform::panic_message;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Identity of a supervised runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RunnerId(u64);

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runner-{}", self.0)
    }
}

/// When a terminated runner is started again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Restart after a crash, not after normal completion
    #[default]
    Transient,
    /// Restart after a crash and after normal completion
    Permanent,
    /// Never restart
    Temporary,
}

/// Supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Restarts allowed per runner within `restart_window_ms`
    pub max_restarts: u32,
    /// Length of the rolling restart window in milliseconds
    pub restart_window_ms: u64,
}

impl SupervisorConfig {
    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_window_ms: 5000,
        }
    }
}

/// Callback receiving every element a runner pulls
pub type ElementHandler = Arc<dyn Fn(&Element) + Send + Sync>;

/// Per-submission options
#[derive(Clone, Default)]
pub struct RunOptions {
    pub name: Option<String>,
    pub restart: RestartPolicy,
    pub on_element: Option<ElementHandler>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner name; defaults to the pipeline name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// When the runner is restarted
    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Called with every element the pipeline produces
    pub fn on_element<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Element) + Send + Sync + 'static,
    {
        self.on_element = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("name", &self.name)
            .field("restart", &self.restart)
            .field("on_element", &self.on_element.is_some())
            .finish()
    }
}

/// How a runner finally terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerExit {
    /// The pipeline ran to exhaustion
    Completed { restarts: u32 },
    /// The runner was stopped through the supervisor
    Stopped { restarts: u32 },
    /// The runner crashed and was not (or could no longer be) restarted
    GaveUp { reason: String, restarts: u32 },
}

impl RunnerExit {
    /// Restarts performed before this exit
    pub fn restarts(&self) -> u32 {
        match self {
            RunnerExit::Completed { restarts }
            | RunnerExit::Stopped { restarts }
            | RunnerExit::GaveUp { restarts, .. } => *restarts,
        }
    }

    /// Turn a give-up into a `RunnerCrashed` error, yielding the restart count otherwise
    pub fn into_result(self) -> Result<u32> {
        match self {
            RunnerExit::GaveUp { reason, .. } => Err(PipelineError::RunnerCrashed(reason)),
            exit => Ok(exit.restarts()),
        }
    }
}

/// Snapshot of a live runner
#[derive(Debug, Clone)]
pub struct RunnerInfo {
    pub id: RunnerId,
    pub name: String,
    pub pipeline: Pipeline,
    pub restart: RestartPolicy,
    pub restarts: u32,
    pub uptime: Duration,
}

/// Registry entry for a supervised execution
struct RunningPipelineHandle {
    name: String,
    pipeline: Pipeline,
    restart: RestartPolicy,
    restarts: u32,
    started_at: Instant,
    cancel: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl RunningPipelineHandle {
    fn info(&self, id: RunnerId) -> RunnerInfo {
        RunnerInfo {
            id,
            name: self.name.clone(),
            pipeline: self.pipeline.clone(),
            restart: self.restart,
            restarts: self.restarts,
            uptime: self.started_at.elapsed(),
        }
    }
}

/// Returned by `submit`; waits for the runner's final exit
#[derive(Debug)]
pub struct RunnerHandle {
    id: RunnerId,
    exit: Receiver<RunnerExit>,
}

impl RunnerHandle {
    pub fn id(&self) -> RunnerId {
        self.id
    }

    /// Block until the runner terminates for good
    pub fn wait(self) -> Result<RunnerExit> {
        self.exit
            .recv()
            .map_err(|_| PipelineError::ThreadError(format!("{} exited without a report", self.id)))
    }

    /// Block up to `timeout`; `None` if the runner is still going
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RunnerExit> {
        match self.exit.recv_timeout(timeout) {
            Ok(exit) => Some(exit),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

struct Inner {
    config: SupervisorConfig,
    registry: Mutex<HashMap<RunnerId, RunningPipelineHandle>>,
    next_id: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl Inner {
    fn emit(&self, id: RunnerId, name: &str, event: Event) {
        let event = event.meta("runner", id.to_string()).meta("name", name);
        self.events.emit(&event);
    }
}

/// Supervises independently running pipelines
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor reporting to the global event bus
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_sink(config, global_bus())
    }

    /// Create a supervisor reporting runner lifecycle events to `events`
    pub fn with_sink(config: SupervisorConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Start a runner for `pipeline`
    pub fn submit(&self, pipeline: Pipeline, options: RunOptions) -> Result<RunnerHandle> {
        if !pipeline.has_source() {
            return Err(PipelineError::MissingSource);
        }
        let id = RunnerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| pipeline.name().to_string());
        let restart = options.restart;
        let cancel = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = channel::bounded(1);

        // Hold the registry lock across spawn so the monitor cannot try to
        // deregister before the entry exists.
        let mut registry = self.inner.registry.lock();
        let monitor = {
            let inner = Arc::clone(&self.inner);
            let pipeline = pipeline.clone();
            let cancel = Arc::clone(&cancel);
            let name = name.clone();
            thread::Builder::new()
                .name(format!("pipeflow-{id}"))
                .spawn(move || monitor(inner, id, name, pipeline, options, cancel, exit_tx))
                .map_err(|e| PipelineError::ThreadError(e.to_string()))?
        };
        registry.insert(
            id,
            RunningPipelineHandle {
                name,
                pipeline,
                restart,
                restarts: 0,
                started_at: Instant::now(),
                cancel,
                monitor: Some(monitor),
            },
        );
        Ok(RunnerHandle { id, exit: exit_rx })
    }

    /// Consistent snapshot of every live runner
    pub fn list(&self) -> Vec<RunnerInfo> {
        let registry = self.inner.registry.lock();
        let mut runners: Vec<RunnerInfo> = registry.iter().map(|(id, h)| h.info(*id)).collect();
        runners.sort_by_key(|r| r.id);
        runners
    }

    /// Look up a runner; `None` if it is unknown or has already exited
    pub fn lookup(&self, id: RunnerId) -> Option<RunnerInfo> {
        self.inner.registry.lock().get(&id).map(|h| h.info(id))
    }

    /// Number of live runners
    pub fn running_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Ask a runner to stop at its next pull. Returns false if it is not running.
    pub fn stop(&self, id: RunnerId) -> bool {
        match self.inner.registry.lock().get(&id) {
            Some(handle) => {
                handle.cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Stop every runner and wait for their monitors to finish
    pub fn shutdown(&self) {
        let monitors: Vec<JoinHandle<()>> = {
            let mut registry = self.inner.registry.lock();
            registry
                .values_mut()
                .filter_map(|handle| {
                    handle.cancel.store(true, Ordering::Relaxed);
                    handle.monitor.take()
                })
                .collect()
        };
        for monitor in monitors {
            if monitor.join().is_err() {
                warn!("supervisor monitor thread panicked during shutdown");
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

/// Result of one runner attempt
enum Attempt {
    Completed,
    Stopped,
    Crashed(String),
}

/// Rolling-window restart budget
struct RestartBudget {
    max_restarts: u32,
    window: Duration,
    history: VecDeque<Instant>,
}

impl RestartBudget {
    fn new(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: config.restart_window(),
            history: VecDeque::new(),
        }
    }

    /// Record a restart if the budget allows one
    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        while let Some(oldest) = self.history.front() {
            if now.duration_since(*oldest) > self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
        if self.history.len() >= self.max_restarts as usize {
            return false;
        }
        self.history.push_back(now);
        true
    }
}

fn monitor(
    inner: Arc<Inner>,
    id: RunnerId,
    name: String,
    pipeline: Pipeline,
    options: RunOptions,
    cancel: Arc<AtomicBool>,
    exit_tx: Sender<RunnerExit>,
) {
    let mut budget = RestartBudget::new(&inner.config);
    let mut restarts: u32 = 0;

    let exit = loop {
        inner.emit(id, &name, Event::new(RUNNER_START).measure("restarts", restarts));
        let attempt = run_attempt(id, &pipeline, &options, &cancel);

        let reason = match attempt {
            Attempt::Stopped => break RunnerExit::Stopped { restarts },
            _ if cancel.load(Ordering::Relaxed) => break RunnerExit::Stopped { restarts },
            Attempt::Completed if options.restart != RestartPolicy::Permanent => {
                break RunnerExit::Completed { restarts }
            }
            Attempt::Completed => "completed".to_string(),
            Attempt::Crashed(reason) => {
                warn!(runner = %id, %name, %reason, "runner crashed");
                if options.restart == RestartPolicy::Temporary {
                    break RunnerExit::GaveUp { reason, restarts };
                }
                reason
            }
        };

        if !budget.try_acquire() {
            warn!(runner = %id, %name, restarts, "restart budget exhausted, giving up");
            break RunnerExit::GaveUp { reason, restarts };
        }
        restarts += 1;
        if let Some(handle) = inner.registry.lock().get_mut(&id) {
            handle.restarts = restarts;
        }
        info!(runner = %id, %name, restarts, "restarting runner");
        inner.emit(
            id,
            &name,
            Event::new(RUNNER_RESTART)
                .measure("restarts", restarts)
                .meta("reason", reason),
        );
    };

    inner.registry.lock().remove(&id);
    let status = match &exit {
        RunnerExit::Completed { .. } => "completed",
        RunnerExit::Stopped { .. } => "stopped",
        RunnerExit::GaveUp { .. } => "gave_up",
    };
    inner.emit(id, &name, Event::new(RUNNER_EXIT).meta("status", status));
    // The handle may have been dropped; nobody is waiting then.
    let _ = exit_tx.send(exit);
}

fn run_attempt(
    id: RunnerId,
    pipeline: &Pipeline,
    options: &RunOptions,
    cancel: &Arc<AtomicBool>,
) -> Attempt {
    let pipeline = pipeline.clone();
    let on_element = options.on_element.clone();
    let cancel = Arc::clone(cancel);
    let spawned = thread::Builder::new()
        .name(format!("pipeflow-{id}-run"))
        .spawn(move || drive(&pipeline, on_element.as_ref(), &cancel));

    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => return Attempt::Crashed(format!("failed to spawn runner: {e}")),
    };
    match handle.join() {
        Ok(Ok(attempt)) => attempt,
        Ok(Err(e)) => Attempt::Crashed(e.to_string()),
        Err(panic) => Attempt::Crashed(format!("panic: {}", panic_message(panic.as_ref()))),
    }
}

/// Pull the pipeline to exhaustion, checking for cancellation between pulls
fn drive(
    pipeline: &Pipeline,
    on_element: Option<&ElementHandler>,
    cancel: &AtomicBool,
) -> Result<Attempt> {
    let mut flow = pipeline.run()?;
    loop {
        if cancel.load(Ordering::Relaxed) {
            flow.halt();
            return Ok(Attempt::Stopped);
        }
        match flow.next() {
            Some(item) => {
                let element = item?;
                if let Some(handler) = on_element {
                    handler(&element);
                }
            }
            None => return Ok(Attempt::Completed),
        }
    }
}
