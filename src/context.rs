//! Per-run pipeline state.
//!
//! A [`PipelineContext`] is created when a pipeline starts and cloned into
//! every task it spawns. It carries the cancellation token, a count of tasks
//! still running, and the pipeline's state machine.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::emit;
use crate::metrics::events::StateChanged;

/// Lifecycle of a pipeline run.
///
/// `Created → Running → (Draining | Cancelling) → Terminated`. Cancellation
/// wins over draining: once `Cancelling`, the pipeline never returns to
/// `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Draining,
    Cancelling,
    Terminated,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Created => "created",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Cancelling => "cancelling",
            PipelineState::Terminated => "terminated",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Draining)
                | (Running, Cancelling)
                | (Draining, Cancelling)
                | (Running, Terminated)
                | (Draining, Terminated)
                | (Cancelling, Terminated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Terminated)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared state for one pipeline run.
#[derive(Clone)]
pub struct PipelineContext {
    name: Arc<str>,
    shutdown: CancellationToken,
    active_tasks: Arc<AtomicUsize>,
    state: Arc<watch::Sender<PipelineState>>,
}

impl PipelineContext {
    /// Create a context in the `Created` state.
    pub fn new(name: impl Into<Arc<str>>, shutdown: CancellationToken) -> Self {
        let (state, _) = watch::channel(PipelineState::Created);
        Self {
            name: name.into(),
            shutdown,
            active_tasks: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(state),
        }
    }

    /// Name of the pipeline, used for log and metric labels.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Broadcast cancellation to every task. Idempotent.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of tasks that have entered and not yet exited.
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Acquire)
    }

    /// Register a running task; the returned guard deregisters it on drop.
    pub fn enter_task(&self) -> TaskGuard {
        self.active_tasks.fetch_add(1, Ordering::AcqRel);
        TaskGuard {
            active_tasks: Arc::clone(&self.active_tasks),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Move to `next` if the transition is legal. Returns whether it happened.
    pub fn transition(&self, next: PipelineState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            debug!(pipeline = %self.name, state = %next, "Pipeline state changed");
            emit!(StateChanged {
                state: next.as_str(),
                pipeline: self.name.to_string(),
            });
        }
        changed
    }
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("active_tasks", &self.active_tasks())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Keeps a task counted as active until dropped.
#[derive(Debug)]
pub struct TaskGuard {
    active_tasks: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.active_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}
