//! Per-invocation deadline, abort signal, and cleanup stack.
//!
//! Every top-level invocation is wrapped by a [`ProgressController`]. The
//! controller races the wrapped operation against a forced-abort signal
//! (deadline elapsed, or an explicit [`abort`](ProgressController::abort))
//! and guarantees the invocation resolves exactly once: with the operation's
//! own outcome if it settled first, or with a timeout/abort error if the
//! forced abort fired first.
//!
//! The [`Progress`] handle is passed into the running operation and exposes
//! logging, the remaining time budget, abort-only cleanup registration, and a
//! cooperative cancellation check.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use futures_util::future::BoxFuture;

use crate::error::{Error, Result};

/// One accumulated log line of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub log_name: String,
    pub message: String,
}

/// Per-invocation record: created when an invocation begins, mutated by
/// progress log calls while it runs, frozen when it settles. Surfaced to
/// observers; never sent over the wire.
#[derive(Debug, Clone)]
pub struct CallMetadata {
    pub id: u32,
    pub type_name: String,
    pub method: String,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
    pub log: Vec<LogLine>,
}

impl CallMetadata {
    pub fn new(id: u32, type_name: &str, method: &str) -> Self {
        Self {
            id,
            type_name: type_name.to_string(),
            method: method.to_string(),
            start_time: Instant::now(),
            end_time: None,
            log: Vec::new(),
        }
    }

    /// Wall-clock duration of the call, once it has settled.
    pub fn duration(&self) -> Option<Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Before,
    Running,
    Finished,
    Aborted,
}

/// A recovery action that runs only if the invocation is aborted.
pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Shared {
    state: Mutex<State>,
    cleanups: Mutex<Vec<Cleanup>>,
    deadline: Mutex<Option<Instant>>,
    metadata: Mutex<CallMetadata>,
    log_name: Mutex<String>,
    abort_tx: Mutex<Option<oneshot::Sender<Error>>>,
}

/// Owns one invocation's deadline, abort signal, and cleanup stack.
pub struct ProgressController {
    shared: Arc<Shared>,
    abort_rx: Mutex<Option<oneshot::Receiver<Error>>>,
}

impl ProgressController {
    pub fn new(metadata: CallMetadata) -> Self {
        let (abort_tx, abort_rx) = oneshot::channel();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Before),
                cleanups: Mutex::new(Vec::new()),
                deadline: Mutex::new(None),
                metadata: Mutex::new(metadata),
                log_name: Mutex::new("api".to_string()),
                abort_tx: Mutex::new(Some(abort_tx)),
            }),
            abort_rx: Mutex::new(Some(abort_rx)),
        }
    }

    /// Sets the log name attached to subsequent progress log lines.
    pub fn set_log_name(&self, log_name: &str) {
        *self.shared.log_name.lock() = log_name.to_string();
    }

    /// Snapshot of the call metadata.
    pub fn metadata(&self) -> CallMetadata {
        self.shared.metadata.lock().clone()
    }

    /// Forcefully aborts the running invocation with the given error. A
    /// no-op if the invocation already settled.
    pub fn abort(&self, error: Error) {
        if let Some(tx) = self.shared.abort_tx.lock().take() {
            let _ = tx.send(error);
        }
    }

    /// Runs `task` under this controller with an optional deadline.
    ///
    /// The task future races the forced-abort signal; whichever settles
    /// first determines the terminal state. On abort, all queued cleanups
    /// run in registration order and the losing task future is dropped, so
    /// its late result can never surface.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub async fn run<T, F, Fut>(&self, timeout: Option<Duration>, task: F) -> Result<T>
    where
        F: FnOnce(Progress) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut state = self.shared.state.lock();
            assert_eq!(
                *state,
                State::Before,
                "ProgressController::run can only be called once"
            );
            *state = State::Running;
        }
        if let Some(t) = timeout {
            *self.shared.deadline.lock() = Some(Instant::now() + t);
        }
        let abort_rx = self
            .abort_rx
            .lock()
            .take()
            .expect("ProgressController::run can only be called once");

        let progress = Progress {
            shared: Arc::clone(&self.shared),
        };

        let forced_abort = async move {
            let deadline_elapsed = async {
                match timeout {
                    Some(t) => {
                        tokio::time::sleep(t).await;
                        Error::Timeout(format!("Timeout {}ms exceeded.", t.as_millis()))
                    }
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                error = abort_rx => {
                    error.unwrap_or_else(|_| Error::Aborted("Progress abandoned".to_string()))
                }
                error = deadline_elapsed => error,
            }
        };

        let task_future = task(progress);
        tokio::pin!(task_future);

        let outcome = tokio::select! {
            result = &mut task_future => result,
            error = forced_abort => Err(error),
        };

        let result = match outcome {
            Ok(value) => {
                *self.shared.state.lock() = State::Finished;
                Ok(value)
            }
            Err(error) => {
                *self.shared.state.lock() = State::Aborted;
                let cleanups: Vec<Cleanup> = std::mem::take(&mut *self.shared.cleanups.lock());
                for cleanup in cleanups {
                    run_cleanup(cleanup).await;
                }
                Err(error)
            }
        };

        self.shared.metadata.lock().end_time = Some(Instant::now());
        result
    }
}

/// The live handle passed into a running invocation.
#[derive(Clone)]
pub struct Progress {
    shared: Arc<Shared>,
}

impl Progress {
    /// Appends to the call log. A no-op once the invocation settled, so
    /// late log lines from an abandoned operation are discarded.
    pub fn log(&self, message: impl Into<String>) {
        if *self.shared.state.lock() != State::Running {
            return;
        }
        let line = LogLine {
            log_name: self.shared.log_name.lock().clone(),
            message: message.into(),
        };
        tracing::debug!(log_name = %line.log_name, "{}", line.message);
        self.shared.metadata.lock().log.push(line);
    }

    /// Returns true while the invocation is running.
    pub fn is_running(&self) -> bool {
        *self.shared.state.lock() == State::Running
    }

    /// Remaining time budget; effectively unbounded when no deadline was
    /// set.
    pub fn time_until_deadline(&self) -> Duration {
        match *self.shared.deadline.lock() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Registers a recovery action to run if the invocation is aborted.
    ///
    /// While running, the action is queued; queued actions run in
    /// registration order on abort, and never on a normal finish. If the
    /// invocation has already settled, the action is invoked immediately and
    /// its future driven in the background. Each action's own failure is
    /// logged and swallowed.
    pub fn cleanup_when_aborted<F>(&self, cleanup: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        {
            let state = self.shared.state.lock();
            if *state == State::Running {
                self.shared.cleanups.lock().push(Box::new(cleanup));
                return;
            }
        }
        let future = cleanup();
        tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::debug!("Progress cleanup failed (ignored): {e}");
            }
        });
    }

    /// Cooperative cancellation check for long-running internal work.
    pub fn throw_if_aborted(&self) -> Result<()> {
        if *self.shared.state.lock() == State::Aborted {
            Err(Error::Aborted("Operation aborted".to_string()))
        } else {
            Ok(())
        }
    }

    /// Snapshot of the call metadata.
    pub fn metadata(&self) -> CallMetadata {
        self.shared.metadata.lock().clone()
    }
}

async fn run_cleanup(cleanup: Cleanup) {
    if let Err(e) = cleanup().await {
        tracing::debug!("Progress cleanup failed (ignored): {e}");
    }
}
