//! Completion handles for asynchronously issued collectives.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

use super::types::OpCode;
use crate::utils::error::{CollectiveError, Result};

/// Lifecycle of a `Work`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Failed | WorkState::Canceled)
    }
}

#[derive(Debug)]
struct Status {
    state: WorkState,
    error: Option<CollectiveError>,
}

struct WorkInner {
    opcode: OpCode,
    sequence_tag: u64,
    status: Mutex<Status>,
    done: Condvar,
    done_async: Notify,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
}

/// Handle shared between the caller and the engine for one operation.
///
/// Cloning is cheap; every clone observes the same state.
#[derive(Clone)]
pub struct Work {
    inner: Arc<WorkInner>,
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("opcode", &self.inner.opcode)
            .field("sequence_tag", &self.inner.sequence_tag)
            .field("state", &self.poll())
            .finish()
    }
}

impl Work {
    pub(crate) fn new(opcode: OpCode, sequence_tag: u64) -> Self {
        Self {
            inner: Arc::new(WorkInner {
                opcode,
                sequence_tag,
                status: Mutex::new(Status { state: WorkState::Pending, error: None }),
                done: Condvar::new(),
                done_async: Notify::new(),
                cancel_requested: AtomicBool::new(false),
                cancel_notify: Notify::new(),
            }),
        }
    }

    /// A Work that finished before it was handed out.
    pub(crate) fn completed(opcode: OpCode, sequence_tag: u64) -> Self {
        let work = Self::new(opcode, sequence_tag);
        work.finish(Ok(()));
        work
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.inner.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn opcode(&self) -> OpCode {
        self.inner.opcode
    }

    pub fn sequence_tag(&self) -> u64 {
        self.inner.sequence_tag
    }

    /// Current state without blocking.
    pub fn poll(&self) -> WorkState {
        self.status().state
    }

    pub fn is_completed(&self) -> bool {
        self.poll().is_terminal()
    }

    /// The error of a failed Work.
    pub fn error(&self) -> Option<CollectiveError> {
        self.status().error.clone()
    }

    fn outcome(status: &Status) -> Result<()> {
        match status.state {
            WorkState::Completed => Ok(()),
            WorkState::Canceled => Err(status.error.clone().unwrap_or(CollectiveError::Canceled)),
            _ => Err(status
                .error
                .clone()
                .unwrap_or_else(|| CollectiveError::InvalidArgument("work failed without an error".to_string()))),
        }
    }

    /// Block the calling thread until the Work is terminal.
    ///
    /// With a timeout, expiry returns `TimedOut` and leaves the Work running.
    /// Must not be called from inside the group's runtime.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status = self.status();
        while !status.state.is_terminal() {
            match deadline {
                None => {
                    status = self
                        .inner
                        .done
                        .wait(status)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CollectiveError::TimedOut(timeout.unwrap_or_default()));
                    }
                    let (guard, _) = self
                        .inner
                        .done
                        .wait_timeout(status, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    status = guard;
                }
            }
        }
        Self::outcome(&status)
    }

    /// Await completion from async code.
    pub async fn wait_async(&self) -> Result<()> {
        loop {
            let notified = self.inner.done_async.notified();
            {
                let status = self.status();
                if status.state.is_terminal() {
                    return Self::outcome(&status);
                }
            }
            notified.await;
        }
    }

    /// Request cancellation.
    ///
    /// A pending Work becomes `Canceled` at once. A running Work stops before
    /// its next step and any blocked receive is interrupted. Has no effect on
    /// a terminal Work.
    pub fn cancel(&self) {
        let mut status = self.status();
        match status.state {
            WorkState::Pending => {
                self.inner.cancel_requested.store(true, Ordering::SeqCst);
                status.state = WorkState::Canceled;
                status.error = Some(CollectiveError::Canceled);
                drop(status);
                debug!(seq = self.inner.sequence_tag, op = %self.inner.opcode, "Canceled pending work");
                self.inner.cancel_notify.notify_waiters();
                self.wake();
            }
            WorkState::Running => {
                self.inner.cancel_requested.store(true, Ordering::SeqCst);
                drop(status);
                debug!(seq = self.inner.sequence_tag, op = %self.inner.opcode, "Cancel requested");
                self.inner.cancel_notify.notify_waiters();
            }
            _ => {}
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    pub(crate) async fn canceled(&self) {
        loop {
            let notified = self.inner.cancel_notify.notified();
            if self.cancel_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Move `Pending` to `Running`. Returns false if the Work was canceled first.
    pub(crate) fn mark_running(&self) -> bool {
        let mut status = self.status();
        if status.state == WorkState::Pending && !self.cancel_requested() {
            status.state = WorkState::Running;
            true
        } else {
            false
        }
    }

    /// Record the terminal outcome. Later calls are ignored.
    pub(crate) fn finish(&self, result: Result<()>) {
        let mut status = self.status();
        if status.state.is_terminal() {
            return;
        }
        match result {
            Ok(()) => status.state = WorkState::Completed,
            Err(CollectiveError::Canceled) => {
                status.state = WorkState::Canceled;
                status.error = Some(CollectiveError::Canceled);
            }
            Err(e) => {
                status.state = WorkState::Failed;
                status.error = Some(e);
            }
        }
        drop(status);
        self.wake();
    }

    fn wake(&self) {
        self.inner.done.notify_all();
        self.inner.done_async.notify_waiters();
    }
}
