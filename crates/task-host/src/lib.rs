//! User-task registry and the script-runtime abstraction the dispatch core
//! is generic over.
//!
//! The embedded scripting interpreter is an external collaborator (see the
//! crate-level spec): this crate only assumes a task can be resumed with a
//! number of arguments and will report one of a small set of outcomes. A
//! concrete embedding supplies its own [`ScriptRuntime`]; [`test_support`]
//! ships a closure-backed one used across the workspace's test suites.

use std::fmt;
use std::hash::Hash;

use rustc_hash::FxHashSet;

pub mod test_support;

/// Opaque reference to a suspendable unit of user code.
pub trait TaskHandle: Copy + Eq + Hash + fmt::Debug + Send + 'static {}
impl<T: Copy + Eq + Hash + fmt::Debug + Send + 'static> TaskHandle for T {}

/// The result of resuming a task, per the spec's resume contract.
#[derive(Debug)]
pub enum ResumeOutcome {
    /// The task ran to completion and should be deregistered.
    Completed,
    /// The task suspended again; a watcher or pool job now owns it.
    Yielded,
    /// The task raised a script-level error.
    RuntimeError(String),
    /// Allocation failure inside the interpreter. Fatal; aborts the process.
    Oom,
    /// Any outcome the embedding can't classify. Treated as a runtime error
    /// with a synthesized message.
    InternalError(String),
}

/// Capabilities the dispatch core requires from an embedded scripting
/// layer: create is out of scope, but resume/traceback are load-bearing.
pub trait ScriptRuntime {
    type TaskHandle: TaskHandle;

    /// Resume `task` with `nargs` arguments already pushed onto its stack
    /// by the caller.
    fn resume(&mut self, task: Self::TaskHandle, nargs: u16) -> ResumeOutcome;

    /// Best-effort stack trace for a task that just errored. `None` if the
    /// embedding can't produce one.
    fn traceback(&mut self, task: Self::TaskHandle) -> Option<String>;
}

/// What the run queue should do after dispatching one resume.
#[derive(Debug)]
pub enum Disposition {
    Completed,
    Yielded,
    /// A runtime error (or oom/internal-error folded into one) occurred.
    /// The caller must latch failure and unwind the loop.
    Fatal { message: String },
}

/// Process-wide exit status, latched at most once to failure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    failed: bool,
}

impl ExitStatus {
    pub const fn new() -> Self {
        Self { failed: false }
    }

    pub fn latch_failure(&mut self) {
        self.failed = true;
    }

    pub fn code(self) -> i32 {
        if self.failed { 1 } else { 0 }
    }

    pub fn is_failure(self) -> bool {
        self.failed
    }
}

/// Ownership registry for live tasks: pins every unfinished task against
/// the embedding's garbage collector, releasing it on completion or fatal
/// error. Reactor-thread-only; no internal synchronization.
pub struct TaskHost<H: TaskHandle> {
    live: FxHashSet<H>,
    exit: ExitStatus,
}

impl<H: TaskHandle> Default for TaskHost<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: TaskHandle> TaskHost<H> {
    pub fn new() -> Self {
        Self {
            live: FxHashSet::default(),
            exit: ExitStatus::new(),
        }
    }

    /// Pin a freshly created task. Returns `false` if it was already
    /// registered (a bug in the caller, not a recoverable condition).
    pub fn register(&mut self, task: H) -> bool {
        self.live.insert(task)
    }

    pub fn is_pinned(&self, task: H) -> bool {
        self.live.contains(&task)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.exit
    }

    /// Dispatch one resume result: deregister on completion, capture a
    /// traceback and latch failure on error, abort immediately on oom.
    pub fn handle_outcome<R>(&mut self, rt: &mut R, task: H, outcome: ResumeOutcome) -> Disposition
    where
        R: ScriptRuntime<TaskHandle = H>,
    {
        match outcome {
            ResumeOutcome::Completed => {
                self.live.remove(&task);
                Disposition::Completed
            }
            ResumeOutcome::Yielded => Disposition::Yielded,
            ResumeOutcome::RuntimeError(message) => {
                let message = self.rehome_error(rt, task, message);
                self.live.remove(&task);
                self.exit.latch_failure();
                Disposition::Fatal { message }
            }
            ResumeOutcome::Oom => {
                tracing::error!("out of memory resuming task {task:?}; aborting");
                std::process::abort();
            }
            ResumeOutcome::InternalError(message) => {
                let message = self.rehome_error(rt, task, format!("unknown error: {message}"));
                self.live.remove(&task);
                self.exit.latch_failure();
                Disposition::Fatal { message }
            }
        }
    }

    fn rehome_error<R>(&self, rt: &mut R, task: H, message: String) -> String
    where
        R: ScriptRuntime<TaskHandle = H>,
    {
        match rt.traceback(task) {
            Some(trace) => {
                tracing::error!(task = ?task, trace = %trace, "task runtime error");
                format!("{message}\n{trace}")
            }
            None => {
                tracing::error!(task = ?task, "task runtime error (no traceback available)");
                message
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;

    #[test]
    fn register_pins_and_completion_unpins() {
        let mut host = TaskHost::new();
        let mut rt = MockRuntime::new();
        let id = rt.spawn(|_| ResumeOutcome::Completed);
        host.register(id);
        assert!(host.is_pinned(id));

        let outcome = rt.resume(id, 0);
        let disposition = host.handle_outcome(&mut rt, id, outcome);
        assert!(matches!(disposition, Disposition::Completed));
        assert!(!host.is_pinned(id));
    }

    #[test]
    fn yielded_task_stays_pinned() {
        let mut host = TaskHost::new();
        let mut rt = MockRuntime::new();
        let id = rt.spawn(|_| ResumeOutcome::Yielded);
        host.register(id);

        let outcome = rt.resume(id, 0);
        let disposition = host.handle_outcome(&mut rt, id, outcome);
        assert!(matches!(disposition, Disposition::Yielded));
        assert!(host.is_pinned(id), "GC must not reclaim a suspended task");
    }

    #[test]
    fn runtime_error_latches_failure_and_unpins() {
        let mut host = TaskHost::new();
        let mut rt = MockRuntime::new();
        let id = rt.spawn(|_| ResumeOutcome::RuntimeError("boom".into()));
        host.register(id);

        let outcome = rt.resume(id, 0);
        let disposition = host.handle_outcome(&mut rt, id, outcome);
        assert!(matches!(disposition, Disposition::Fatal { .. }));
        assert!(!host.is_pinned(id));
        assert!(host.exit_status().is_failure());
    }

    #[test]
    fn internal_error_is_folded_into_runtime_error() {
        let mut host = TaskHost::new();
        let mut rt = MockRuntime::new();
        let id = rt.spawn(|_| ResumeOutcome::InternalError("weird".into()));
        host.register(id);

        let outcome = rt.resume(id, 0);
        match host.handle_outcome(&mut rt, id, outcome) {
            Disposition::Fatal { message } => assert!(message.contains("unknown error")),
            other => panic!("expected Fatal, got {other:?}"),
        }
    }
}
