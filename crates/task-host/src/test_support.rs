//! A minimal closure-backed [`ScriptRuntime`] stand-in for the Lua VM the
//! original embeds. Every other crate in the workspace tests against this.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::{ResumeOutcome, ScriptRuntime};

/// Handle into a [`MockRuntime`]'s task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

type Body = Box<dyn FnMut(u16) -> ResumeOutcome + Send>;

/// A `ScriptRuntime` whose tasks are plain closures. Each call to
/// [`resume`](ScriptRuntime::resume) invokes the stored closure once; a
/// closure that wants to yield more than once should track its own state
/// and return `Yielded` until it decides to finish.
#[derive(Default)]
pub struct MockRuntime {
    next_id: u64,
    tasks: FxHashMap<TaskId, Body>,
    tracebacks: FxHashMap<TaskId, String>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task body, returning its handle. Does not resume it.
    pub fn spawn<F>(&mut self, body: F) -> TaskId
    where
        F: FnMut(u16) -> ResumeOutcome + Send + 'static,
    {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, Box::new(body));
        id
    }

    /// Attach a canned traceback for a task, returned by the next
    /// `traceback()` call.
    pub fn set_traceback(&mut self, task: TaskId, trace: impl Into<String>) {
        self.tracebacks.insert(task, trace.into());
    }
}

impl ScriptRuntime for MockRuntime {
    type TaskHandle = TaskId;

    fn resume(&mut self, task: TaskId, nargs: u16) -> ResumeOutcome {
        match self.tasks.get_mut(&task) {
            Some(body) => body(nargs),
            None => ResumeOutcome::InternalError(format!("resume on unknown task {task}")),
        }
    }

    fn traceback(&mut self, task: TaskId) -> Option<String> {
        self.tracebacks.remove(&task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_task_resume_is_internal_error() {
        let mut rt = MockRuntime::new();
        let bogus = TaskId(999);
        match rt.resume(bogus, 0) {
            ResumeOutcome::InternalError(msg) => assert!(msg.contains("unknown task")),
            other => panic!("expected InternalError, got {other:?}"),
        }
    }

    #[test]
    fn traceback_is_consumed_once() {
        let mut rt = MockRuntime::new();
        let id = rt.spawn(|_| ResumeOutcome::RuntimeError("x".into()));
        rt.set_traceback(id, "at line 1");
        assert_eq!(rt.traceback(id).as_deref(), Some("at line 1"));
        assert_eq!(rt.traceback(id), None);
    }
}
