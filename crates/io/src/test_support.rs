//! Completes the trait pair a concrete [`Core`](crate::Core) needs:
//! `dispatch_task_host::test_support` ships a [`ScriptRuntime`]-only
//! `MockRuntime` (it sits below this crate and can't depend on
//! [`CompletionSink`], which is defined here). Every integration test that
//! builds a `Core<MockRuntime>` — and `dispatch-runtime`'s binary, which
//! has no real embedded interpreter to wire up — needs both halves, so the
//! impl lives here instead.

pub use dispatch_task_host::test_support::{MockRuntime, TaskId};

use crate::completion::Completion;
use crate::core::CompletionSink;
use crate::error::IoError;

impl CompletionSink<TaskId> for MockRuntime {
    /// `MockRuntime`'s tasks are plain closures with no value stack to push
    /// onto, so this only reports the error (if any) and always hands back
    /// a single argument, mirroring the readiness-wake `nargs=1` convention
    /// used elsewhere in this crate.
    fn deliver(&mut self, task: TaskId, completion: Completion<TaskId>) -> u16 {
        match completion {
            Completion::Open { result, .. } => log_result(task, result),
            Completion::FromFd { result, .. } => log_result(task, result),
            Completion::FileRead { result, .. } => log_result(task, result),
            Completion::FileWrite { result, .. } => log_result(task, result),
            Completion::FileSeek { result, .. } => log_result(task, result),
            Completion::FileSize { result, .. } => log_result(task, result),
            Completion::FileLock { result, .. } => log_result(task, result),
            Completion::Resolve { result, .. } => log_result(task, result),
            Completion::Spawn { result, .. } => log_result(task, result),
            Completion::Waitpid { result, .. } => log_result(task, result),
            Completion::StreamFileOpened { result, .. } => log_result(task, result),
        }
        1
    }
}

fn log_result<T>(task: TaskId, result: Result<T, IoError>) {
    if let Err(err) = result {
        tracing::debug!(%task, %err, "mock completion carried an error");
    }
}
