//! Executor — runs task instances off the dispatch path.
//!
//! Each instance gets its own spawned task; the entry point itself runs on
//! the blocking pool so a slow function never stalls the dispatcher. The
//! outcome is handed back to the board, which wakes any waiting retriever.

use std::any::Any;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::task::{ExecutionContext, InstanceHandle, Outcome};
use crate::task_board::TaskBoard;

/// Start executing `instance`. The returned handle resolves once the
/// outcome has been recorded on the board.
pub fn spawn(board: TaskBoard, instance: InstanceHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        instance.set_running();

        let ctx = ExecutionContext::bind(&instance);
        let entry = instance.task().entry_point();
        let start = Instant::now();

        let outcome = match tokio::task::spawn_blocking(move || entry(&ctx)).await {
            Ok(value) => Outcome::Completed(value),
            Err(e) if e.is_panic() => Outcome::Failed(panic_message(e.into_panic())),
            Err(_) => Outcome::Failed("execution was aborted".to_string()),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Outcome::Completed(_) => tracing::debug!(
                task = instance.task().name(),
                id = instance.correlation_id(),
                elapsed_ms,
                "instance finished"
            ),
            Outcome::Failed(reason) => tracing::warn!(
                task = instance.task().name(),
                id = instance.correlation_id(),
                elapsed_ms,
                reason = %reason,
                "instance failed"
            ),
        }

        board.mark_finished(&instance, outcome).await;
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("entry point panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("entry point panicked: {s}")
    } else {
        "entry point panicked".to_string()
    }
}
