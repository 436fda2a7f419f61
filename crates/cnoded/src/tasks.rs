//! Built-in tasks the daemon offers for remote execution.

use std::time::Duration;

use cnode_core::wire::{ArgType, Argument};
use cnode_services::{BoardError, ExecutionContext, Task, TaskBoard};

/// Every built-in task, in registration order.
pub fn builtin() -> Vec<Task> {
    let specs: [(&str, ArgType, &str, fn(&ExecutionContext) -> Argument); 5] = [
        ("sum3", ArgType::Int32, "iii", sum3),
        ("echo", ArgType::String, "s", echo),
        ("scale", ArgType::Float64, "f", scale),
        ("blob_len", ArgType::Int32, "n", blob_len),
        ("sleep_ms", ArgType::Void, "i", sleep_ms),
    ];
    specs
        .into_iter()
        .filter_map(|(name, ret, sig, entry)| match Task::new(name, ret, sig, entry) {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::error!(task = name, error = %e, "invalid built-in task");
                None
            }
        })
        .collect()
}

/// Register every built-in task on `board`.
pub async fn register_all(board: &TaskBoard) -> Result<usize, BoardError> {
    let mut count = 0;
    for task in builtin() {
        board.register(task).await?;
        count += 1;
    }
    Ok(count)
}

fn sum3(ctx: &ExecutionContext) -> Argument {
    let total = (0..3)
        .filter_map(|i| ctx.int32(i))
        .fold(0i32, i32::wrapping_add);
    Argument::Int32(total)
}

fn echo(ctx: &ExecutionContext) -> Argument {
    Argument::String(ctx.string(0).unwrap_or_default().to_string())
}

fn scale(ctx: &ExecutionContext) -> Argument {
    Argument::Float64(ctx.float64(0).unwrap_or_default() * 2.0)
}

fn blob_len(ctx: &ExecutionContext) -> Argument {
    let len = ctx.blob(0).map_or(0, <[u8]>::len);
    Argument::Int32(i32::try_from(len).unwrap_or(i32::MAX))
}

fn sleep_ms(ctx: &ExecutionContext) -> Argument {
    let ms = ctx.int32(0).unwrap_or(0).max(0) as u64;
    std::thread::sleep(Duration::from_millis(ms));
    Argument::Void
}
