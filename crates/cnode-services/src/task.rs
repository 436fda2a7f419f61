//! Tasks and task instances.
//!
//! A `Task` is a named, immutable function template. A `TaskInstance` is one
//! invocation of it, keyed by the caller's correlation id. Instances publish
//! their lifecycle through a watch channel so a retriever can wait for
//! completion without polling.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use cnode_core::wire::{self, ArgType, Argument, Signature, WireError};

/// Entry point of a task. Runs on a blocking thread with the bound arguments.
pub type EntryPoint = Arc<dyn Fn(&ExecutionContext) -> Argument + Send + Sync>;

/// A registered function template.
pub struct Task {
    name: String,
    return_type: ArgType,
    signature: Signature,
    entry_point: EntryPoint,
}

impl Task {
    /// Build a task. `signature` is the compact form, e.g. `"iis"`.
    pub fn new<F>(
        name: impl Into<String>,
        return_type: ArgType,
        signature: &str,
        entry_point: F,
    ) -> Result<Self, WireError>
    where
        F: Fn(&ExecutionContext) -> Argument + Send + Sync + 'static,
    {
        let name = name.into();
        if name.len() > wire::MAX_FN_NAME_LEN {
            return Err(WireError::FieldTooLong {
                field: "fn_name",
                len: name.len(),
                max: wire::MAX_FN_NAME_LEN,
            });
        }
        Ok(Self {
            name,
            return_type,
            signature: Signature::parse(signature)?,
            entry_point: Arc::new(entry_point),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn return_type(&self) -> ArgType {
        self.return_type
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub(crate) fn entry_point(&self) -> EntryPoint {
        self.entry_point.clone()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .field("signature", &self.signature.to_string())
            .finish_non_exhaustive()
    }
}

// ── Execution context ─────────────────────────────────────────────────────────

/// What an entry point sees: its own identity and the bound arguments.
///
/// Arguments were checked against the task signature when the instance was
/// created, so the typed getters only return `None` for a wrong index or a
/// getter that disagrees with the signature.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    task_name: String,
    correlation_id: u64,
    args: Vec<Argument>,
}

impl ExecutionContext {
    pub(crate) fn bind(instance: &TaskInstance) -> Self {
        Self {
            task_name: instance.task.name.clone(),
            correlation_id: instance.correlation_id,
            args: instance.args.clone(),
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Argument> {
        self.args.get(index)
    }

    pub fn int32(&self, index: usize) -> Option<i32> {
        self.arg(index).and_then(Argument::as_i32)
    }

    pub fn int64(&self, index: usize) -> Option<i64> {
        self.arg(index).and_then(Argument::as_i64)
    }

    pub fn float64(&self, index: usize) -> Option<f64> {
        self.arg(index).and_then(Argument::as_f64)
    }

    pub fn string(&self, index: usize) -> Option<&str> {
        self.arg(index).and_then(Argument::as_str)
    }

    pub fn blob(&self, index: usize) -> Option<&[u8]> {
        self.arg(index).and_then(Argument::as_blob)
    }
}

// ── Instances ─────────────────────────────────────────────────────────────────

/// Observable lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Running,
    Finished,
    /// Torn down by board shutdown before a result was collected.
    Cancelled,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Argument),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Phase {
    Created,
    Running,
    Finished(Outcome),
    Cancelled,
}

impl Phase {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, Phase::Finished(_) | Phase::Cancelled)
    }
}

/// One in-flight or completed invocation of a task.
pub struct TaskInstance {
    task: Arc<Task>,
    correlation_id: u64,
    args: Vec<Argument>,
    phase: watch::Sender<Phase>,
}

/// Shared handle to an instance owned by the board.
pub type InstanceHandle = Arc<TaskInstance>;

impl TaskInstance {
    pub(crate) fn new(task: Arc<Task>, correlation_id: u64, args: Vec<Argument>) -> Self {
        let (phase, _) = watch::channel(Phase::Created);
        Self {
            task,
            correlation_id,
            args,
            phase,
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    pub fn state(&self) -> InstanceState {
        match *self.phase.borrow() {
            Phase::Created => InstanceState::Created,
            Phase::Running => InstanceState::Running,
            Phase::Finished(_) => InstanceState::Finished,
            Phase::Cancelled => InstanceState::Cancelled,
        }
    }

    /// The return value, once the instance has completed successfully.
    pub fn result(&self) -> Option<Argument> {
        match &*self.phase.borrow() {
            Phase::Finished(Outcome::Completed(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn set_running(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Created {
                *phase = Phase::Running;
                true
            } else {
                false
            }
        });
    }

    /// Record the outcome. Returns false if the instance had already ended.
    pub(crate) fn finish(&self, outcome: Outcome) -> bool {
        self.phase.send_if_modified(move |phase| {
            if phase.is_terminal() {
                false
            } else {
                *phase = Phase::Finished(outcome);
                true
            }
        })
    }

    pub(crate) fn cancel(&self) {
        self.phase.send_if_modified(|phase| {
            if phase.is_terminal() {
                false
            } else {
                *phase = Phase::Cancelled;
                true
            }
        });
    }

    /// Wait until the instance finishes or is cancelled.
    pub(crate) async fn wait_terminal(&self) -> Phase {
        let mut rx = self.phase.subscribe();
        let phase = match rx.wait_for(Phase::is_terminal).await {
            Ok(phase) => phase.clone(),
            // Unreachable while `self` holds the sender.
            Err(_) => Phase::Cancelled,
        };
        phase
    }
}

impl fmt::Debug for TaskInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInstance")
            .field("task", &self.task.name)
            .field("correlation_id", &self.correlation_id)
            .field("state", &self.state())
            .finish()
    }
}
