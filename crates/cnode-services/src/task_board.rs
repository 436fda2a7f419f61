//! Task board — the per-node registry of tasks and owner of their instances.
//!
//! All shared state lives behind one async mutex. Every mutation (register,
//! create, finish bookkeeping, retrieve, shutdown) holds it for the duration
//! of the mutation only; entry points run without it and retrievers release
//! it while they wait for an instance to finish.
//!
//! Invariants:
//!   - task names are unique
//!   - correlation ids are unique among the live instances of one task
//!   - an instance exists only if its arguments match the task signature
//!   - a completed instance's result matches the task return type

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use cnode_core::config::BoardSettings;
use cnode_core::wire::{Argument, WireError};

use crate::task::{InstanceHandle, Outcome, Phase, Task, TaskInstance};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BoardError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("a task named \"{0}\" is already registered")]
    DuplicateName(String),

    #[error("task \"{task}\" already has a live instance {id}")]
    DuplicateId { task: String, id: u64 },

    #[error("{what} capacity of {limit} exceeded")]
    CapacityExceeded { what: &'static str, limit: usize },

    #[error("arguments do not match signature: {0}")]
    ArgMismatch(WireError),

    #[error("instance was cancelled by board shutdown")]
    Cancelled,

    #[error("instance did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("task board is shut down")]
    ShutDown,
}

/// Point-in-time board counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardStats {
    pub tasks: usize,
    pub live_instances: usize,
    pub dead_instances: u64,
    pub last_dead_id: Option<u64>,
}

struct InstanceEntry {
    instance: InstanceHandle,
    /// A retriever is waiting on this instance.
    claimed: Arc<AtomicBool>,
}

/// Held by a retriever for as long as it waits. Dropping it, including when
/// the retrieving future itself is dropped, releases the claim.
struct Claim(Arc<AtomicBool>);

impl Drop for Claim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct TaskSlot {
    task: Arc<Task>,
    instances: HashMap<u64, InstanceEntry>,
}

#[derive(Default)]
struct BoardState {
    tasks: HashMap<String, TaskSlot>,
    live_instances: usize,
    dead_instances: u64,
    last_dead_id: Option<u64>,
    shut_down: bool,
}

impl BoardState {
    fn slot_mut(&mut self, task: &Task) -> Result<&mut TaskSlot, BoardError> {
        self.tasks
            .get_mut(task.name())
            .ok_or_else(|| BoardError::NotFound(format!("task \"{}\"", task.name())))
    }

    /// The live entry for exactly this instance, not a later reuse of its id.
    fn entry_mut(&mut self, instance: &TaskInstance) -> Option<&mut InstanceEntry> {
        self.tasks
            .get_mut(instance.task().name())?
            .instances
            .get_mut(&instance.correlation_id())
            .filter(|e| std::ptr::eq(Arc::as_ptr(&e.instance), instance))
    }

    fn remove(&mut self, instance: &TaskInstance) -> bool {
        if self.entry_mut(instance).is_none() {
            return false;
        }
        if let Some(slot) = self.tasks.get_mut(instance.task().name()) {
            slot.instances.remove(&instance.correlation_id());
            self.live_instances -= 1;
        }
        true
    }
}

/// The task registry. Cheap to clone; clones share one board.
#[derive(Clone)]
pub struct TaskBoard {
    settings: Arc<BoardSettings>,
    state: Arc<Mutex<BoardState>>,
}

impl TaskBoard {
    pub fn new(settings: BoardSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            state: Arc::new(Mutex::new(BoardState::default())),
        }
    }

    pub fn settings(&self) -> &BoardSettings {
        &self.settings
    }

    /// Register a task. Registration is permanent for the board's lifetime.
    pub async fn register(&self, task: Task) -> Result<Arc<Task>, BoardError> {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return Err(BoardError::ShutDown);
        }
        if state.tasks.contains_key(task.name()) {
            return Err(BoardError::DuplicateName(task.name().to_string()));
        }
        if state.tasks.len() >= self.settings.max_tasks {
            return Err(BoardError::CapacityExceeded {
                what: "task",
                limit: self.settings.max_tasks,
            });
        }

        let task = Arc::new(task);
        state.tasks.insert(
            task.name().to_string(),
            TaskSlot {
                task: task.clone(),
                instances: HashMap::new(),
            },
        );
        tracing::info!(
            task = task.name(),
            signature = %task.signature(),
            return_type = %task.return_type(),
            "task registered"
        );
        Ok(task)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Arc<Task>, BoardError> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(name)
            .map(|slot| slot.task.clone())
            .ok_or_else(|| BoardError::NotFound(format!("task \"{name}\"")))
    }

    /// Create a live instance of `task`. Atomic: on any error nothing is added.
    pub async fn create_instance(
        &self,
        task: &Task,
        correlation_id: u64,
        args: Vec<Argument>,
    ) -> Result<InstanceHandle, BoardError> {
        task.signature()
            .check(&args)
            .map_err(BoardError::ArgMismatch)?;

        let mut state = self.state.lock().await;
        if state.shut_down {
            return Err(BoardError::ShutDown);
        }
        let limit = self.settings.max_instances_per_task;
        let slot = state.slot_mut(task)?;
        if slot.instances.len() >= limit {
            return Err(BoardError::CapacityExceeded {
                what: "instance",
                limit,
            });
        }
        if slot.instances.contains_key(&correlation_id) {
            return Err(BoardError::DuplicateId {
                task: task.name().to_string(),
                id: correlation_id,
            });
        }

        let instance = Arc::new(TaskInstance::new(slot.task.clone(), correlation_id, args));
        slot.instances.insert(
            correlation_id,
            InstanceEntry {
                instance: instance.clone(),
                claimed: Arc::new(AtomicBool::new(false)),
            },
        );
        state.live_instances += 1;

        tracing::debug!(
            task = task.name(),
            id = correlation_id,
            live = state.live_instances,
            "instance created"
        );
        Ok(instance)
    }

    pub async fn find_instance(
        &self,
        task: &Task,
        correlation_id: u64,
    ) -> Result<InstanceHandle, BoardError> {
        let mut state = self.state.lock().await;
        state
            .slot_mut(task)?
            .instances
            .get(&correlation_id)
            .map(|e| e.instance.clone())
            .ok_or_else(|| {
                BoardError::NotFound(format!(
                    "instance {correlation_id} of task \"{}\"",
                    task.name()
                ))
            })
    }

    /// Record the end of an instance's execution and update the finished
    /// counters. A completed value whose type disagrees with the task's
    /// return type is recorded as a failure instead.
    pub async fn mark_finished(&self, instance: &TaskInstance, outcome: Outcome) {
        let expected = instance.task().return_type();
        let outcome = match outcome {
            Outcome::Completed(value) if value.arg_type() != expected => {
                tracing::warn!(
                    task = instance.task().name(),
                    id = instance.correlation_id(),
                    expected = %expected,
                    actual = %value.arg_type(),
                    "entry point returned the wrong type"
                );
                Outcome::Failed(format!(
                    "returned {} where {} was declared",
                    value.arg_type(),
                    expected
                ))
            }
            other => other,
        };

        if !instance.finish(outcome) {
            return;
        }

        let mut state = self.state.lock().await;
        if state.shut_down {
            tracing::debug!(
                task = instance.task().name(),
                id = instance.correlation_id(),
                "instance finished after shutdown, discarding"
            );
            return;
        }
        state.dead_instances += 1;
        state.last_dead_id = Some(instance.correlation_id());
    }

    /// Wait for the instance to finish, then hand out its result and remove
    /// it. Succeeds at most once per instance; later calls get `NotFound`.
    pub async fn retrieve_and_destroy(&self, instance: &TaskInstance) -> Result<Argument, BoardError> {
        self.retrieve_and_destroy_within(instance, None).await
    }

    /// As `retrieve_and_destroy`, giving up after `timeout`. A timed-out
    /// instance stays live and can be retrieved later.
    pub async fn retrieve_and_destroy_within(
        &self,
        instance: &TaskInstance,
        timeout: Option<Duration>,
    ) -> Result<Argument, BoardError> {
        let not_found = || {
            BoardError::NotFound(format!(
                "instance {} of task \"{}\"",
                instance.correlation_id(),
                instance.task().name()
            ))
        };

        let _claim = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(BoardError::ShutDown);
            }
            let entry = state.entry_mut(instance).ok_or_else(not_found)?;
            if entry.claimed.swap(true, Ordering::AcqRel) {
                return Err(not_found());
            }
            Claim(entry.claimed.clone())
        };

        let phase = match timeout {
            Some(limit) => tokio::time::timeout(limit, instance.wait_terminal())
                .await
                .map_err(|_| limit),
            None => Ok(instance.wait_terminal().await),
        };

        let mut state = self.state.lock().await;
        let outcome = match phase {
            Err(limit) => return Err(BoardError::TimedOut(limit)),
            Ok(Phase::Finished(outcome)) if !state.shut_down => outcome,
            Ok(_) => return Err(BoardError::Cancelled),
        };

        if !state.remove(instance) {
            return Err(not_found());
        }
        tracing::debug!(
            task = instance.task().name(),
            id = instance.correlation_id(),
            live = state.live_instances,
            "instance retrieved and destroyed"
        );

        match outcome {
            Outcome::Completed(value) => Ok(value),
            Outcome::Failed(reason) => Err(BoardError::ExecutionFailed(reason)),
        }
    }

    /// Tear the board down: every task is released and every live instance
    /// destroyed. Retrievers waiting on an instance wake with `Cancelled`.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return;
        }
        state.shut_down = true;

        let tasks = state.tasks.len();
        let live = state.live_instances;
        for (_, slot) in state.tasks.drain() {
            for (_, entry) in slot.instances {
                entry.instance.cancel();
            }
        }
        state.live_instances = 0;

        tracing::info!(tasks, cancelled_instances = live, "task board shut down");
    }

    pub async fn stats(&self) -> BoardStats {
        let state = self.state.lock().await;
        BoardStats {
            tasks: state.tasks.len(),
            live_instances: state.live_instances,
            dead_instances: state.dead_instances,
            last_dead_id: state.last_dead_id,
        }
    }
}
