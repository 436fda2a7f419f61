//! cnode integration test harness.
//!
//! Every test runs a real `Node` (inbound handler, queue, dispatcher,
//! executor, board) against an in-process `LocalBus` and talks to it the
//! way a remote caller would: encoded commands on a request topic, replies
//! collected from the reply topic.
//!
//!   cargo test --test integration

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use cnode_core::config::{BoardSettings, TransportConfig};
use cnode_core::wire::{ArgType, Argument, Command, CommandKind};
use cnode_services::{LocalBus, Node, RexecClient, Task, TaskBoard, Transport};

mod backpressure;
mod failures;
mod rexec;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Where callers publish. Must not start with the node's own keys.
pub const CALLER_REQUEST_KEY: &str = "app/requests/down";
pub const REPLY_EXPR: &str = "app/replies/**";
pub const CALLER_ID: &str = "caller-node";

/// Long enough for a reply that is coming; short enough to keep tests fast
/// when asserting that no reply comes.
pub const QUIET: Duration = Duration::from_millis(150);
pub const PATIENCE: Duration = Duration::from_secs(5);

pub struct Harness {
    pub bus: LocalBus,
    pub board: TaskBoard,
    pub node: Node,
    pub replies: mpsc::UnboundedReceiver<Command>,
}

impl Harness {
    pub async fn start(settings: BoardSettings, tasks: Vec<Task>) -> Self {
        Self::start_with_control(settings, tasks, None).await
    }

    pub async fn start_with_control(
        settings: BoardSettings,
        tasks: Vec<Task>,
        control_tx: Option<mpsc::Sender<Command>>,
    ) -> Self {
        let bus = LocalBus::new();
        let board = TaskBoard::new(settings);
        for task in tasks {
            board.register(task).await.unwrap();
        }
        let replies = reply_tap(&bus);
        let node = Node::start_with_control(
            board.clone(),
            Arc::new(bus.clone()),
            &TransportConfig::default(),
            control_tx,
        )
        .unwrap();
        Self {
            bus,
            board,
            node,
            replies,
        }
    }

    pub fn client(&self) -> RexecClient {
        RexecClient::new(Arc::new(self.bus.clone()), CALLER_ID, CALLER_REQUEST_KEY, REPLY_EXPR)
            .unwrap()
            .with_timeout(PATIENCE)
    }

    /// Publish a raw request as a remote caller would.
    pub fn send(&self, command: &Command) {
        self.bus.publish(CALLER_REQUEST_KEY, command.to_bytes()).unwrap();
    }

    pub fn send_raw(&self, bytes: &[u8]) {
        self.bus
            .publish(CALLER_REQUEST_KEY, bytes.to_vec().into())
            .unwrap();
    }

    /// Next reply seen on the reply topic, or `None` after `within`.
    pub async fn next_reply(&mut self, within: Duration) -> Option<Command> {
        tokio::time::timeout(within, self.replies.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn expect_reply(&mut self) -> Command {
        self.next_reply(PATIENCE).await.expect("no reply within patience")
    }

    pub async fn expect_silence(&mut self) {
        if let Some(reply) = self.next_reply(QUIET).await {
            panic!("unexpected reply {:?} for task {}", reply.kind(), reply.task_id());
        }
    }
}

/// Every decodable message published under the reply topic.
pub fn reply_tap(bus: &LocalBus) -> mpsc::UnboundedReceiver<Command> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(
        REPLY_EXPR,
        Arc::new(move |payload: &[u8], _: &str| {
            if let Ok(command) = Command::decode(payload) {
                let _ = tx.send(command);
            }
        }),
    )
    .unwrap();
    rx
}

pub fn request(kind: CommandKind, fn_name: &str, task_id: u64, args: Vec<Argument>) -> Command {
    Command::new(kind, 4, fn_name, task_id, CALLER_ID, args).unwrap()
}

pub fn sum3() -> Task {
    Task::new("sum3", ArgType::Int32, "iii", |ctx| {
        Argument::Int32((0..3).filter_map(|i| ctx.int32(i)).sum())
    })
    .unwrap()
}

/// A task whose instances block until the returned sender is dropped or
/// sent to, once per instance.
pub fn gated(name: &str) -> (Task, std::sync::mpsc::Sender<()>) {
    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);
    let task = Task::new(name, ArgType::Int32, "i", move |ctx| {
        if let Ok(rx) = gate_rx.lock() {
            let _ = rx.recv();
        }
        Argument::Int32(ctx.int32(0).unwrap_or(0))
    })
    .unwrap();
    (task, gate_tx)
}

pub fn wait_forever() -> BoardSettings {
    BoardSettings {
        result_timeout_ms: 0,
        ..BoardSettings::default()
    }
}

/// Collects formatted log output emitted on the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Route WARN and above on this thread into the capture until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
