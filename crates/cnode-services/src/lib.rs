//! cnode-services — task board, dispatcher and the REXEC protocol plumbing.

pub mod client;
pub mod dispatcher;
pub mod executor;
pub mod inbound;
pub mod node;
pub mod task;
pub mod task_board;
pub mod transport;

pub use client::{ClientError, RexecClient};
pub use dispatcher::Dispatcher;
pub use inbound::{Delivery, InboundHandler};
pub use node::Node;
pub use task::{ExecutionContext, InstanceHandle, InstanceState, Outcome, Task, TaskInstance};
pub use task_board::{BoardError, BoardStats, TaskBoard};
pub use transport::{LocalBus, MessageCallback, SubscriptionId, Transport, TransportError};
