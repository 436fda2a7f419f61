//! Inbound boundary — transport callback to dispatcher queue.
//!
//! Runs on the transport's delivery thread and must never block: it filters
//! this node's own publications, decodes, and `try_send`s onto the bounded
//! queue. A full queue drops the command; the remote caller sees a timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use cnode_core::wire::Command;

use crate::transport::MessageCallback;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    OwnMessage,
    Malformed,
    Dropped,
}

pub struct InboundHandler {
    tx: mpsc::Sender<Command>,
    own_keys: Vec<String>,
    dropped: AtomicU64,
    malformed: AtomicU64,
}

impl InboundHandler {
    /// Create the handler and the receiving end of its queue. Messages whose
    /// topic starts with any of `own_keys` are treated as our own echo.
    pub fn channel(capacity: usize, own_keys: Vec<String>) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handler = Self {
            tx,
            own_keys,
            dropped: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        };
        (handler, rx)
    }

    pub fn on_message(&self, payload: &[u8], topic: &str) -> Delivery {
        if self.own_keys.iter().any(|key| topic.starts_with(key.as_str())) {
            tracing::trace!(topic, "ignoring own publication");
            return Delivery::OwnMessage;
        }

        let command = match Command::decode(payload) {
            Ok(c) => c,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic, len = payload.len(), error = %e, "dropping undecodable message");
                return Delivery::Malformed;
            }
        };

        let kind = command.kind();
        let task_id = command.task_id();
        match self.tx.try_send(command) {
            Ok(()) => {
                tracing::trace!(topic, %kind, task_id, "command queued");
                Delivery::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(topic, %kind, task_id, dropped = total, "inbound queue full, dropping command");
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic, %kind, task_id, "dispatcher gone, dropping command");
                Delivery::Dropped
            }
        }
    }

    /// Commands dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Wrap a shared handler as a transport callback.
    pub fn into_callback(self: Arc<Self>) -> MessageCallback {
        Arc::new(move |payload: &[u8], topic: &str| {
            self.on_message(payload, topic);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnode_core::wire::CommandKind;

    fn rexec(task_id: u64) -> Vec<u8> {
        Command::new(CommandKind::Rexec, 0, "sum3", task_id, "caller", vec![1.into()])
            .unwrap()
            .as_bytes()
            .to_vec()
    }

    fn own_keys() -> Vec<String> {
        vec!["app/replies/up".into(), "app/requests/up".into()]
    }

    #[tokio::test]
    async fn queues_decoded_commands_in_order() {
        let (handler, mut rx) = InboundHandler::channel(4, own_keys());
        assert_eq!(handler.on_message(&rexec(1), "app/requests/down"), Delivery::Queued);
        assert_eq!(handler.on_message(&rexec(2), "app/requests/down"), Delivery::Queued);

        assert_eq!(rx.recv().await.unwrap().task_id(), 1);
        assert_eq!(rx.recv().await.unwrap().task_id(), 2);
    }

    #[test]
    fn filters_own_publications() {
        let (handler, mut rx) = InboundHandler::channel(4, own_keys());
        assert_eq!(handler.on_message(&rexec(1), "app/replies/up"), Delivery::OwnMessage);
        assert_eq!(handler.on_message(&rexec(1), "app/requests/up/x"), Delivery::OwnMessage);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_bytes_are_counted_not_queued() {
        let (handler, mut rx) = InboundHandler::channel(4, own_keys());
        assert_eq!(handler.on_message(&[0xff, 0x00], "app/requests/down"), Delivery::Malformed);
        assert_eq!(handler.on_message(&[], "app/requests/down"), Delivery::Malformed);
        assert_eq!(handler.malformed(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (handler, _rx) = InboundHandler::channel(2, own_keys());
        for id in 0..2 {
            assert_eq!(handler.on_message(&rexec(id), "app/requests/down"), Delivery::Queued);
        }
        assert_eq!(handler.on_message(&rexec(9), "app/requests/down"), Delivery::Dropped);
        assert_eq!(handler.dropped(), 1);
    }

    #[test]
    fn closed_queue_drops() {
        let (handler, rx) = InboundHandler::channel(2, own_keys());
        drop(rx);
        assert_eq!(handler.on_message(&rexec(1), "app/requests/down"), Delivery::Dropped);
    }
}
