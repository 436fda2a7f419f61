//! Requesting side of the REXEC protocol.
//!
//! Publishes REXEC and GET_REXEC_RES on the request key stamped with this
//! node's id, and matches replies back to the waiting caller by
//! `(fn_name, task_id)`. Replies addressed to other nodes are ignored.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use cnode_core::wire::{Argument, Command, CommandKind, WireError};

use crate::transport::{SubscriptionId, Transport, TransportError};

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot build request: {0}")]
    Wire(#[from] WireError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("a request for {fn_name}#{task_id} is already in flight")]
    InFlight { fn_name: String, task_id: u64 },
    #[error("remote node rejected {kind} for {fn_name}#{task_id}")]
    Rejected {
        kind: CommandKind,
        fn_name: String,
        task_id: u64,
    },
    #[error("unexpected {0} reply")]
    UnexpectedReply(CommandKind),
    #[error("no reply within {0:?}")]
    TimedOut(Duration),
    #[error("client closed")]
    Closed,
}

type PendingKey = (String, u64);
type Pending = Arc<DashMap<PendingKey, oneshot::Sender<Command>>>;

pub struct RexecClient {
    transport: Arc<dyn Transport>,
    node_id: String,
    request_key: String,
    timeout: Duration,
    pending: Pending,
    subscription: SubscriptionId,
}

impl RexecClient {
    /// Subscribe to `reply_key_expr` and start matching replies for `node_id`.
    pub fn new(
        transport: Arc<dyn Transport>,
        node_id: impl Into<String>,
        request_key: impl Into<String>,
        reply_key_expr: &str,
    ) -> Result<Self, ClientError> {
        let node_id = node_id.into();
        let pending: Pending = Arc::new(DashMap::new());

        let callback = {
            let pending = pending.clone();
            let node_id = node_id.clone();
            Arc::new(move |payload: &[u8], topic: &str| {
                let Ok(reply) = Command::decode(payload) else {
                    tracing::trace!(topic, "client ignoring undecodable message");
                    return;
                };
                if reply.node_id() != node_id || !is_reply(reply.kind()) {
                    return;
                }
                let key = (reply.fn_name().to_string(), reply.task_id());
                if let Some((_, waiter)) = pending.remove(&key) {
                    let _ = waiter.send(reply);
                }
            })
        };
        let subscription = transport.subscribe(reply_key_expr, callback)?;

        Ok(Self {
            transport,
            node_id,
            request_key: request_key.into(),
            timeout: DEFAULT_CLIENT_TIMEOUT,
            pending,
            subscription,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Ask the remote node to start `fn_name` under `task_id`.
    pub async fn rexec(
        &self,
        fn_name: &str,
        task_id: u64,
        args: Vec<Argument>,
    ) -> Result<(), ClientError> {
        let reply = self.request(CommandKind::Rexec, fn_name, task_id, args).await?;
        match reply.kind() {
            CommandKind::RexecAck => Ok(()),
            CommandKind::RexecErr => Err(rejected(CommandKind::Rexec, fn_name, task_id)),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Collect the result of a previously started instance.
    pub async fn get_result(&self, fn_name: &str, task_id: u64) -> Result<Argument, ClientError> {
        let reply = self
            .request(CommandKind::GetRexecRes, fn_name, task_id, Vec::new())
            .await?;
        match reply.kind() {
            CommandKind::RexecRes => Ok(reply.args().first().cloned().unwrap_or(Argument::Void)),
            CommandKind::RexecErr => Err(rejected(CommandKind::GetRexecRes, fn_name, task_id)),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Start `fn_name` and wait for its result.
    pub async fn call(
        &self,
        fn_name: &str,
        task_id: u64,
        args: Vec<Argument>,
    ) -> Result<Argument, ClientError> {
        self.rexec(fn_name, task_id, args).await?;
        self.get_result(fn_name, task_id).await
    }

    async fn request(
        &self,
        kind: CommandKind,
        fn_name: &str,
        task_id: u64,
        args: Vec<Argument>,
    ) -> Result<Command, ClientError> {
        let command = Command::new(kind, 0, fn_name, task_id, self.node_id.as_str(), args)?;
        let key = (fn_name.to_string(), task_id);

        // Register before publishing: a local transport may deliver the
        // reply before publish returns.
        let mut waiter = match self.pending.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ClientError::InFlight {
                    fn_name: fn_name.to_string(),
                    task_id,
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Waiter {
                    pending: &self.pending,
                    key,
                    rx,
                }
            }
        };

        self.transport.publish(&self.request_key, command.to_bytes())?;
        tracing::debug!(%kind, fn_name, task_id, "request sent");

        match tokio::time::timeout(self.timeout, &mut waiter.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::TimedOut(self.timeout)),
        }
    }
}

/// One outstanding request. Dropping it withdraws the pending entry unless a
/// reply already took it, so an abandoned request never blocks its key.
struct Waiter<'a> {
    pending: &'a Pending,
    key: PendingKey,
    rx: oneshot::Receiver<Command>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.rx.close();
        // Only our own sender is closed; a newer request's is not.
        self.pending.remove_if(&self.key, |_, tx| tx.is_closed());
    }
}

impl Drop for RexecClient {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.subscription);
    }
}

fn is_reply(kind: CommandKind) -> bool {
    matches!(
        kind,
        CommandKind::RexecAck | CommandKind::RexecRes | CommandKind::RexecErr
    )
}

fn rejected(kind: CommandKind, fn_name: &str, task_id: u64) -> ClientError {
    ClientError::Rejected {
        kind,
        fn_name: fn_name.to_string(),
        task_id,
    }
}
