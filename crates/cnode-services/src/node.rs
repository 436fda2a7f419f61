//! Node — wires a board to a transport.
//!
//! Owns the inbound subscription, the dispatcher task and the shutdown
//! channel. Tasks should be registered on the board before `start`.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use cnode_core::config::TransportConfig;
use cnode_core::wire::Command;

use crate::dispatcher::Dispatcher;
use crate::inbound::InboundHandler;
use crate::task_board::TaskBoard;
use crate::transport::{SubscriptionId, Transport, TransportError};

pub struct Node {
    board: TaskBoard,
    transport: Arc<dyn Transport>,
    inbound: Arc<InboundHandler>,
    subscription: SubscriptionId,
    shutdown_tx: broadcast::Sender<()>,
    dispatcher: JoinHandle<()>,
}

impl Node {
    pub fn start(
        board: TaskBoard,
        transport: Arc<dyn Transport>,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        Self::start_with_control(board, transport, config, None)
    }

    /// As `start`, forwarding control commands to `control_tx`.
    pub fn start_with_control(
        board: TaskBoard,
        transport: Arc<dyn Transport>,
        config: &TransportConfig,
        control_tx: Option<mpsc::Sender<Command>>,
    ) -> Result<Self, TransportError> {
        let (inbound, command_rx) = InboundHandler::channel(
            board.settings().inbound_queue_capacity,
            vec![config.reply_key.clone(), config.request_key.clone()],
        );
        let inbound = Arc::new(inbound);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let mut dispatcher = Dispatcher::new(
            board.clone(),
            transport.clone(),
            config.reply_key.clone(),
            command_rx,
            shutdown_tx.subscribe(),
        );
        if let Some(tx) = control_tx {
            dispatcher = dispatcher.with_control_forward(tx);
        }
        let dispatcher = tokio::spawn(dispatcher.run());

        let subscription = match transport.subscribe(&config.subscribe_key, inbound.clone().into_callback()) {
            Ok(id) => id,
            Err(e) => {
                dispatcher.abort();
                return Err(e);
            }
        };

        tracing::info!(
            subscribe_key = %config.subscribe_key,
            reply_key = %config.reply_key,
            "node started"
        );

        Ok(Self {
            board,
            transport,
            inbound,
            subscription,
            shutdown_tx,
            dispatcher,
        })
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    /// Commands dropped at the inbound queue so far.
    pub fn dropped(&self) -> u64 {
        self.inbound.dropped()
    }

    /// Stop receiving, tear the board down and wait for the dispatcher.
    pub async fn shutdown(self) {
        self.transport.unsubscribe(self.subscription);
        // Board first: wakes a dispatcher blocked on a result.
        self.board.shutdown().await;
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.dispatcher.await {
            tracing::error!(error = %e, "dispatcher task failed");
        }
        tracing::info!(dropped = self.inbound.dropped(), "node stopped");
    }
}
