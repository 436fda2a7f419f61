//! Dispatcher — drains the inbound queue and drives the REXEC protocol.
//!
//! Commands are processed one at a time in arrival order. A REXEC creates
//! an instance, hands it to the executor and is acknowledged at once; a
//! GET_REXEC_RES waits (up to the configured timeout) for the instance to
//! finish, then replies with its result and destroys it. Every protocol
//! failure becomes a REXEC_ERR carrying the request's correlation fields.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use cnode_core::wire::{Argument, Command, CommandKind};

use crate::executor;
use crate::task_board::{BoardError, TaskBoard};
use crate::transport::Transport;

pub struct Dispatcher {
    board: TaskBoard,
    transport: Arc<dyn Transport>,
    reply_key: String,
    result_timeout: Option<Duration>,
    control_tx: Option<mpsc::Sender<Command>>,
    command_rx: mpsc::Receiver<Command>,
    shutdown: broadcast::Receiver<()>,
}

impl Dispatcher {
    pub fn new(
        board: TaskBoard,
        transport: Arc<dyn Transport>,
        reply_key: impl Into<String>,
        command_rx: mpsc::Receiver<Command>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let result_timeout = board.settings().result_timeout();
        Self {
            board,
            transport,
            reply_key: reply_key.into(),
            result_timeout,
            control_tx: None,
            command_rx,
            shutdown,
        }
    }

    /// Forward control commands (PING, REGISTER*, CLOSE_PORT) to `tx`
    /// instead of only logging them.
    pub fn with_control_forward(mut self, tx: mpsc::Sender<Command>) -> Self {
        self.control_tx = Some(tx);
        self
    }

    pub async fn run(mut self) {
        tracing::info!(reply_key = %self.reply_key, "dispatcher started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::info!("dispatcher shutting down");
                    return;
                }

                cmd = self.command_rx.recv() => {
                    let command = match cmd {
                        Some(c) => c,
                        None => {
                            tracing::info!("inbound queue closed, dispatcher exiting");
                            return;
                        }
                    };
                    self.dispatch(&command).await;
                }
            }
        }
    }

    /// Process one command and publish its reply, if it has one.
    pub async fn dispatch(&self, command: &Command) {
        let Some(reply) = self.process(command).await else {
            return;
        };
        match self.transport.publish(&self.reply_key, reply.to_bytes()) {
            Ok(()) => tracing::debug!(
                kind = %reply.kind(),
                fn_name = reply.fn_name(),
                task_id = reply.task_id(),
                node_id = reply.node_id(),
                "reply sent"
            ),
            Err(e) => tracing::warn!(
                kind = %reply.kind(),
                task_id = reply.task_id(),
                error = %e,
                "failed to publish reply"
            ),
        }
    }

    /// Compute the reply for `command` without publishing it.
    pub async fn process(&self, command: &Command) -> Option<Command> {
        let kind = command.kind();
        tracing::debug!(
            %kind,
            fn_name = command.fn_name(),
            task_id = command.task_id(),
            node_id = command.node_id(),
            "dispatching"
        );

        let outcome = match kind {
            CommandKind::Rexec => self.rexec(command).await.map(|()| (CommandKind::RexecAck, None)),
            CommandKind::GetRexecRes => self
                .get_result(command)
                .await
                .map(|value| (CommandKind::RexecRes, Some(value))),
            k if k.is_control() => {
                self.forward_control(command);
                return None;
            }
            other => {
                tracing::warn!(kind = %other, task_id = command.task_id(), "unsupported command");
                return error_reply(command);
            }
        };

        match outcome {
            Ok((reply_kind, payload)) => match Command::reply(reply_kind, command, payload) {
                Ok(reply) => Some(reply),
                Err(e) => {
                    tracing::warn!(
                        fn_name = command.fn_name(),
                        task_id = command.task_id(),
                        error = %e,
                        "result does not fit a reply"
                    );
                    error_reply(command)
                }
            },
            Err(e) => {
                tracing::warn!(
                    %kind,
                    fn_name = command.fn_name(),
                    task_id = command.task_id(),
                    error = %e,
                    "request failed"
                );
                error_reply(command)
            }
        }
    }

    async fn rexec(&self, command: &Command) -> Result<(), BoardError> {
        let task = self.board.find_by_name(command.fn_name()).await?;
        let instance = self
            .board
            .create_instance(&task, command.task_id(), command.args().to_vec())
            .await?;
        executor::spawn(self.board.clone(), instance);
        Ok(())
    }

    async fn get_result(&self, command: &Command) -> Result<Argument, BoardError> {
        let task = self.board.find_by_name(command.fn_name()).await?;
        let instance = self.board.find_instance(&task, command.task_id()).await?;
        self.board
            .retrieve_and_destroy_within(&instance, self.result_timeout)
            .await
    }

    fn forward_control(&self, command: &Command) {
        let Some(tx) = &self.control_tx else {
            tracing::debug!(
                kind = %command.kind(),
                node_id = command.node_id(),
                "control command ignored"
            );
            return;
        };
        if tx.try_send(command.clone()).is_err() {
            tracing::warn!(kind = %command.kind(), "control channel unavailable, dropping");
        }
    }
}

fn error_reply(trigger: &Command) -> Option<Command> {
    match Command::reply(CommandKind::RexecErr, trigger, None) {
        Ok(reply) => Some(reply),
        Err(e) => {
            tracing::error!(task_id = trigger.task_id(), error = %e, "failed to build error reply");
            None
        }
    }
}
