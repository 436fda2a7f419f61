//! cnoded — remote-execution node daemon.
//!
//! `cnoded` serves the built-in tasks over UDP multicast until ctrl-c.
//! `cnoded call <fn_name> <task_id> [<sig>:<value>...]` invokes a task on
//! the link and prints its result.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use cnode_core::config::NodeConfig;
use cnode_core::identity;
use cnode_core::wire::Command;
use cnode_services::{Node, TaskBoard};

mod call;
mod tasks;
mod transport;

use transport::UdpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = NodeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = NodeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        NodeConfig::default()
    });

    let node_id = identity::resolve(&config.identity).context("failed to resolve node id")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("call") {
        return call::run(&config, node_id, &args[1..]).await;
    }

    tracing::info!(node_id = %node_id, "cnoded starting");
    serve(config).await
}

async fn serve(config: NodeConfig) -> Result<()> {
    // Board
    let board = TaskBoard::new(config.board.clone());
    let registered = tasks::register_all(&board)
        .await
        .context("failed to register built-in tasks")?;
    tracing::info!(
        tasks = registered,
        max_tasks = config.board.max_tasks,
        max_instances_per_task = config.board.max_instances_per_task,
        result_timeout_ms = config.board.result_timeout_ms,
        "task board ready"
    );

    // Transport
    let (transport, send_worker) =
        UdpTransport::bind(&config.transport).context("failed to bind udp transport")?;
    let transport = Arc::new(transport);

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let mut send_task = tokio::spawn(send_worker.run());
    let recv_task = tokio::spawn(transport.clone().recv_loop(shutdown_tx.subscribe()));

    let (control_tx, control_rx) = mpsc::channel::<Command>(16);
    let node = Node::start_with_control(
        board.clone(),
        transport.clone(),
        &config.transport,
        Some(control_tx),
    )
    .context("failed to start node")?;

    let control_logger = tokio::spawn(log_control(control_rx));

    let stats_printer = {
        let board = board.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let stats = board.stats().await;
                tracing::info!(
                    tasks = stats.tasks,
                    live = stats.live_instances,
                    finished = stats.dead_instances,
                    last_finished = ?stats.last_dead_id,
                    "board snapshot"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    let send_running = tokio::select! {
        _ = shutdown_rx.recv()  => { tracing::info!("shutting down"); true }
        r = recv_task           => { tracing::error!("udp receive loop exited: {:?}", r); true }
        r = &mut send_task      => { tracing::error!("send worker exited: {:?}", r); false }
        r = control_logger      => { tracing::error!("control logger exited: {:?}", r); true }
        r = stats_printer       => { tracing::error!("stats printer exited: {:?}", r); true }
    };

    let _ = shutdown_tx.send(());
    node.shutdown().await;

    // Flush replies queued during shutdown.
    drop(transport);
    if send_running && tokio::time::timeout(Duration::from_secs(1), send_task).await.is_err() {
        tracing::warn!("send queue not drained before exit");
    }
    Ok(())
}

/// Control traffic is not elaborated by this node; record who is talking.
async fn log_control(mut control_rx: mpsc::Receiver<Command>) {
    while let Some(command) = control_rx.recv().await {
        tracing::info!(
            kind = %command.kind(),
            node_id = command.node_id(),
            fn_name = command.fn_name(),
            "control command"
        );
    }
}
