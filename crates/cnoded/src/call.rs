//! `cnoded call` — invoke a task on whichever node offers it.
//!
//! Arguments are given as `<sig>:<value>`, e.g. `i:3`, `f:1.5`, `s:hello`,
//! `n:deadbeef` (hex), `l:-9`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use cnode_core::config::NodeConfig;
use cnode_core::wire::{ArgType, Argument};
use cnode_services::RexecClient;

use crate::transport::UdpTransport;

/// Callers publish below the nodes' own request key so nodes don't discard
/// the request as an echo of themselves.
pub const CALLER_REQUEST_KEY: &str = "app/requests/down";
pub const CALLER_REPLY_EXPR: &str = "app/replies/**";

pub async fn run(config: &NodeConfig, node_id: String, args: &[String]) -> Result<()> {
    let (fn_name, task_id, call_args) = parse_call(args)?;

    let (transport, send_worker) = UdpTransport::bind(&config.transport)?;
    let transport = Arc::new(transport);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let send_task = tokio::spawn(send_worker.run());
    let recv_task = tokio::spawn(transport.clone().recv_loop(shutdown_tx.subscribe()));

    let client = RexecClient::new(transport, node_id, CALLER_REQUEST_KEY, CALLER_REPLY_EXPR)?;
    let result = client.call(&fn_name, task_id, call_args).await;

    drop(client);
    let _ = shutdown_tx.send(());
    let _ = recv_task.await;
    let _ = send_task.await;

    let value = result.with_context(|| format!("{fn_name}#{task_id} failed"))?;
    println!("{}", render(&value));
    Ok(())
}

fn parse_call(args: &[String]) -> Result<(String, u64, Vec<Argument>)> {
    let [fn_name, task_id, rest @ ..] = args else {
        anyhow::bail!("usage: cnoded call <fn_name> <task_id> [<sig>:<value>...]");
    };
    let task_id = task_id
        .parse()
        .with_context(|| format!("task id {task_id} is not an unsigned integer"))?;
    let call_args = rest
        .iter()
        .map(|a| parse_arg(a))
        .collect::<Result<Vec<_>>>()?;
    Ok((fn_name.clone(), task_id, call_args))
}

pub fn parse_arg(text: &str) -> Result<Argument> {
    let (sig, value) = text
        .split_once(':')
        .with_context(|| format!("argument {text} is not <sig>:<value>"))?;
    let mut chars = sig.chars();
    let ty = match (chars.next(), chars.next()) {
        (Some(c), None) => ArgType::from_sig_char(c),
        _ => None,
    }
    .with_context(|| format!("unknown signature {sig}"))?;

    let arg = match ty {
        ArgType::Int32 => Argument::Int32(value.parse().context("bad i32")?),
        ArgType::Int64 => Argument::Int64(value.parse().context("bad i64")?),
        ArgType::Float64 => Argument::Float64(value.parse().context("bad f64")?),
        ArgType::String => Argument::String(value.to_string()),
        ArgType::Blob => Argument::Blob(hex::decode(value).context("bad hex blob")?),
        other => anyhow::bail!("{other} cannot be passed as an argument"),
    };
    Ok(arg)
}

fn render(value: &Argument) -> String {
    match value {
        Argument::Null | Argument::Void => "(void)".to_string(),
        Argument::String(s) => s.clone(),
        Argument::Int32(n) => n.to_string(),
        Argument::Int64(n) => n.to_string(),
        Argument::Float64(x) => x.to_string(),
        Argument::Blob(b) => hex::encode(b),
    }
}
