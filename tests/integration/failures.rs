//! Error replies, non-replies and teardown behaviour.

use std::time::Duration;

use cnode_core::config::BoardSettings;
use cnode_core::wire::{Argument, Command, CommandKind};
use cnode_services::ClientError;
use tokio::sync::mpsc;

use crate::*;

#[tokio::test]
async fn missing_function_gets_exactly_one_error() {
    let mut h = Harness::start(BoardSettings::default(), vec![sum3()]).await;

    h.send(&request(CommandKind::Rexec, "missing", 11, vec![1.into()]));
    let err = h.expect_reply().await;
    assert_eq!(err.kind(), CommandKind::RexecErr);
    assert_eq!(err.fn_name(), "missing");
    assert_eq!(err.task_id(), 11);
    assert_eq!(err.node_id(), CALLER_ID);
    assert!(err.args().is_empty());

    h.expect_silence().await;
    assert_eq!(h.board.stats().await.live_instances, 0);
    h.node.shutdown().await;
}

#[tokio::test]
async fn duplicate_id_while_running_is_rejected() {
    let (gate, release) = gated("gate");
    let mut h = Harness::start(BoardSettings::default(), vec![gate]).await;

    h.send(&request(CommandKind::Rexec, "gate", 5, vec![1.into()]));
    assert_eq!(h.expect_reply().await.kind(), CommandKind::RexecAck);

    h.send(&request(CommandKind::Rexec, "gate", 5, vec![2.into()]));
    let err = h.expect_reply().await;
    assert_eq!(err.kind(), CommandKind::RexecErr);
    assert_eq!(err.task_id(), 5);

    // The first instance is untouched.
    drop(release);
    h.send(&request(CommandKind::GetRexecRes, "gate", 5, vec![]));
    let res = h.expect_reply().await;
    assert_eq!(res.kind(), CommandKind::RexecRes);
    assert_eq!(res.args(), &[Argument::Int32(1)]);

    h.node.shutdown().await;
}

#[tokio::test]
async fn mismatched_arguments_are_rejected() {
    let mut h = Harness::start(BoardSettings::default(), vec![sum3()]).await;

    h.send(&request(CommandKind::Rexec, "sum3", 1, vec![1.into(), 2.into()]));
    assert_eq!(h.expect_reply().await.kind(), CommandKind::RexecErr);

    h.send(&request(
        CommandKind::Rexec,
        "sum3",
        2,
        vec![1.into(), 2.5.into(), 3.into()],
    ));
    assert_eq!(h.expect_reply().await.kind(), CommandKind::RexecErr);

    assert_eq!(h.board.stats().await.live_instances, 0);
    h.node.shutdown().await;
}

#[tokio::test]
async fn instance_capacity_surfaces_as_error() {
    let (gate, release) = gated("gate");
    let settings = BoardSettings {
        max_instances_per_task: 2,
        ..BoardSettings::default()
    };
    let h = Harness::start(settings, vec![gate]).await;
    let client = h.client();

    client.rexec("gate", 1, vec![1.into()]).await.unwrap();
    client.rexec("gate", 2, vec![2.into()]).await.unwrap();
    assert!(matches!(
        client.rexec("gate", 3, vec![3.into()]).await,
        Err(ClientError::Rejected { task_id: 3, .. })
    ));

    drop(release);
    client.get_result("gate", 1).await.unwrap();
    client.rexec("gate", 3, vec![3.into()]).await.unwrap();
    assert_eq!(client.get_result("gate", 3).await.unwrap(), Argument::Int32(3));

    drop(client);
    h.node.shutdown().await;
}

#[tokio::test]
async fn result_is_delivered_at_most_once() {
    let h = Harness::start(BoardSettings::default(), vec![sum3()]).await;
    let client = h.client();

    client.rexec("sum3", 3, vec![1.into(), 2.into(), 3.into()]).await.unwrap();
    assert_eq!(client.get_result("sum3", 3).await.unwrap(), Argument::Int32(6));
    assert!(matches!(
        client.get_result("sum3", 3).await,
        Err(ClientError::Rejected { .. })
    ));

    drop(client);
    h.node.shutdown().await;
}

#[tokio::test]
async fn unknown_kind_gets_error_reply() {
    let mut h = Harness::start(BoardSettings::default(), vec![sum3()]).await;

    h.send(&request(CommandKind::Other(99), "sum3", 8, vec![]));
    let err = h.expect_reply().await;
    assert_eq!(err.kind(), CommandKind::RexecErr);
    assert_eq!(err.task_id(), 8);

    h.node.shutdown().await;
}

#[tokio::test]
async fn control_commands_are_forwarded_without_reply() {
    let (control_tx, mut control_rx) = mpsc::channel(8);
    let mut h =
        Harness::start_with_control(BoardSettings::default(), vec![sum3()], Some(control_tx)).await;

    let ping = request(CommandKind::Ping, "", 0, vec![]);
    let close = request(CommandKind::ClosePort, "", 0, vec![]);
    h.send(&ping);
    h.send(&close);

    h.expect_silence().await;
    assert_eq!(control_rx.recv().await.unwrap(), ping);
    assert_eq!(control_rx.recv().await.unwrap(), close);

    h.node.shutdown().await;
}

#[tokio::test]
async fn malformed_and_own_messages_are_ignored() {
    let mut h = Harness::start(BoardSettings::default(), vec![sum3()]).await;

    h.send_raw(&[0xff, 0x00, 0x13]);
    h.send_raw(&vec![0u8; 2048]);

    // A request on the node's own request key is treated as its own echo.
    let echo = request(CommandKind::Rexec, "sum3", 1, vec![1.into(), 2.into(), 3.into()]);
    h.bus
        .publish(&TransportConfig::default().request_key, echo.to_bytes())
        .unwrap();

    h.expect_silence().await;
    assert_eq!(h.board.stats().await.live_instances, 0);
    h.node.shutdown().await;
}

#[tokio::test]
async fn slow_result_times_out_then_arrives() {
    let (gate, release) = gated("gate");
    let settings = BoardSettings {
        result_timeout_ms: 50,
        ..BoardSettings::default()
    };
    let mut h = Harness::start(settings, vec![gate]).await;

    h.send(&request(CommandKind::Rexec, "gate", 1, vec![4.into()]));
    assert_eq!(h.expect_reply().await.kind(), CommandKind::RexecAck);

    h.send(&request(CommandKind::GetRexecRes, "gate", 1, vec![]));
    assert_eq!(h.expect_reply().await.kind(), CommandKind::RexecErr);
    assert_eq!(h.board.stats().await.live_instances, 1);

    drop(release);
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.send(&request(CommandKind::GetRexecRes, "gate", 1, vec![]));
    let res = h.expect_reply().await;
    assert_eq!(res.kind(), CommandKind::RexecRes);
    assert_eq!(res.args(), &[Argument::Int32(4)]);

    h.node.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_a_waiting_result_request() {
    let (gate, release) = gated("gate");
    let mut h = Harness::start(wait_forever(), vec![gate]).await;

    h.send(&request(CommandKind::Rexec, "gate", 1, vec![1.into()]));
    assert_eq!(h.expect_reply().await.kind(), CommandKind::RexecAck);

    h.send(&request(CommandKind::GetRexecRes, "gate", 1, vec![]));
    h.expect_silence().await;

    let Harness { node, mut replies, .. } = h;
    node.shutdown().await;
    let err: Command = replies.recv().await.unwrap();
    assert_eq!(err.kind(), CommandKind::RexecErr);
    assert_eq!(err.task_id(), 1);

    drop(release);
}
