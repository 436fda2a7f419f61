//! Successful REXEC → REXEC_ACK → GET_REXEC_RES → REXEC_RES flows.

use cnode_core::config::BoardSettings;
use cnode_core::wire::{ArgType, Argument, CommandKind};
use cnode_services::Task;

use crate::*;

#[tokio::test]
async fn sum3_round_trip_over_the_wire() {
    let mut h = Harness::start(BoardSettings::default(), vec![sum3()]).await;

    h.send(&request(
        CommandKind::Rexec,
        "sum3",
        7,
        vec![1.into(), 2.into(), 3.into()],
    ));
    let ack = h.expect_reply().await;
    assert_eq!(ack.kind(), CommandKind::RexecAck);
    assert_eq!(ack.subcommand(), 4);
    assert_eq!(ack.fn_name(), "sum3");
    assert_eq!(ack.task_id(), 7);
    assert_eq!(ack.node_id(), CALLER_ID);
    assert!(ack.signature().is_empty());

    h.send(&request(CommandKind::GetRexecRes, "sum3", 7, vec![]));
    let res = h.expect_reply().await;
    assert_eq!(res.kind(), CommandKind::RexecRes);
    assert_eq!(res.task_id(), 7);
    assert_eq!(res.node_id(), CALLER_ID);
    assert_eq!(res.signature().to_string(), "i");
    assert_eq!(res.args(), &[Argument::Int32(6)]);

    let stats = h.board.stats().await;
    assert_eq!(stats.live_instances, 0);
    assert_eq!(stats.dead_instances, 1);
    assert_eq!(stats.last_dead_id, Some(7));

    h.expect_silence().await;
    h.node.shutdown().await;
}

#[tokio::test]
async fn client_call_covers_every_argument_type() {
    let tasks = vec![
        sum3(),
        Task::new("shout", ArgType::String, "s", |ctx| {
            Argument::String(ctx.string(0).unwrap_or_default().to_uppercase())
        })
        .unwrap(),
        Task::new("half", ArgType::Float64, "f", |ctx| {
            Argument::Float64(ctx.float64(0).unwrap_or_default() / 2.0)
        })
        .unwrap(),
        Task::new("widen", ArgType::Int64, "l", |ctx| {
            Argument::Int64(ctx.int64(0).unwrap_or_default() * 1_000_000)
        })
        .unwrap(),
        Task::new("reverse", ArgType::Blob, "n", |ctx| {
            let mut bytes = ctx.blob(0).unwrap_or_default().to_vec();
            bytes.reverse();
            Argument::Blob(bytes)
        })
        .unwrap(),
    ];
    let h = Harness::start(BoardSettings::default(), tasks).await;
    let client = h.client();

    assert_eq!(
        client.call("sum3", 1, vec![10.into(), 20.into(), 30.into()]).await.unwrap(),
        Argument::Int32(60)
    );
    assert_eq!(
        client.call("shout", 2, vec!["hey".into()]).await.unwrap(),
        Argument::from("HEY")
    );
    assert_eq!(
        client.call("half", 3, vec![5.0.into()]).await.unwrap(),
        Argument::Float64(2.5)
    );
    assert_eq!(
        client.call("widen", 4, vec![5_000_000i64.into()]).await.unwrap(),
        Argument::Int64(5_000_000_000_000)
    );
    assert_eq!(
        client.call("reverse", 5, vec![vec![1u8, 2, 3].into()]).await.unwrap(),
        Argument::Blob(vec![3, 2, 1])
    );

    assert_eq!(h.board.stats().await.live_instances, 0);
    drop(client);
    h.node.shutdown().await;
}

#[tokio::test]
async fn void_task_reports_empty_result() {
    let noop = Task::new("noop", ArgType::Void, "", |_| Argument::Void).unwrap();
    let mut h = Harness::start(BoardSettings::default(), vec![noop]).await;

    h.send(&request(CommandKind::Rexec, "noop", 1, vec![]));
    assert_eq!(h.expect_reply().await.kind(), CommandKind::RexecAck);
    h.send(&request(CommandKind::GetRexecRes, "noop", 1, vec![]));
    let res = h.expect_reply().await;
    assert_eq!(res.kind(), CommandKind::RexecRes);
    assert!(res.args().is_empty());

    h.node.shutdown().await;
}

#[tokio::test]
async fn instances_run_concurrently_and_ids_are_reusable() {
    let (gate, release) = gated("gate");
    let h = Harness::start(BoardSettings::default(), vec![gate]).await;
    let client = h.client();

    for id in 0..3 {
        client.rexec("gate", id, vec![(id as i32).into()]).await.unwrap();
    }
    assert_eq!(h.board.stats().await.live_instances, 3);

    drop(release);
    for id in 0..3 {
        assert_eq!(
            client.get_result("gate", id).await.unwrap(),
            Argument::Int32(id as i32)
        );
    }

    // Ids are free again once collected.
    client.rexec("gate", 0, vec![9.into()]).await.unwrap();
    assert_eq!(client.get_result("gate", 0).await.unwrap(), Argument::Int32(9));

    drop(client);
    h.node.shutdown().await;
}

#[tokio::test]
async fn replies_are_addressed_to_each_caller() {
    let h = Harness::start(BoardSettings::default(), vec![sum3()]).await;
    let alice = RexecClient::new(
        std::sync::Arc::new(h.bus.clone()),
        "alice",
        CALLER_REQUEST_KEY,
        REPLY_EXPR,
    )
    .unwrap();
    let bob = RexecClient::new(
        std::sync::Arc::new(h.bus.clone()),
        "bob",
        CALLER_REQUEST_KEY,
        REPLY_EXPR,
    )
    .unwrap();

    // Same function, different correlation ids, interleaved.
    alice.rexec("sum3", 1, vec![1.into(), 1.into(), 1.into()]).await.unwrap();
    bob.rexec("sum3", 2, vec![2.into(), 2.into(), 2.into()]).await.unwrap();
    assert_eq!(bob.get_result("sum3", 2).await.unwrap(), Argument::Int32(6));
    assert_eq!(alice.get_result("sum3", 1).await.unwrap(), Argument::Int32(3));

    drop((alice, bob));
    h.node.shutdown().await;
}
