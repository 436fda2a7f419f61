//! Bounded inbound queue: overflow is dropped, not blocked on.

use cnode_core::config::BoardSettings;
use cnode_core::wire::{Argument, CommandKind};

use crate::*;

#[tokio::test]
async fn full_queue_drops_without_reply() {
    let logs = LogCapture::default();
    let _logging = logs.install();
    let (gate, release) = gated("gate");
    let settings = BoardSettings {
        inbound_queue_capacity: 1,
        ..wait_forever()
    };
    let mut h = Harness::start(settings, vec![gate, sum3()]).await;

    h.send(&request(CommandKind::Rexec, "gate", 1, vec![1.into()]));
    assert_eq!(h.expect_reply().await.kind(), CommandKind::RexecAck);

    // Park the dispatcher on an unfinished result.
    h.send(&request(CommandKind::GetRexecRes, "gate", 1, vec![]));
    h.expect_silence().await;

    h.send(&request(CommandKind::Rexec, "missing", 2, vec![]));
    h.send(&request(CommandKind::Rexec, "missing", 3, vec![]));
    assert_eq!(h.node.dropped(), 1);
    let log = logs.contents();
    assert!(log.contains("inbound queue full, dropping command"), "log was: {log}");
    assert!(log.contains("task_id=3"), "log was: {log}");

    drop(release);
    let res = h.expect_reply().await;
    assert_eq!((res.kind(), res.task_id()), (CommandKind::RexecRes, 1));
    assert_eq!(res.args(), &[Argument::Int32(1)]);

    let queued = h.expect_reply().await;
    assert_eq!((queued.kind(), queued.task_id()), (CommandKind::RexecErr, 2));

    // The dropped command never gets an answer.
    h.expect_silence().await;
    h.node.shutdown().await;
}

#[tokio::test]
async fn commands_are_answered_in_arrival_order() {
    let mut h = Harness::start(BoardSettings::default(), vec![sum3()]).await;

    for id in 0..10 {
        h.send(&request(
            CommandKind::Rexec,
            "sum3",
            id,
            vec![1.into(), 2.into(), 3.into()],
        ));
        h.send(&request(CommandKind::GetRexecRes, "sum3", id, vec![]));
    }
    for id in 0..10 {
        let ack = h.expect_reply().await;
        assert_eq!((ack.kind(), ack.task_id()), (CommandKind::RexecAck, id));
        let res = h.expect_reply().await;
        assert_eq!((res.kind(), res.task_id()), (CommandKind::RexecRes, id));
    }

    assert_eq!(h.node.dropped(), 0);
    h.node.shutdown().await;
}
