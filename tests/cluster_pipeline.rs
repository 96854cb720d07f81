//! Pipelining on the blocking context.

mod common;

use common::{addr, FakeCluster, A, B, C};
use slotmux::{command, Cmd, ErrorKind, Frame};

#[test]
fn test_replies_in_submission_order() {
    let cluster = FakeCluster::new();
    let mut ctx = cluster.builder().connect().unwrap();

    ctx.append_command(&command::set("a", "1")).unwrap();
    ctx.append_command(&command::set("b", "2")).unwrap();
    ctx.append_command(&command::get("a")).unwrap();
    assert!(cluster.data_log().is_empty());

    assert_eq!(ctx.get_reply().unwrap(), Some(Frame::ok()));
    assert_eq!(ctx.get_reply().unwrap(), Some(Frame::ok()));
    assert_eq!(ctx.get_reply().unwrap(), Some(Frame::bulk("1")));
    assert_eq!(ctx.get_reply().unwrap(), None);
    assert_eq!(ctx.get_reply().unwrap(), None);
}

#[test]
fn test_reply_to_every_node() {
    let cluster = FakeCluster::new();
    cluster.put("foo", "1");
    let mut ctx = cluster.builder().connect().unwrap();

    let nodes: Vec<_> = ctx.node_iter().map(|n| n.address).collect();
    for node in &nodes {
        ctx.append_command_to_node(node, &Cmd::new("DBSIZE")).unwrap();
    }
    let mut sizes = Vec::new();
    while let Some(reply) = ctx.get_reply().unwrap() {
        sizes.push(reply.as_int().unwrap());
    }
    assert_eq!(sizes, vec![0, 0, 1]);
    assert_eq!(nodes, vec![addr(A), addr(B), addr(C)]);
}

#[test]
fn test_split_command_in_pipeline() {
    let cluster = FakeCluster::new();
    let mut ctx = cluster.builder().connect().unwrap();

    ctx.append_command(&command::mset([("a", "1"), ("b", "2"), ("c", "3")]))
        .unwrap();
    ctx.append_command(&command::mget(["c", "b", "a"])).unwrap();
    ctx.append_argv(&["GET", "b"]).unwrap();

    assert_eq!(ctx.get_reply().unwrap(), Some(Frame::ok()));
    assert_eq!(
        ctx.get_reply().unwrap(),
        Some(Frame::Array(vec![
            Frame::bulk("3"),
            Frame::bulk("2"),
            Frame::bulk("1")
        ]))
    );
    assert_eq!(ctx.get_reply().unwrap(), Some(Frame::bulk("2")));
    assert_eq!(ctx.get_reply().unwrap(), None);
}

#[test]
fn test_direct_command_rejected_while_pending() {
    let cluster = FakeCluster::new();
    let mut ctx = cluster.builder().connect().unwrap();

    ctx.append_command(&command::set("a", "1")).unwrap();
    let err = ctx.command(&command::get("a")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    assert_eq!(ctx.get_reply().unwrap(), Some(Frame::ok()));
    assert_eq!(ctx.get_reply().unwrap(), None);
    assert_eq!(ctx.command(&command::get("a")).unwrap(), Frame::bulk("1"));
}

#[test]
fn test_cross_slot_append_leaves_queue_untouched() {
    let cluster = FakeCluster::new();
    let mut ctx = cluster.builder().connect().unwrap();

    ctx.append_command(&command::set("a", "1")).unwrap();
    let err = ctx
        .append_command(&Cmd::new("SUNION").arg("a").arg("b"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrossSlot);
    assert_eq!(ctx.get_reply().unwrap(), Some(Frame::ok()));
    assert_eq!(ctx.get_reply().unwrap(), None);
}

#[test]
fn test_reset_discards_queue() {
    let cluster = FakeCluster::new();
    let mut ctx = cluster.builder().connect().unwrap();

    ctx.append_command(&command::set("a", "1")).unwrap();
    ctx.append_command(&command::set("b", "2")).unwrap();
    ctx.reset().unwrap();
    assert_eq!(ctx.get_reply().unwrap(), None);
    assert!(cluster.data_log().is_empty());
    assert_eq!(ctx.command(&command::get("a")).unwrap(), Frame::BulkString(None));
}

#[test]
fn test_moved_in_pipeline_refreshes_on_reset() {
    let cluster = FakeCluster::new();
    let mut ctx = cluster.builder().connect().unwrap();
    cluster.reshard("foo", A);

    ctx.append_command(&command::get("foo")).unwrap();
    let reply = ctx.get_reply().unwrap().unwrap();
    assert!(reply.error_message().unwrap().starts_with("MOVED"));
    assert_eq!(ctx.route_version(), 1);

    ctx.reset().unwrap();
    assert_eq!(ctx.route_version(), 2);

    cluster.clear_log();
    ctx.command(&command::get("foo")).unwrap();
    assert_eq!(cluster.data_log()[0].0, A);
}

#[test]
fn test_append_between_replies_queues_behind_fetched() {
    let cluster = FakeCluster::new();
    let mut ctx = cluster.builder().connect().unwrap();

    ctx.append_command(&command::set("a", "1")).unwrap();
    ctx.append_command(&command::set("b", "2")).unwrap();
    assert_eq!(ctx.get_reply().unwrap(), Some(Frame::ok()));

    ctx.append_command(&command::get("a")).unwrap();
    ctx.append_command(&command::mget(["a", "b"])).unwrap();
    assert!(ctx.command(&command::get("a")).is_err());

    assert_eq!(ctx.get_reply().unwrap(), Some(Frame::ok()));
    assert_eq!(ctx.get_reply().unwrap(), Some(Frame::bulk("1")));
    assert_eq!(
        ctx.get_reply().unwrap(),
        Some(Frame::Array(vec![Frame::bulk("1"), Frame::bulk("2")]))
    );
    assert_eq!(ctx.get_reply().unwrap(), None);
    assert_eq!(ctx.command(&command::get("b")).unwrap(), Frame::bulk("2"));
}
