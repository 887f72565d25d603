use std::sync::Arc;
use std::time::{Duration, Instant};

use reef_bridge::{
    script_spawn_handler, ExecutionBridge, MessageHandler, PollInterest, SpawnError, WakeValue,
};

fn readable() -> PollInterest {
    PollInterest::READABLE
}

#[tokio::test]
async fn poll_with_zero_timeout_and_nothing_ready_times_out_immediately() {
    let bridge = ExecutionBridge::new();
    let fd = bridge.alloc_fd();
    bridge.sockets.register_socket(fd, false);
    bridge.sockets.connect_peer(fd).unwrap();

    let started = Instant::now();
    let wake = bridge
        .poll_descriptor(fd, readable(), Some(Duration::ZERO))
        .await;
    assert!(matches!(wake, WakeValue::PollTimedOut));
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn poll_resolves_immediately_when_data_is_buffered() {
    let bridge = ExecutionBridge::new();
    let fd = bridge.alloc_fd();
    bridge.sockets.register_socket(fd, false);
    let peer = bridge.sockets.connect_peer(fd).unwrap();
    bridge.sockets.push_data(peer, b"ready".to_vec());

    let wake = bridge
        .poll_descriptor(fd, readable(), Some(Duration::ZERO))
        .await;
    assert!(matches!(wake, WakeValue::PollReady));
}

#[tokio::test]
async fn poll_wakes_on_data_pushed_while_waiting() {
    let bridge = Arc::new(ExecutionBridge::new());
    let fd = bridge.alloc_fd();
    bridge.sockets.register_socket(fd, false);
    let peer = bridge.sockets.connect_peer(fd).unwrap();

    let pusher = Arc::clone(&bridge);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        pusher.sockets.push_data(peer, b"late".to_vec());
    });

    let wake = bridge
        .poll_descriptor(fd, readable(), Some(Duration::from_secs(5)))
        .await;
    assert!(matches!(wake, WakeValue::PollReady));

    // The winning listener was consumed and no loser leaked.
    let views = bridge.sockets.poll_view(fd).unwrap();
    assert_eq!(views[0].sink.listener_count(), 0);
}

#[tokio::test]
async fn poll_for_writable_is_ready_once_the_peer_opens() {
    let bridge = ExecutionBridge::new();
    let fd = bridge.alloc_fd();
    bridge.sockets.register_socket(fd, false);
    let peer = bridge.sockets.connect_peer(fd).unwrap();
    bridge.sockets.open_peer(peer);

    let wake = bridge
        .poll_descriptor(fd, PollInterest::WRITABLE, Some(Duration::ZERO))
        .await;
    assert!(matches!(wake, WakeValue::PollReady));
}

#[tokio::test]
async fn spawn_without_a_handler_is_the_unsupported_condition() {
    let bridge = ExecutionBridge::new();
    match bridge.spawn("anything").await {
        WakeValue::SpawnFailed(SpawnError::Unsupported) => {}
        other => panic!("expected the unsupported condition, got {other:?}"),
    }
}

#[tokio::test]
async fn spawn_wait_read_round_trip() {
    let bridge = ExecutionBridge::new();
    bridge.set_spawn_handler(script_spawn_handler(|command, mut api| {
        assert_eq!(command, "hello");
        api.stdout("child says hi");
        api.exit(0);
    }));

    let spawned = match bridge.spawn("hello").await {
        WakeValue::Spawned(spawned) => spawned,
        other => panic!("spawn failed: {other:?}"),
    };

    match bridge.wait_process(spawned.pid).await {
        WakeValue::ProcessExited(0) => {}
        other => panic!("unexpected wait result: {other:?}"),
    }

    match bridge.read_stream(spawned.stdout).await {
        WakeValue::Bytes(data) => assert_eq!(data, b"child says hi"),
        other => panic!("unexpected read result: {other:?}"),
    }
}

#[tokio::test]
async fn read_retry_stops_once_the_process_has_exited() {
    let bridge = ExecutionBridge::new();
    bridge.set_spawn_handler(script_spawn_handler(|_command, mut api| {
        api.exit(0);
    }));

    let spawned = match bridge.spawn("silent").await {
        WakeValue::Spawned(spawned) => spawned,
        other => panic!("spawn failed: {other:?}"),
    };
    match bridge.wait_process(spawned.pid).await {
        WakeValue::ProcessExited(0) => {}
        other => panic!("unexpected wait result: {other:?}"),
    }

    let started = Instant::now();
    let wake = bridge.read_stream(spawned.stdout).await;
    assert!(matches!(wake, WakeValue::WouldBlock));
    // Stopped on the exited flag, nowhere near the retry budget.
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn stdin_writes_are_forwarded_to_the_child() {
    let bridge = ExecutionBridge::new();
    bridge.set_spawn_handler(script_spawn_handler(|_command, mut api| {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let input = api.flush_stdin();
            api.stdout(input);
            api.exit(0);
        });
    }));

    let spawned = match bridge.spawn("cat").await {
        WakeValue::Spawned(spawned) => spawned,
        other => panic!("spawn failed: {other:?}"),
    };
    assert!(bridge.procs.write_stdin(spawned.pid, b"piped in".to_vec()));

    match bridge.wait_process(spawned.pid).await {
        WakeValue::ProcessExited(0) => {}
        other => panic!("unexpected wait result: {other:?}"),
    }
    match bridge.read_stream(spawned.stdout).await {
        WakeValue::Bytes(data) => assert_eq!(data, b"piped in"),
        other => panic!("unexpected read result: {other:?}"),
    }
}

#[tokio::test]
async fn process_exit_wakes_a_blocked_poller() {
    let bridge = Arc::new(ExecutionBridge::new());
    bridge.set_spawn_handler(script_spawn_handler(|_command, mut api| {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            api.exit(7);
        });
    }));

    let spawned = match bridge.spawn("slow").await {
        WakeValue::Spawned(spawned) => spawned,
        other => panic!("spawn failed: {other:?}"),
    };

    let wake = bridge
        .poll_descriptor(spawned.stdout, readable(), Some(Duration::from_secs(5)))
        .await;
    assert!(matches!(wake, WakeValue::PollReady));
}

struct FixedReply(&'static [u8]);

impl MessageHandler for FixedReply {
    fn handle(&self, _payload: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(Some(self.0.to_vec()))
    }
}

struct FailingHandler;

impl MessageHandler for FailingHandler {
    fn handle(&self, _payload: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        anyhow::bail!("handler blew up")
    }
}

#[tokio::test]
async fn first_non_empty_message_reply_wins() {
    let bridge = ExecutionBridge::new();
    bridge.add_message_handler(Arc::new(FixedReply(b"")));
    bridge.add_message_handler(Arc::new(FixedReply(b"second")));
    bridge.add_message_handler(Arc::new(FixedReply(b"third")));

    match bridge.post_message(b"ping").await {
        WakeValue::Reply(reply) => assert_eq!(reply, b"second"),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn message_handler_errors_resolve_as_an_empty_reply() {
    let bridge = ExecutionBridge::new();
    bridge.add_message_handler(Arc::new(FailingHandler));
    bridge.add_message_handler(Arc::new(FixedReply(b"never reached")));

    match bridge.post_message(b"ping").await {
        WakeValue::Reply(reply) => assert!(reply.is_empty()),
        other => panic!("unexpected reply: {other:?}"),
    }
}
