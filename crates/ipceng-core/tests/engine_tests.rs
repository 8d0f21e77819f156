//! Integration tests for the Engine public interface on the in-memory backend.
//!
//! These exercise whole conversations between engines sharing one namespace,
//! plus the last-error contract callers rely on.

use ipceng::{
    ChannelOptions, Engine, EngineBuilder, FaultPoint, IpcBackend, IpcError, MemoryBackend,
    Operation, QueueLimits,
};
use tempfile::TempDir;

/// Ceiling files matching a stock Linux host.
fn create_test_limits() -> (TempDir, QueueLimits) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let msg_max = temp_dir.path().join("msg_max");
    let msgsize_max = temp_dir.path().join("msgsize_max");
    std::fs::write(&msg_max, "10\n").unwrap();
    std::fs::write(&msgsize_max, "8192\n").unwrap();
    (temp_dir, QueueLimits::at(msg_max, msgsize_max))
}

fn create_engine(name: &str, backend: &MemoryBackend, limits: &QueueLimits) -> Engine<MemoryBackend> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    EngineBuilder::with_backend(name, backend.clone())
        .limits(limits.clone())
        .logging(true)
        .build()
        .unwrap()
}

#[test]
fn test_conversation_between_two_engines() {
    let (_dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);
    let mut b = create_engine("B", &backend, &limits);

    a.add_channel("B", &ChannelOptions::default()).unwrap();
    b.add_channel("A", &ChannelOptions::default()).unwrap();
    assert_eq!(backend.queue_names().len(), 2);

    a.send_text("B", "hello world!", 0).unwrap();
    let message = b.receive("A").unwrap();
    assert_eq!(message.payload, b"hello world!\0");
    assert_eq!(message.payload.len(), 13);

    b.send("A", b"ack", 3).unwrap();
    let reply = a.receive("B").unwrap();
    assert_eq!(reply.payload, b"ack");
    assert_eq!(reply.priority, 3);

    a.delete_channel("B").unwrap();
    b.delete_channel("A").unwrap();
    assert!(backend.queue_names().is_empty());

    a.terminate().unwrap();
    b.terminate().unwrap();
}

#[test]
fn test_repeated_sends_arrive_in_order() {
    let (_dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);
    let mut b = create_engine("B", &backend, &limits);
    a.add_channel("B", &ChannelOptions::non_blocking()).unwrap();
    b.add_channel("A", &ChannelOptions::non_blocking()).unwrap();

    for round in 0..10 {
        for i in 0..10 {
            a.send("B", format!("{}:{}", round, i).as_bytes(), 0).unwrap();
        }
        for i in 0..10 {
            let payload = b.receive_simple("A").unwrap();
            assert_eq!(payload, format!("{}:{}", round, i).as_bytes());
        }
    }

    let err = b.receive("A").unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn test_queue_depth_is_honored() {
    let (_dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);
    a.add_channel("B", &ChannelOptions::non_blocking()).unwrap();

    for i in 0..10 {
        a.send("B", &[i], 0).unwrap();
    }
    assert!(a.send("B", &[10], 0).is_err());
    assert_eq!(backend.queued_messages("/A2B.mq"), 10);
}

#[test]
fn test_channel_add_rolls_back_on_inbound_failure() {
    let (_dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);
    backend.fail_next(FaultPoint::OpenQueue, "/B2A.mq");

    assert!(a.add_channel_simple("B").is_err());
    assert_eq!(a.error_code(), Operation::ChannelAdd.code());
    assert_eq!(a.channel_count(), 0);
    assert!(!backend.queue_exists("/A2B.mq").unwrap());
    assert_eq!(backend.pending_faults(), 0);

    // Nothing was left behind, so a retry succeeds.
    a.add_channel_simple("B").unwrap();
    assert_eq!(a.error_code(), 0);
}

#[test]
fn test_ceiling_is_reread_on_every_add() {
    let (dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);
    let options = ChannelOptions::default().max_messages(20);

    let err = a.add_channel("B", &options).unwrap_err();
    assert!(matches!(err, IpcError::CeilingExceeded { .. }));

    std::fs::write(dir.path().join("msg_max"), "32\n").unwrap();
    a.add_channel("B", &options).unwrap();
    assert_eq!(a.channel_info("B").unwrap().max_messages, 20);
}

#[test]
fn test_unreadable_ceiling_fails_add() {
    let backend = MemoryBackend::new();
    let mut a = EngineBuilder::with_backend("A", backend.clone())
        .limits(QueueLimits::at("/nonexistent/msg_max", "/nonexistent/msgsize_max"))
        .build()
        .unwrap();

    let err = a.add_channel_simple("B").unwrap_err();
    assert!(matches!(err, IpcError::CeilingUnreadable { .. }));
    assert!(backend.queue_names().is_empty());
}

#[test]
fn test_last_error_codes_per_operation() {
    let (_dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);

    let cases: Vec<(Operation, fn(&mut Engine<MemoryBackend>) -> bool)> = vec![
        (Operation::ChannelOpen, |e: &mut Engine<MemoryBackend>| e.open_channel("X").is_err()),
        (Operation::ChannelSend, |e: &mut Engine<MemoryBackend>| e.send_simple("X", b"x").is_err()),
        (Operation::ChannelReceive, |e: &mut Engine<MemoryBackend>| e.receive("X").is_err()),
        (Operation::RegionAdd, |e: &mut Engine<MemoryBackend>| e.add_region("r", 0).is_err()),
        (Operation::RegionOpen, |e: &mut Engine<MemoryBackend>| e.open_region("X").is_err()),
        (Operation::RegionRead, |e: &mut Engine<MemoryBackend>| e.read_region("X", 0, 1).is_err()),
        (Operation::RegionWrite, |e: &mut Engine<MemoryBackend>| e.write_region("X", 0, b"x").is_err()),
    ];

    for (operation, call) in cases {
        assert!(call(&mut a), "{} should fail", operation);
        assert_eq!(a.error_code(), operation.code());
        assert_eq!(a.last_error().operation, Some(operation));
        assert!(a.error_message().starts_with(&format!("failed to {}", operation)));

        a.delete_channel("X").unwrap();
        assert_eq!(a.error_code(), 0);
        assert_eq!(a.error_message(), "no error");
    }
}

#[test]
fn test_region_round_trip_between_engines() {
    let (_dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);
    let mut b = create_engine("B", &backend, &limits);

    a.add_region("frame", 13).unwrap();
    b.add_region("frame", 13).unwrap();
    a.write_region("frame", 0, b"hello world!\0").unwrap();
    assert_eq!(b.read_region("frame", 0, 13).unwrap(), b"hello world!\0");

    assert!(b.read_region("frame", 1, 13).is_err());
    assert_eq!(b.error_code(), Operation::RegionRead.code());

    a.delete_region("frame").unwrap();
    b.delete_region("frame").unwrap();
    assert!(backend.segment_names().is_empty());
}

#[test]
fn test_short_read_from_larger_region() {
    let (_dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);
    let mut b = create_engine("B", &backend, &limits);

    a.add_region("frame", 100).unwrap();
    b.add_region("frame", 100).unwrap();
    assert_eq!(backend.segment_size("/frame.shm"), Some(100));

    a.write_region("frame", 0, b"hello world!\0").unwrap();
    assert_eq!(b.read_region("frame", 0, 13).unwrap(), b"hello world!\0");
    assert_eq!(b.read_region("frame", 13, 87).unwrap(), vec![0; 87]);
    assert_eq!(b.error_code(), 0);

    assert!(b.read_region("frame", 88, 13).is_err());
    assert_eq!(b.error_code(), Operation::RegionRead.code());
}

#[test]
fn test_failed_region_add_leaves_no_object() {
    let (_dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);
    backend.fail_next(FaultPoint::MapSegment, "/fresh.shm");

    assert!(a.add_region("fresh", 64).is_err());
    assert_eq!(a.error_code(), Operation::RegionAdd.code());
    assert!(!backend.segment_exists("/fresh.shm").unwrap());
    assert!(backend.segment_names().is_empty());
    assert_eq!(backend.live_segment_handles(), 0);
}

#[test]
fn test_terminate_leaves_objects_for_peers() {
    let (_dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);
    let mut b = create_engine("B", &backend, &limits);
    a.add_channel("B", &ChannelOptions::non_blocking()).unwrap();
    b.add_channel("A", &ChannelOptions::non_blocking()).unwrap();

    a.send_simple("B", b"parting words").unwrap();
    a.terminate().unwrap();

    assert_eq!(b.receive_simple("A").unwrap(), b"parting words");
}

#[test]
fn test_info_serializes() {
    let (_dir, limits) = create_test_limits();
    let backend = MemoryBackend::new();
    let mut a = create_engine("A", &backend, &limits);
    a.add_channel_simple("B").unwrap();
    a.add_region("frame", 64).unwrap();

    let channel = serde_json::to_value(a.channel_info("B").unwrap()).unwrap();
    assert_eq!(channel["outbound_queue"], "/A2B.mq");
    assert_eq!(channel["inbound_open"], true);

    let region = serde_json::to_value(a.region_info("frame").unwrap()).unwrap();
    assert_eq!(region["system_name"], "/frame.shm");
    assert_eq!(region["size"], 64);
}
