use std::sync::Arc;
use std::time::Duration;

use device_link::mock::{MockDevice, MockOp};
use device_link::{DeviceLink, LinkConfig, LinkError};
use tokio::sync::broadcast;
use types::ConnectionState::{self, Connected, Connecting, Disconnected};
use types::ConnectionChanged;

fn test_config() -> LinkConfig {
    LinkConfig {
        host: "127.0.0.1".to_string(),
        port: 1502,
        unit_id: 85,
        timeout_ms: 100,
        connect_retries: 2,
        retry_backoff_ms: 1,
        retry_max_backoff_ms: 1,
        max_batch_size: None,
    }
}

fn link_with(device: &MockDevice, config: LinkConfig) -> DeviceLink {
    DeviceLink::new(config, device.connector())
}

fn drain(rx: &mut broadcast::Receiver<ConnectionChanged>) -> Vec<(ConnectionState, ConnectionState)> {
    let mut out = Vec::new();
    while let Ok(change) = rx.try_recv() {
        out.push((change.from, change.to));
    }
    out
}

#[tokio::test]
async fn connect_transitions_through_connecting() {
    let device = MockDevice::new();
    let link = link_with(&device, test_config());
    let mut rx = link.subscribe_transitions();

    link.connect().await.expect("connect");

    assert_eq!(link.state(), Connected);
    assert_eq!(drain(&mut rx), vec![(Disconnected, Connecting), (Connecting, Connected)]);
    assert_eq!(device.connect_count(), 1);

    link.connect().await.expect("already connected");
    assert_eq!(device.connect_count(), 1);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn connect_gives_up_after_bounded_retries() {
    let device = MockDevice::new();
    device.fail_next_connects(10);
    let link = link_with(&device, test_config());
    let mut rx = link.subscribe_transitions();

    let err = link.connect().await.expect_err("unavailable");
    match err {
        LinkError::Unavailable { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(device.connect_count(), 3);
    assert_eq!(link.state(), Disconnected);
    assert_eq!(drain(&mut rx), vec![(Disconnected, Connecting), (Connecting, Disconnected)]);
}

#[tokio::test]
async fn connect_recovers_within_retry_budget() {
    let device = MockDevice::new();
    device.fail_next_connects(2);
    let link = link_with(&device, test_config());

    link.connect().await.expect("third attempt succeeds");
    assert_eq!(device.connect_count(), 3);
    assert_eq!(link.state(), Connected);
}

#[tokio::test]
async fn io_requires_connection() {
    let device = MockDevice::new();
    let link = link_with(&device, test_config());
    let mut rx = link.subscribe_transitions();

    assert!(matches!(link.read_registers(0x0100, 4).await, Err(LinkError::NotConnected)));
    assert!(matches!(link.write_register(0x0880, 1).await, Err(LinkError::NotConnected)));
    assert!(device.ops().is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn read_failure_disconnects_once() {
    let device = MockDevice::new();
    let link = Arc::new(link_with(&device, test_config()));
    link.connect().await.expect("connect");
    let mut rx = link.subscribe_transitions();

    device.fail_reads_at(0x0102);
    let first = {
        let link = link.clone();
        tokio::spawn(async move { link.read_registers(0x0100, 4).await })
    };
    let second = {
        let link = link.clone();
        tokio::spawn(async move { link.read_registers(0x0101, 2).await })
    };
    let first = first.await.expect("join");
    let second = second.await.expect("join");

    assert!(first.is_err());
    assert!(second.is_err());
    assert_eq!(link.state(), Disconnected);
    assert_eq!(drain(&mut rx), vec![(Connected, Disconnected)]);

    device.clear_failures();
    assert!(matches!(link.read_registers(0x0100, 1).await, Err(LinkError::NotConnected)));
}

#[tokio::test]
async fn request_timeout_is_a_transport_failure() {
    let device = MockDevice::new();
    let link = link_with(&device, test_config());
    link.connect().await.expect("connect");

    device.set_io_delay(Duration::from_millis(500));
    let err = link.read_registers(0x0100, 1).await.expect_err("timeout");
    assert!(matches!(err, LinkError::Timeout { timeout_ms: 100 }));
    assert_eq!(link.state(), Disconnected);
}

#[tokio::test]
async fn reads_are_split_into_batches() {
    let device = MockDevice::new();
    device.set_registers(0x0470, &[1, 2, 3, 4, 5]);
    let mut config = test_config();
    config.max_batch_size = Some(2);
    let link = link_with(&device, config);
    link.connect().await.expect("connect");

    let sample = link.read_registers(0x0470, 5).await.expect("read");
    assert_eq!(sample.address, 0x0470);
    assert_eq!(sample.words, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        device.ops(),
        vec![
            MockOp::Read { address: 0x0470, count: 2 },
            MockOp::Read { address: 0x0472, count: 2 },
            MockOp::Read { address: 0x0474, count: 1 },
        ]
    );
}

#[tokio::test]
async fn batched_write_reaches_device() {
    let device = MockDevice::new();
    let link = link_with(&device, test_config());
    link.connect().await.expect("connect");

    link.write_registers(0x0881, &[30_000, 0]).await.expect("write");
    assert_eq!(device.register(0x0881), 30_000);
    assert_eq!(device.writes(), vec![(0x0881, 30_000), (0x0882, 0)]);
    assert!(matches!(
        link.write_registers(0xFFFF, &[1, 2]).await,
        Err(LinkError::AddressOverflow)
    ));
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let device = MockDevice::new();
    let link = link_with(&device, test_config());
    link.connect().await.expect("connect");
    let mut rx = link.subscribe_transitions();

    link.disconnect().await;
    link.disconnect().await;

    assert_eq!(link.state(), Disconnected);
    assert_eq!(drain(&mut rx), vec![(Connected, Disconnected)]);
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    let device = MockDevice::new();
    device.fail_next_connects(100);
    let mut config = test_config();
    config.connect_retries = 10;
    config.retry_backoff_ms = 200;
    config.retry_max_backoff_ms = 200;
    let link = Arc::new(link_with(&device, config));

    let pending = {
        let link = link.clone();
        tokio::spawn(async move { link.connect().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    link.disconnect().await;

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("connect returns promptly")
        .expect("join");
    assert!(matches!(result, Err(LinkError::Cancelled)));
    assert_eq!(link.state(), Disconnected);
    assert_eq!(device.connect_count(), 1);
}

#[tokio::test]
async fn session_holds_the_connection_exclusively() {
    let device = MockDevice::new();
    let link = link_with(&device, test_config());
    link.connect().await.expect("connect");

    let mut session = link.session().await;
    session.write_register(0x0880, 1).await.expect("write");

    let blocked = tokio::time::timeout(Duration::from_millis(30), link.read_registers(0x0100, 1)).await;
    assert!(blocked.is_err(), "read must wait for the session");

    session.write_register(0x0885, 2).await.expect("write");
    drop(session);

    link.read_registers(0x0100, 1).await.expect("read after session");
    assert_eq!(
        device.ops(),
        vec![
            MockOp::Write { address: 0x0880, values: vec![1] },
            MockOp::Write { address: 0x0885, values: vec![2] },
            MockOp::Read { address: 0x0100, count: 1 },
        ]
    );
}
