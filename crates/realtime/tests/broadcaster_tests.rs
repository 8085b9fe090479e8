use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use device_link::mock::MockDevice;
use device_link::{DeviceLink, LinkConfig};
use realtime::{
    ChannelError, ConnectionStateBroadcaster, RealtimeChannel, RealtimeEvent, SubscriberOptions,
    SubscriberSink,
};
use tokio::sync::{broadcast, watch};
use types::ConnectionState::{self, Connected, Connecting, Disconnected};
use types::{ConnectionChanged, MemoryEventLog};

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<RealtimeEvent>>,
}

impl RecordingSink {
    fn kinds(&self) -> Vec<&'static str> {
        self.frames.lock().unwrap().iter().map(|f| f.kind()).collect()
    }
}

#[async_trait]
impl SubscriberSink for RecordingSink {
    async fn send(&self, event: &RealtimeEvent) -> Result<(), ChannelError> {
        self.frames.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn test_link(device: &MockDevice) -> Arc<DeviceLink> {
    let config = LinkConfig {
        host: "127.0.0.1".to_string(),
        timeout_ms: 100,
        connect_retries: 0,
        retry_backoff_ms: 1,
        retry_max_backoff_ms: 1,
        ..LinkConfig::default()
    };
    Arc::new(DeviceLink::new(config, device.connector()))
}

async fn next_change(rx: &mut broadcast::Receiver<ConnectionChanged>) -> (ConnectionState, ConnectionState) {
    let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("change in time")
        .expect("change received");
    (change.from, change.to)
}

#[tokio::test]
async fn link_transitions_become_events_and_frames() {
    let device = MockDevice::new();
    let link = test_link(&device);
    let channel = RealtimeChannel::new();
    let events = Arc::new(MemoryEventLog::new());
    let broadcaster = Arc::new(ConnectionStateBroadcaster::new(
        Arc::clone(&link),
        channel.clone(),
        events.clone(),
    ));
    let mut changes = broadcaster.subscribe();

    let sink = Arc::new(RecordingSink::default());
    channel
        .subscribe(sink.clone(), SubscriberOptions::default())
        .expect("subscribe");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = {
        let broadcaster = Arc::clone(&broadcaster);
        tokio::spawn(async move { broadcaster.run(shutdown_rx).await })
    };

    link.connect().await.expect("connect");
    assert_eq!(next_change(&mut changes).await, (Disconnected, Connecting));
    assert_eq!(next_change(&mut changes).await, (Connecting, Connected));

    link.disconnect().await;
    assert_eq!(next_change(&mut changes).await, (Connected, Disconnected));

    shutdown_tx.send(true).expect("signal shutdown");
    task.await.expect("broadcaster task");

    assert!(changes.try_recv().is_err());
    assert_eq!(broadcaster.last_state(), Disconnected);
    assert_eq!(
        events.event_types(),
        vec!["connection_restored".to_string(), "connection_lost".to_string()]
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        sink.kinds(),
        vec![
            "connection_status",
            "connection_status",
            "connection_status",
            "modbus_connected",
            "connection_status",
            "modbus_disconnected",
        ]
    );
}

#[tokio::test]
async fn repeated_states_are_deduplicated() {
    let device = MockDevice::new();
    let link = test_link(&device);
    let events = Arc::new(MemoryEventLog::new());
    let broadcaster =
        ConnectionStateBroadcaster::new(link, RealtimeChannel::new(), events.clone());
    let mut changes = broadcaster.subscribe();

    assert!(broadcaster.apply(Disconnected).await.is_none());
    assert!(broadcaster.apply(Connected).await.is_some());
    assert!(broadcaster.apply(Connected).await.is_none());
    assert!(broadcaster.apply(Disconnected).await.is_some());
    assert!(broadcaster.apply(Disconnected).await.is_none());

    assert_eq!(next_change(&mut changes).await, (Disconnected, Connected));
    assert_eq!(next_change(&mut changes).await, (Connected, Disconnected));
    assert!(changes.try_recv().is_err());
    assert_eq!(events.events().len(), 2);
}

#[tokio::test]
async fn failed_connect_never_reports_connected() {
    let device = MockDevice::new();
    device.fail_next_connects(5);
    let link = test_link(&device);
    let channel = RealtimeChannel::new();
    let broadcaster = Arc::new(ConnectionStateBroadcaster::new(
        Arc::clone(&link),
        channel.clone(),
        Arc::new(MemoryEventLog::new()),
    ));
    let mut changes = broadcaster.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = {
        let broadcaster = Arc::clone(&broadcaster);
        tokio::spawn(async move { broadcaster.run(shutdown_rx).await })
    };

    link.connect().await.expect_err("connect fails");

    assert_eq!(next_change(&mut changes).await, (Disconnected, Connecting));
    assert_eq!(next_change(&mut changes).await, (Connecting, Disconnected));
    assert_eq!(channel.connection_state(), Disconnected);

    shutdown_tx.send(true).expect("signal shutdown");
    task.await.expect("broadcaster task");
}
