use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use realtime::{ChannelError, RealtimeChannel, RealtimeEvent, SubscriberOptions, SubscriberSink};
use tokio::sync::Semaphore;
use types::{
    BatteryTelemetry, ConnectionState, GridTelemetry, LoadTelemetry, PvTelemetry, TelemetrySnapshot,
};

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<RealtimeEvent>>,
}

impl RecordingSink {
    fn kinds(&self) -> Vec<&'static str> {
        self.frames.lock().unwrap().iter().map(|f| f.kind()).collect()
    }

    fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

#[async_trait]
impl SubscriberSink for RecordingSink {
    async fn send(&self, event: &RealtimeEvent) -> Result<(), ChannelError> {
        self.frames.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct FailingSink {
    attempts: AtomicUsize,
}

#[async_trait]
impl SubscriberSink for FailingSink {
    async fn send(&self, _event: &RealtimeEvent) -> Result<(), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ChannelError::Transport("socket closed".to_string()))
    }
}

/// Blocks every send until a permit is released.
struct GatedSink {
    gate: Semaphore,
    started: AtomicUsize,
    inner: RecordingSink,
}

#[async_trait]
impl SubscriberSink for GatedSink {
    async fn send(&self, event: &RealtimeEvent) -> Result<(), ChannelError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        permit.forget();
        self.inner.send(event).await
    }
}

fn snapshot(soc: f64) -> TelemetrySnapshot {
    TelemetrySnapshot {
        captured_at: Utc::now(),
        battery: BatteryTelemetry {
            soc_percent: soc,
            voltage_v: 52.1,
            current_a: -3.2,
            power_w: -160,
            temperature_c: 24.5,
        },
        grid: GridTelemetry {
            power_w: 350,
            voltage_v: [230.1, 229.8, 231.0],
            current_a: [1.2, 0.9, 1.1],
            frequency_hz: 50.01,
        },
        pv: PvTelemetry {
            power_w: 2400,
            string_power_w: [800, 900, 700],
            energy_today_kwh: 11.25,
        },
        load: LoadTelemetry {
            power_w: 1900,
            inverter_power_w: 2100,
        },
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn new_subscriber_is_greeted_with_status() {
    let channel = RealtimeChannel::new();
    let sink = Arc::new(RecordingSink::default());

    channel
        .subscribe(sink.clone(), SubscriberOptions::default())
        .expect("subscribe");

    wait_until(|| sink.len() == 1).await;
    let frames = sink.frames.lock().unwrap();
    match &frames[0] {
        RealtimeEvent::ConnectionStatus {
            connected, state, ..
        } => {
            assert!(!connected);
            assert_eq!(*state, ConnectionState::Disconnected);
        }
        other => panic!("unexpected greeting {other:?}"),
    };
}

#[tokio::test]
async fn connected_greeting_replays_latest_snapshot() {
    let channel = RealtimeChannel::new();
    channel.publish(RealtimeEvent::connection_status(ConnectionState::Connected));
    channel.publish_snapshot(&snapshot(80.0), ConnectionState::Connected);

    let sink = Arc::new(RecordingSink::default());
    channel
        .subscribe(sink.clone(), SubscriberOptions::default())
        .expect("subscribe");

    wait_until(|| sink.len() == 2).await;
    assert_eq!(sink.kinds(), vec!["connection_status", "power_update"]);
}

#[tokio::test]
async fn disconnect_clears_cached_snapshot() {
    let channel = RealtimeChannel::new();
    channel.publish(RealtimeEvent::connection_status(ConnectionState::Connected));
    channel.publish_snapshot(&snapshot(80.0), ConnectionState::Connected);
    assert!(channel.latest_snapshot().is_some());

    channel.publish(RealtimeEvent::connection_status(ConnectionState::Disconnected));
    assert!(channel.latest_snapshot().is_none());

    let sink = Arc::new(RecordingSink::default());
    channel
        .subscribe(sink.clone(), SubscriberOptions::default())
        .expect("subscribe");
    assert_eq!(channel.publish_snapshot(&snapshot(81.0), ConnectionState::Disconnected), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(sink.kinds(), vec!["connection_status"]);
}

#[tokio::test]
async fn failing_subscriber_is_removed_without_affecting_others() {
    let channel = RealtimeChannel::new();
    channel.publish(RealtimeEvent::connection_status(ConnectionState::Connected));

    let healthy = Arc::new(RecordingSink::default());
    let failing = Arc::new(FailingSink {
        attempts: AtomicUsize::new(0),
    });
    channel
        .subscribe(healthy.clone(), SubscriberOptions::default())
        .expect("subscribe healthy");
    channel
        .subscribe(failing.clone(), SubscriberOptions::default())
        .expect("subscribe failing");

    for soc in [50.0, 51.0, 52.0] {
        channel.publish_snapshot(&snapshot(soc), ConnectionState::Connected);
    }

    wait_until(|| healthy.len() == 4).await;
    wait_until(|| channel.subscriber_count() == 1).await;
    assert_eq!(failing.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        healthy.kinds(),
        vec!["connection_status", "power_update", "power_update", "power_update"]
    );
}

#[tokio::test]
async fn slow_subscriber_drops_oldest_frames() {
    let channel = RealtimeChannel::new();
    channel.publish(RealtimeEvent::connection_status(ConnectionState::Connected));

    let slow = Arc::new(GatedSink {
        gate: Semaphore::new(0),
        started: AtomicUsize::new(0),
        inner: RecordingSink::default(),
    });
    let fast = Arc::new(RecordingSink::default());
    channel
        .subscribe(
            slow.clone(),
            SubscriberOptions {
                queue_capacity: 2,
                ..SubscriberOptions::default()
            },
        )
        .expect("subscribe slow");
    channel
        .subscribe(fast.clone(), SubscriberOptions::default())
        .expect("subscribe fast");

    // The greeting is in flight and blocked; everything after it queues.
    wait_until(|| slow.started.load(Ordering::SeqCst) == 1).await;

    for soc in [10.0, 20.0, 30.0, 40.0] {
        channel.publish_snapshot(&snapshot(soc), ConnectionState::Connected);
    }
    wait_until(|| fast.len() == 5).await;

    slow.gate.add_permits(10);
    wait_until(|| slow.inner.len() == 3).await;

    let socs: Vec<f64> = slow
        .inner
        .frames
        .lock()
        .unwrap()
        .iter()
        .filter_map(|frame| match frame {
            RealtimeEvent::PowerUpdate { data, .. } => Some(data.battery.soc_percent),
            _ => None,
        })
        .collect();
    assert_eq!(socs, vec![30.0, 40.0]);
    assert_eq!(channel.subscriber_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn cadence_throttles_power_updates_only() {
    let channel = RealtimeChannel::new();
    channel.publish(RealtimeEvent::connection_status(ConnectionState::Connected));

    let sink = Arc::new(RecordingSink::default());
    channel
        .subscribe(
            sink.clone(),
            SubscriberOptions {
                cadence: Some(Duration::from_secs(10)),
                ..SubscriberOptions::default()
            },
        )
        .expect("subscribe");

    assert_eq!(channel.publish_snapshot(&snapshot(1.0), ConnectionState::Connected), 1);
    assert_eq!(channel.publish_snapshot(&snapshot(2.0), ConnectionState::Connected), 0);
    assert_eq!(channel.publish(RealtimeEvent::pong()), 1);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(channel.publish_snapshot(&snapshot(3.0), ConnectionState::Connected), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        sink.kinds(),
        vec!["connection_status", "power_update", "pong", "power_update"]
    );
}

#[tokio::test(start_paused = true)]
async fn cadence_tolerates_jitter_of_a_producer_on_the_same_period() {
    let channel = RealtimeChannel::new();
    channel.publish(RealtimeEvent::connection_status(ConnectionState::Connected));

    let sink = Arc::new(RecordingSink::default());
    channel
        .subscribe(
            sink.clone(),
            SubscriberOptions {
                cadence: Some(Duration::from_secs(10)),
                ..SubscriberOptions::default()
            },
        )
        .expect("subscribe");

    let start = tokio::time::Instant::now();
    let mut delivered = 0;
    for (i, jitter_ms) in [30u64, 20, 30, 20, 30, 20].into_iter().enumerate() {
        let at = start + Duration::from_secs(10 * i as u64) + Duration::from_millis(jitter_ms);
        tokio::time::sleep_until(at).await;
        delivered += channel.publish_snapshot(&snapshot(i as f64), ConnectionState::Connected);
    }

    assert_eq!(delivered, 6);
    wait_until(|| sink.len() == 7).await;
}

#[tokio::test]
async fn unsubscribe_and_shutdown() {
    let channel = RealtimeChannel::new();
    let first = channel
        .subscribe(Arc::new(RecordingSink::default()), SubscriberOptions::default())
        .expect("subscribe");
    channel
        .subscribe(Arc::new(RecordingSink::default()), SubscriberOptions::default())
        .expect("subscribe");
    assert_eq!(channel.subscriber_count(), 2);

    assert!(channel.unsubscribe(first));
    assert!(!channel.unsubscribe(first));
    assert_eq!(channel.subscriber_count(), 1);

    channel.shutdown();
    assert_eq!(channel.subscriber_count(), 0);
    assert_eq!(channel.publish(RealtimeEvent::pong()), 0);
    assert!(matches!(
        channel.subscribe(Arc::new(RecordingSink::default()), SubscriberOptions::default()),
        Err(ChannelError::Closed)
    ));
}

#[test]
fn frames_serialize_with_type_tag() {
    let status: serde_json::Value = serde_json::from_str(
        &RealtimeEvent::connection_status(ConnectionState::Connected)
            .to_json()
            .expect("encode"),
    )
    .expect("json");
    assert_eq!(status["type"], "connection_status");
    assert_eq!(status["connected"], true);
    assert_eq!(status["state"], "connected");

    let update: serde_json::Value =
        serde_json::to_value(RealtimeEvent::power_update(snapshot(64.0))).expect("encode");
    assert_eq!(update["type"], "power_update");
    assert_eq!(update["data"]["battery"]["soc_percent"], 64.0);
    assert_eq!(update["data"]["pv"]["string_power_w"][1], 900);
}
