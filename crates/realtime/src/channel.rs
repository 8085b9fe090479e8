use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use types::{ConnectionState, TelemetrySnapshot};

use crate::{ChannelError, RealtimeEvent};

/// Outbound transport of one subscriber, such as a websocket connection.
#[async_trait]
pub trait SubscriberSink: Send + Sync {
    async fn send(&self, event: &RealtimeEvent) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

const CADENCE_SLACK_DIVISOR: u32 = 10;

#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// Pending frames kept per subscriber; the oldest is dropped on overflow.
    pub queue_capacity: usize,
    /// Minimum spacing between two `power_update` frames. `None` forwards every update.
    ///
    /// An update arriving up to a tenth of the cadence early still passes, so a producer
    /// ticking at the same period is not throttled by scheduling jitter.
    pub cadence: Option<Duration>,
    /// A send taking longer than this counts as a transport failure.
    pub send_timeout: Duration,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            cadence: None,
            send_timeout: Duration::from_secs(5),
        }
    }
}

struct Outbox {
    pending: VecDeque<RealtimeEvent>,
    last_power_update: Option<Instant>,
}

struct Subscriber {
    id: SubscriberId,
    options: SubscriberOptions,
    outbox: Mutex<Outbox>,
    wake: Notify,
    live: AtomicBool,
}

enum Enqueued {
    Queued,
    Throttled,
    DroppedOldest,
}

impl Subscriber {
    fn enqueue(&self, event: RealtimeEvent) -> Enqueued {
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        if event.is_power_update() {
            if let Some(cadence) = self.options.cadence {
                let now = Instant::now();
                if let Some(last) = outbox.last_power_update {
                    if now.duration_since(last) + cadence / CADENCE_SLACK_DIVISOR < cadence {
                        return Enqueued::Throttled;
                    }
                }
                outbox.last_power_update = Some(now);
            }
        }

        outbox.pending.push_back(event);
        let outcome = if outbox.pending.len() > self.options.queue_capacity.max(1) {
            outbox.pending.pop_front();
            Enqueued::DroppedOldest
        } else {
            Enqueued::Queued
        };
        drop(outbox);
        self.wake.notify_one();
        outcome
    }

    fn next(&self) -> Option<RealtimeEvent> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .pop_front()
    }

    fn close(&self) {
        self.live.store(false, Ordering::Release);
        self.wake.notify_one();
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

struct Shared {
    subscribers: Mutex<HashMap<SubscriberId, Arc<Subscriber>>>,
    next_id: AtomicU64,
    state: Mutex<ConnectionState>,
    latest: Mutex<Option<TelemetrySnapshot>>,
    closed: AtomicBool,
}

impl Shared {
    fn remove(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = subscribers.remove(&id);
        gauge!("ess_realtime_subscribers").set(subscribers.len() as f64);
        removed
    }

    fn live_subscribers(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Fan-out of realtime frames to any number of subscribers.
///
/// Each subscriber has its own bounded outbox drained by a dedicated task, so a slow
/// or failing transport only ever affects itself. Cloning yields another handle to
/// the same channel.
#[derive(Clone)]
pub struct RealtimeChannel {
    shared: Arc<Shared>,
}

impl Default for RealtimeChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeChannel {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                state: Mutex::new(ConnectionState::Disconnected),
                latest: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a subscriber and start its delivery task.
    ///
    /// The subscriber is greeted with the current connection status and, while the
    /// device is connected, the most recent snapshot.
    pub fn subscribe(
        &self,
        sink: Arc<dyn SubscriberSink>,
        options: SubscriberOptions,
    ) -> Result<SubscriberId, ChannelError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let id = SubscriberId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber {
            id,
            options,
            outbox: Mutex::new(Outbox {
                pending: VecDeque::new(),
                last_power_update: None,
            }),
            wake: Notify::new(),
            live: AtomicBool::new(true),
        });

        let state = self.connection_state();
        subscriber.enqueue(RealtimeEvent::connection_status(state));
        if state.is_connected() {
            if let Some(snapshot) = self.latest_snapshot() {
                subscriber.enqueue(RealtimeEvent::power_update(snapshot));
            }
        }

        {
            let mut subscribers = self
                .shared
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.insert(id, Arc::clone(&subscriber));
            gauge!("ess_realtime_subscribers").set(subscribers.len() as f64);
        }

        tokio::spawn(deliver(Arc::downgrade(&self.shared), subscriber, sink));
        info!(subscriber = %id, "realtime subscriber registered");
        Ok(id)
    }

    /// Remove a subscriber. Frames still queued for it are discarded.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        match self.shared.remove(id) {
            Some(subscriber) => {
                subscriber.close();
                info!(subscriber = %id, "realtime subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Queue `event` for every live subscriber and return how many accepted it.
    ///
    /// Never waits on a subscriber. Connection-status frames also update the cached
    /// state; leaving `Connected` clears the cached snapshot.
    pub fn publish(&self, event: RealtimeEvent) -> usize {
        if self.shared.closed.load(Ordering::Acquire) {
            return 0;
        }

        match &event {
            RealtimeEvent::ConnectionStatus { state, .. } => {
                *self
                    .shared
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = *state;
                if !state.is_connected() {
                    self.shared
                        .latest
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                }
            }
            RealtimeEvent::PowerUpdate { data, .. } => {
                *self
                    .shared
                    .latest
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(data.as_ref().clone());
            }
            _ => {}
        }

        let mut accepted = 0;
        for subscriber in self.shared.live_subscribers() {
            match subscriber.enqueue(event.clone()) {
                Enqueued::Queued => accepted += 1,
                Enqueued::DroppedOldest => {
                    accepted += 1;
                    counter!("ess_realtime_dropped_total").increment(1);
                    debug!(subscriber = %subscriber.id, "subscriber outbox full, dropped oldest frame");
                }
                Enqueued::Throttled => {}
            }
        }
        accepted
    }

    /// Publish a telemetry snapshot as a `power_update` frame.
    ///
    /// `link_state` is the device link's state as seen by the producer of the snapshot;
    /// the channel's own cached state may still lag behind the broadcaster. Skipped
    /// unless connected so subscribers never see stale data.
    pub fn publish_snapshot(
        &self,
        snapshot: &TelemetrySnapshot,
        link_state: ConnectionState,
    ) -> usize {
        if !link_state.is_connected() {
            debug!("skipping power update while device is not connected");
            return 0;
        }
        self.publish(RealtimeEvent::power_update(snapshot.clone()))
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn latest_snapshot(&self) -> Option<TelemetrySnapshot> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop accepting subscribers and close every delivery task.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = {
            let mut subscribers = self
                .shared
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.drain().map(|(_, subscriber)| subscriber).collect()
        };
        for subscriber in &drained {
            subscriber.close();
        }
        gauge!("ess_realtime_subscribers").set(0.0);
        info!(closed = drained.len(), "realtime channel shut down");
    }
}

async fn deliver(shared: Weak<Shared>, subscriber: Arc<Subscriber>, sink: Arc<dyn SubscriberSink>) {
    let send_timeout = subscriber.options.send_timeout;

    while subscriber.is_live() {
        let Some(event) = subscriber.next() else {
            subscriber.wake.notified().await;
            continue;
        };

        let failure = match timeout(send_timeout, sink.send(&event)).await {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(_) => ChannelError::SendTimeout {
                timeout_ms: send_timeout.as_millis() as u64,
            },
        };

        warn!(
            subscriber = %subscriber.id,
            frame = event.kind(),
            error = %failure,
            "realtime delivery failed, dropping subscriber"
        );
        subscriber.close();
        if let Some(shared) = shared.upgrade() {
            shared.remove(subscriber.id);
        }
        return;
    }

    debug!(subscriber = %subscriber.id, "delivery task finished");
}
