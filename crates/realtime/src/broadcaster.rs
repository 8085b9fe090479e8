use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use device_link::DeviceLink;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};
use types::{ConnectionChanged, ConnectionState, EventLog, EventRecord};

use crate::{RealtimeChannel, RealtimeEvent};

const CHANGE_CAPACITY: usize = 64;

/// Turns device link transitions into connection events and realtime frames.
pub struct ConnectionStateBroadcaster {
    link: Arc<DeviceLink>,
    channel: RealtimeChannel,
    events: Arc<dyn EventLog>,
    transitions: Mutex<broadcast::Receiver<ConnectionChanged>>,
    changes: broadcast::Sender<ConnectionChanged>,
    last: StdMutex<ConnectionState>,
}

impl ConnectionStateBroadcaster {
    /// Subscribes to the link immediately, so transitions made before [`run`] starts
    /// are still observed.
    ///
    /// [`run`]: ConnectionStateBroadcaster::run
    pub fn new(link: Arc<DeviceLink>, channel: RealtimeChannel, events: Arc<dyn EventLog>) -> Self {
        let transitions = link.subscribe_transitions();
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let initial = link.state();
        channel.publish(RealtimeEvent::connection_status(initial));
        Self {
            link,
            channel,
            events,
            transitions: Mutex::new(transitions),
            changes,
            last: StdMutex::new(initial),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionChanged> {
        self.changes.subscribe()
    }

    pub fn last_state(&self) -> ConnectionState {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `state` as the current one. Returns the change if it differs from the
    /// last observed state; repeated states are swallowed.
    pub async fn apply(&self, state: ConnectionState) -> Option<ConnectionChanged> {
        let change = {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if *last == state {
                return None;
            }
            let change = ConnectionChanged::new(*last, state);
            *last = state;
            let _ = self.changes.send(change);
            change
        };

        let device = self.link.identity();
        self.channel
            .publish(RealtimeEvent::connection_status(change.to));

        if change.to.is_connected() {
            info!(device = %device, from = %change.from, "device connection restored");
            self.channel.publish(RealtimeEvent::modbus_connected(&device));
            self.events
                .record(
                    EventRecord::info("connection_restored", format!("connected to {device}"))
                        .with_payload(json!({ "device": device.to_string(), "from": change.from })),
                )
                .await;
        } else if change.from.is_connected() {
            warn!(device = %device, to = %change.to, "device connection lost");
            self.channel
                .publish(RealtimeEvent::modbus_disconnected(&device));
            self.events
                .record(
                    EventRecord::warning("connection_lost", format!("lost connection to {device}"))
                        .with_payload(json!({ "device": device.to_string(), "to": change.to })),
                )
                .await;
        }

        Some(change)
    }

    /// Follow link transitions until shutdown is signalled or the link goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut transitions = self.transitions.lock().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                received = transitions.recv() => match received {
                    Ok(change) => {
                        self.apply(change.to).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection transitions lagged, resyncing from link state");
                        self.apply(self.link.state()).await;
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("connection broadcaster stopped");
    }
}
