use thiserror::Error;

mod broadcaster;
mod channel;
mod event;

pub use broadcaster::ConnectionStateBroadcaster;
pub use channel::{RealtimeChannel, SubscriberId, SubscriberOptions, SubscriberSink};
pub use event::RealtimeEvent;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("realtime channel is shut down")]
    Closed,
    #[error("subscriber transport failed: {0}")]
    Transport(String),
    #[error("subscriber send timed out after {timeout_ms}ms")]
    SendTimeout { timeout_ms: u64 },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}
