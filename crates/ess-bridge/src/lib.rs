pub mod config;
pub mod server;

pub use config::{BridgeConfig, RealtimeConfig};
