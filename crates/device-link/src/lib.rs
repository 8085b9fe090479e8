use std::cmp::min;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use types::{ConnectionChanged, ConnectionState, DeviceIdentity, RegisterSample};

#[cfg(feature = "test-utils")]
pub mod mock;
mod transport;

pub use transport::{Connector, TcpConnector, Transport};

const TRANSITION_CAPACITY: usize = 64;

/// Connection and timing options for the inverter link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// Per-request timeout in milliseconds, applied to connects, reads and writes alike.
    pub timeout_ms: u64,
    /// Connect retries after the initial attempt.
    pub connect_retries: usize,
    /// Base delay between connect attempts in milliseconds.
    pub retry_backoff_ms: u64,
    /// Upper bound for the retry delay. Equal to the base for a fixed delay.
    pub retry_max_backoff_ms: u64,
    /// Maximum number of registers per read request; larger reads are split.
    pub max_batch_size: Option<u16>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 502,
            unit_id: 85,
            timeout_ms: 5_000,
            connect_retries: 5,
            retry_backoff_ms: 5_000,
            retry_max_backoff_ms: 5_000,
            max_batch_size: None,
        }
    }
}

impl LinkConfig {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            host: self.host.clone(),
            port: self.port,
            unit_id: self.unit_id,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn retry_delay(&self, attempt: usize) -> Duration {
        let base = self.retry_backoff_ms.max(1);
        let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay = base.saturating_mul(factor);
        let max = self.retry_max_backoff_ms.max(base);
        Duration::from_millis(min(delay, max))
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid socket address {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("device link is not connected")]
    NotConnected,
    #[error("modbus transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("device unavailable after {attempts} connect attempts: {last_error}")]
    Unavailable { attempts: usize, last_error: String },
    #[error("connect cancelled by disconnect")]
    Cancelled,
    #[error("register address overflow")]
    AddressOverflow,
}

impl LinkError {
    /// True when the device cannot currently be reached, as opposed to a local fault.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::Io(_)
                | Self::Timeout { .. }
                | Self::Unavailable { .. }
                | Self::Cancelled
        )
    }
}

enum Request<'a> {
    Read { address: u16, count: u16 },
    WriteSingle { address: u16, value: u16 },
    WriteMultiple { address: u16, values: &'a [u16] },
}

/// Sole owner of the device connection.
///
/// All register I/O goes through one session lock, so a collection pass and a dispatch
/// sequence hold the connection exclusively for their whole duration and never interleave.
pub struct DeviceLink {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    session: Mutex<Option<Box<dyn Transport>>>,
    state: StdMutex<ConnectionState>,
    transitions: broadcast::Sender<ConnectionChanged>,
    connect_gate: Mutex<()>,
    epoch: watch::Sender<u64>,
}

impl DeviceLink {
    pub fn new(config: LinkConfig, connector: Arc<dyn Connector>) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (epoch, _) = watch::channel(0);
        Self {
            config,
            connector,
            session: Mutex::new(None),
            state: StdMutex::new(ConnectionState::Disconnected),
            transitions,
            connect_gate: Mutex::new(()),
            epoch,
        }
    }

    pub fn tcp(config: LinkConfig) -> Self {
        Self::new(config, Arc::new(TcpConnector))
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.config.identity()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every state change is sent exactly once, in order.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionChanged> {
        self.transitions.subscribe()
    }

    fn transition(&self, to: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == to {
            return false;
        }
        let change = ConnectionChanged::new(*state, to);
        *state = to;
        // Sent under the state lock so receivers observe transitions in order.
        let _ = self.transitions.send(change);
        debug!(from = %change.from, to = %change.to, "device link state changed");
        true
    }

    /// Open the session, retrying with backoff up to `connect_retries` times.
    ///
    /// The link stays `Connecting` for the whole retry loop. A concurrent [`disconnect`]
    /// aborts the loop with [`LinkError::Cancelled`].
    ///
    /// [`disconnect`]: DeviceLink::disconnect
    pub async fn connect(&self) -> Result<(), LinkError> {
        let _gate = self.connect_gate.lock().await;
        if self.state().is_connected() {
            return Ok(());
        }

        let mut epoch = self.epoch.subscribe();
        let started_epoch = *epoch.borrow_and_update();
        let identity = self.identity();
        let attempts = self.config.connect_retries.saturating_add(1);
        let mut last_error = String::new();

        self.transition(ConnectionState::Connecting);

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry_delay(attempt - 1);
                info!(
                    device = %identity,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect attempt scheduled"
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = epoch.changed() => {}
                }
            }

            if *epoch.borrow() != started_epoch {
                return Err(self.connect_cancelled(&identity));
            }

            let outcome = tokio::select! {
                outcome = timeout(self.config.timeout(), self.connector.connect(&self.config)) => outcome,
                _ = epoch.changed() => return Err(self.connect_cancelled(&identity)),
            };

            match outcome {
                Ok(Ok(transport)) => {
                    let mut session = self.session.lock().await;
                    if *self.epoch.borrow() != started_epoch {
                        drop(session);
                        close_quietly(transport, self.config.timeout()).await;
                        return Err(self.connect_cancelled(&identity));
                    }
                    *session = Some(transport);
                    self.transition(ConnectionState::Connected);
                    info!(device = %identity, attempt, "connected to device");
                    return Ok(());
                }
                Ok(Err(err)) => {
                    warn!(device = %identity, attempt, error = %err, "device connect failed");
                    last_error = err.to_string();
                }
                Err(_) => {
                    warn!(device = %identity, attempt, timeout_ms = self.config.timeout_ms, "device connect timed out");
                    last_error = LinkError::Timeout {
                        timeout_ms: self.config.timeout_ms,
                    }
                    .to_string();
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
        Err(LinkError::Unavailable {
            attempts,
            last_error,
        })
    }

    fn connect_cancelled(&self, identity: &DeviceIdentity) -> LinkError {
        info!(device = %identity, "connect cancelled");
        self.transition(ConnectionState::Disconnected);
        LinkError::Cancelled
    }

    /// Release the session. Idempotent; also cancels a pending reconnect loop.
    ///
    /// Waits for an in-flight session (such as a dispatch sequence) to finish first.
    pub async fn disconnect(&self) {
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        let mut session = self.session.lock().await;
        if let Some(transport) = session.take() {
            close_quietly(transport, self.config.timeout()).await;
            info!(device = %self.identity(), "disconnected from device");
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Take exclusive use of the connection until the returned session is dropped.
    pub async fn session(&self) -> LinkSession<'_> {
        LinkSession {
            link: self,
            transport: self.session.lock().await,
        }
    }

    pub async fn read_registers(&self, address: u16, count: u16) -> Result<RegisterSample, LinkError> {
        self.session().await.read_registers(address, count).await
    }

    pub async fn write_register(&self, address: u16, value: u16) -> Result<(), LinkError> {
        self.session().await.write_register(address, value).await
    }

    pub async fn write_registers(&self, address: u16, values: &[u16]) -> Result<(), LinkError> {
        self.session().await.write_registers(address, values).await
    }
}

async fn close_quietly(mut transport: Box<dyn Transport>, limit: Duration) {
    match timeout(limit, transport.disconnect()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "transport close failed"),
        Err(_) => debug!("transport close timed out"),
    }
}

/// Exclusive handle on the device connection.
pub struct LinkSession<'a> {
    link: &'a DeviceLink,
    transport: MutexGuard<'a, Option<Box<dyn Transport>>>,
}

impl LinkSession<'_> {
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub async fn read_registers(&mut self, address: u16, count: u16) -> Result<RegisterSample, LinkError> {
        let mut sample = RegisterSample::new(address, Vec::with_capacity(usize::from(count)));
        if count == 0 {
            return Ok(sample);
        }

        let batch_size = self.link.config.max_batch_size.unwrap_or(count).max(1);
        let mut remaining = count;
        let mut offset = 0u16;

        while remaining > 0 {
            let chunk = min(remaining, batch_size);
            let chunk_start = u16::try_from(u32::from(address) + u32::from(offset))
                .map_err(|_| LinkError::AddressOverflow)?;
            let words = self
                .execute(Request::Read {
                    address: chunk_start,
                    count: chunk,
                })
                .await?;
            sample.words.extend(words);
            remaining -= chunk;
            offset += chunk;
        }

        debug!(address, count, "register read ok");
        Ok(sample)
    }

    pub async fn write_register(&mut self, address: u16, value: u16) -> Result<(), LinkError> {
        self.execute(Request::WriteSingle { address, value }).await?;
        debug!(address, value, "register write ok");
        Ok(())
    }

    pub async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), LinkError> {
        if values.is_empty() {
            return Ok(());
        }
        u16::try_from(u32::from(address) + values.len() as u32 - 1)
            .map_err(|_| LinkError::AddressOverflow)?;
        self.execute(Request::WriteMultiple { address, values }).await?;
        debug!(address, count = values.len(), "register batch write ok");
        Ok(())
    }

    async fn execute(&mut self, request: Request<'_>) -> Result<Vec<u16>, LinkError> {
        let timeout_ms = self.link.config.timeout_ms;
        let transport = self.transport.as_mut().ok_or(LinkError::NotConnected)?;
        let (operation, address) = match request {
            Request::Read { address, .. } => ("read", address),
            Request::WriteSingle { address, .. } => ("write", address),
            Request::WriteMultiple { address, .. } => ("write_multiple", address),
        };

        let call = async {
            match request {
                Request::Read { address, count } => {
                    transport.read_holding_registers(address, count).await
                }
                Request::WriteSingle { address, value } => transport
                    .write_single_register(address, value)
                    .await
                    .map(|()| Vec::new()),
                Request::WriteMultiple { address, values } => transport
                    .write_multiple_registers(address, values)
                    .await
                    .map(|()| Vec::new()),
            }
        };

        match timeout(Duration::from_millis(timeout_ms), call).await {
            Ok(Ok(words)) => Ok(words),
            Ok(Err(err)) => {
                warn!(operation, address, error = %err, "modbus request failed");
                self.fail().await;
                Err(LinkError::Io(err))
            }
            Err(_) => {
                warn!(operation, address, timeout_ms, "modbus request timed out");
                self.fail().await;
                Err(LinkError::Timeout { timeout_ms })
            }
        }
    }

    /// Drop the broken session and move the link to `Disconnected`.
    async fn fail(&mut self) {
        if let Some(transport) = self.transport.take() {
            close_quietly(transport, self.link.config.timeout()).await;
        }
        self.link.transition(ConnectionState::Disconnected);
    }
}
