//! In-memory device for tests: a register map plus a log of every request it served.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::{Connector, LinkConfig, LinkError, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Read { address: u16, count: u16 },
    Write { address: u16, values: Vec<u16> },
}

#[derive(Debug, Default)]
struct MockState {
    registers: HashMap<u16, u16>,
    ops: Vec<MockOp>,
    connects: usize,
    failing_connects: usize,
    write_calls: usize,
    fail_write_call: Option<usize>,
    fail_read_address: Option<u16>,
    io_delay: Duration,
}

/// Shared handle; clones observe the same registers and log.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            device: self.clone(),
        })
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.with(|state| {
            state.registers.insert(address, value);
        });
    }

    pub fn set_registers(&self, address: u16, values: &[u16]) {
        self.with(|state| {
            for (offset, value) in values.iter().enumerate() {
                state.registers.insert(address + offset as u16, *value);
            }
        });
    }

    pub fn register(&self, address: u16) -> u16 {
        self.with(|state| state.registers.get(&address).copied().unwrap_or(0))
    }

    pub fn ops(&self) -> Vec<MockOp> {
        self.with(|state| state.ops.clone())
    }

    /// Every register written, flattened to `(address, value)` in request order.
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.with(|state| {
            state
                .ops
                .iter()
                .filter_map(|op| match op {
                    MockOp::Write { address, values } => Some(
                        values
                            .iter()
                            .enumerate()
                            .map(|(offset, value)| (address + offset as u16, *value))
                            .collect::<Vec<_>>(),
                    ),
                    MockOp::Read { .. } => None,
                })
                .flatten()
                .collect()
        })
    }

    pub fn clear_ops(&self) {
        self.with(|state| state.ops.clear());
    }

    pub fn connect_count(&self) -> usize {
        self.with(|state| state.connects)
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.with(|state| state.failing_connects = count);
    }

    /// Fail the `call`-th write request (1-based) counted from now.
    pub fn fail_write_call(&self, call: usize) {
        self.with(|state| {
            state.write_calls = 0;
            state.fail_write_call = Some(call);
        });
    }

    /// Fail any read whose range includes `address`.
    pub fn fail_reads_at(&self, address: u16) {
        self.with(|state| state.fail_read_address = Some(address));
    }

    pub fn clear_failures(&self) {
        self.with(|state| {
            state.failing_connects = 0;
            state.fail_write_call = None;
            state.fail_read_address = None;
        });
    }

    pub fn set_io_delay(&self, delay: Duration) {
        self.with(|state| state.io_delay = delay);
    }

    fn io_delay(&self) -> Duration {
        self.with(|state| state.io_delay)
    }
}

struct MockConnector {
    device: MockDevice,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &LinkConfig) -> Result<Box<dyn Transport>, LinkError> {
        let refused = self.device.with(|state| {
            state.connects += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                true
            } else {
                false
            }
        });
        if refused {
            return Err(LinkError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock connect refused",
            )));
        }
        Ok(Box::new(MockTransport {
            device: self.device.clone(),
        }))
    }
}

struct MockTransport {
    device: MockDevice,
}

impl MockTransport {
    async fn write(&self, address: u16, values: &[u16]) -> io::Result<()> {
        let delay = self.device.io_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.device.with(|state| {
            state.write_calls += 1;
            if state.fail_write_call == Some(state.write_calls) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failed"));
            }
            state.ops.push(MockOp::Write {
                address,
                values: values.to_vec(),
            });
            for (offset, value) in values.iter().enumerate() {
                state.registers.insert(address + offset as u16, *value);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> io::Result<Vec<u16>> {
        let delay = self.device.io_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.device.with(|state| {
            if let Some(failing) = state.fail_read_address {
                if failing >= address && u32::from(failing) < u32::from(address) + u32::from(count) {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read failed"));
                }
            }
            state.ops.push(MockOp::Read { address, count });
            Ok((0..count)
                .map(|offset| state.registers.get(&(address + offset)).copied().unwrap_or(0))
                .collect())
        })
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> io::Result<()> {
        self.write(address, &[value]).await
    }

    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> io::Result<()> {
        self.write(address, values).await
    }

    async fn disconnect(&mut self) -> io::Result<()> {
        Ok(())
    }
}
