use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::{Reader, Slave, Writer};
use tracing::debug;

use crate::{LinkConfig, LinkError};

/// Register-level operations of one open session with the device.
#[async_trait]
pub trait Transport: Send {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> io::Result<Vec<u16>>;

    async fn write_single_register(&mut self, address: u16, value: u16) -> io::Result<()>;

    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> io::Result<()>;

    async fn disconnect(&mut self) -> io::Result<()>;
}

/// Opens transport sessions. Only [`crate::DeviceLink`] calls this.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &LinkConfig) -> Result<Box<dyn Transport>, LinkError>;
}

/// Modbus TCP connector addressing the configured unit id.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &LinkConfig) -> Result<Box<dyn Transport>, LinkError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse::<SocketAddr>()
            .map_err(|_| LinkError::InvalidAddress(config.host.clone(), config.port))?;
        let context = tcp::connect_slave(addr, Slave(config.unit_id)).await?;
        debug!(%addr, unit_id = config.unit_id, "modbus tcp session opened");
        Ok(Box::new(ModbusTransport { context }))
    }
}

struct ModbusTransport {
    context: Context,
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> io::Result<Vec<u16>> {
        self.context.read_holding_registers(address, count).await
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> io::Result<()> {
        self.context.write_single_register(address, value).await
    }

    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> io::Result<()> {
        self.context.write_multiple_registers(address, values).await
    }

    async fn disconnect(&mut self) -> io::Result<()> {
        self.context.disconnect().await
    }
}
