//! RFCOMM Socket Module
//!
//! Platform side of connection setup. Creating a socket and connecting it
//! are separate steps so the two failures can be told apart.

use crate::domain::models::Peer;
use crate::domain::settings::{Settings, TransportKind};
use crate::infrastructure::bluetooth::transport::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpSocket;
use tracing::{debug, info};

/// A socket created for one peer but not yet connected.
#[async_trait]
pub trait RfcommSocket: Send {
    /// Performs the handshake and yields the connected transport.
    async fn connect(&mut self) -> Result<Transport, TransportError>;

    /// Releases a socket whose connect failed.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Creates sockets for peers.
pub trait SocketFactory: Send + Sync {
    fn create_socket(&self, peer: &Peer) -> Result<Box<dyn RfcommSocket>, TransportError>;
}

/// Picks the factory named by the settings.
pub fn factory_for(settings: &Settings) -> Arc<dyn SocketFactory> {
    match settings.transport {
        TransportKind::Tcp => Arc::new(TcpSocketFactory),
        TransportKind::Serial => Arc::new(SerialDeviceFactory::new(settings.serial_devices.clone())),
    }
}

/// Reaches peers whose address is a `host:port` socket address, such as an
/// RFCOMM-to-TCP bridge or a robot simulator.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpSocketFactory;

impl SocketFactory for TcpSocketFactory {
    fn create_socket(&self, peer: &Peer) -> Result<Box<dyn RfcommSocket>, TransportError> {
        let target: SocketAddr =
            peer.address
                .parse()
                .map_err(|e: std::net::AddrParseError| TransportError::InvalidAddress {
                    address: peer.address.clone(),
                    reason: e.to_string(),
                })?;

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        debug!(%target, "Created TCP socket");

        Ok(Box::new(TcpRfcommSocket {
            address: peer.address.clone(),
            target,
            socket: Some(socket),
        }))
    }
}

struct TcpRfcommSocket {
    address: String,
    target: SocketAddr,
    socket: Option<TcpSocket>,
}

#[async_trait]
impl RfcommSocket for TcpRfcommSocket {
    async fn connect(&mut self) -> Result<Transport, TransportError> {
        let socket = self.socket.take().ok_or(TransportError::Closed)?;
        let stream = socket.connect(self.target).await?;
        stream.set_nodelay(true)?;
        info!(address = %self.address, "TCP link connected");
        Ok(Transport::open_streams(self.address.clone(), stream))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the socket releases the descriptor.
        self.socket.take();
        Ok(())
    }
}

/// Reaches peers through RFCOMM character devices bound ahead of time
/// (for example with `rfcomm bind 0 <address>`).
#[derive(Debug, Default, Clone)]
pub struct SerialDeviceFactory {
    devices: BTreeMap<String, PathBuf>,
}

impl SerialDeviceFactory {
    pub fn new(devices: BTreeMap<String, PathBuf>) -> Self {
        Self { devices }
    }
}

impl SocketFactory for SerialDeviceFactory {
    fn create_socket(&self, peer: &Peer) -> Result<Box<dyn RfcommSocket>, TransportError> {
        let path = self
            .devices
            .get(&peer.address)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(peer.address.clone()))?;

        Ok(Box::new(SerialRfcommSocket {
            address: peer.address.clone(),
            path,
        }))
    }
}

struct SerialRfcommSocket {
    address: String,
    path: PathBuf,
}

#[async_trait]
impl RfcommSocket for SerialRfcommSocket {
    async fn connect(&mut self) -> Result<Transport, TransportError> {
        let device = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        info!(address = %self.address, device = %self.path.display(), "Serial link opened");
        Ok(Transport::open_streams(self.address.clone(), device))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
