//! Bluetooth Link Module
//!
//! Serial (RFCOMM-style) link to the robot: peer bookkeeping, the single
//! connect attempt, and the control session that drives the motors.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐  publish   ┌───────────────┐  take   ┌────────────────┐
//! │    ConnectionManager     │──────────▶│ TransportSlot │────────▶│ ControlSession │
//! │ - peers / selection      │            └───────────────┘         │ - reader loop  │
//! │ - ConnectionGate         │                                      │ - send_command │
//! └────────────┬─────────────┘                                      └───────┬────────┘
//!              │ create_socket / connect                                    │ encode
//!              ▼                                                            ▼
//!      ┌───────────────┐                                            ┌──────────────┐
//!      │ SocketFactory │                                            │   Protocol   │
//!      └───────────────┘                                            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Drive commands and their wire text
//! - [`transport`] - Line-oriented transport and the shared slot
//! - [`socket`] - Socket creation and connect for TCP and serial devices
//! - [`gate`] - Connect gate and connection state
//! - [`connection`] - Peer set, selection and connect attempts
//! - [`session`] - Reader loop and command dispatch

pub mod connection;
pub mod gate;
pub mod protocol;
pub mod session;
pub mod socket;
pub mod transport;

pub use connection::{ConnectOutcome, ConnectRejected, ConnectionManager};
pub use session::{CommunicationFlag, ControlSession, SessionError};
pub use transport::{Transport, TransportError, TransportSlot};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::socket::{RfcommSocket, SocketFactory};
    use super::transport::{Transport, TransportError};
    use crate::domain::models::{AppEvent, LinkEvent, Peer};
    use async_trait::async_trait;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Copy)]
    pub enum Script {
        Succeed,
        FailCreate,
        FailConnect { close_fails: bool },
        Hang,
    }

    /// Socket factory with scripted outcomes. Successful connects hand out
    /// in-memory pipes; the robot ends are kept for the test to drive.
    #[derive(Clone)]
    pub struct ScriptedFactory {
        script: Script,
        created: Arc<Mutex<usize>>,
        remotes: Arc<Mutex<Vec<DuplexStream>>>,
    }

    impl ScriptedFactory {
        pub fn new(script: Script) -> Self {
            Self {
                script,
                created: Arc::new(Mutex::new(0)),
                remotes: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn created(&self) -> usize {
            *self.created.lock().unwrap()
        }

        pub fn take_remote(&self) -> Option<DuplexStream> {
            self.remotes.lock().unwrap().pop()
        }
    }

    impl SocketFactory for ScriptedFactory {
        fn create_socket(&self, peer: &Peer) -> Result<Box<dyn RfcommSocket>, TransportError> {
            if let Script::FailCreate = self.script {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "no rfcomm channel",
                )));
            }
            *self.created.lock().unwrap() += 1;
            Ok(Box::new(ScriptedSocket {
                address: peer.address.clone(),
                script: self.script,
                remotes: self.remotes.clone(),
            }))
        }
    }

    struct ScriptedSocket {
        address: String,
        script: Script,
        remotes: Arc<Mutex<Vec<DuplexStream>>>,
    }

    #[async_trait]
    impl RfcommSocket for ScriptedSocket {
        async fn connect(&mut self) -> Result<Transport, TransportError> {
            match self.script {
                Script::Hang => std::future::pending().await,
                Script::FailConnect { .. } | Script::FailCreate => Err(TransportError::Io(
                    io::Error::new(io::ErrorKind::ConnectionRefused, "host is down"),
                )),
                Script::Succeed => {
                    let (local, remote) = tokio::io::duplex(4096);
                    self.remotes.lock().unwrap().push(remote);
                    Ok(Transport::open_streams(self.address.clone(), local))
                }
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            match self.script {
                Script::FailConnect { close_fails: true } => Err(TransportError::Io(
                    io::Error::new(io::ErrorKind::Other, "close failed"),
                )),
                _ => Ok(()),
            }
        }
    }

    pub fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn link_events(events: &[AppEvent]) -> Vec<LinkEvent> {
        events
            .iter()
            .filter_map(|event| match event {
                AppEvent::Link(link) => Some(link.clone()),
                _ => None,
            })
            .collect()
    }
}
