//! Control Session Module
//!
//! Drives the robot over the published transport: a reader task logs
//! whatever the robot sends, and commands are written on the caller's task.

use crate::domain::models::{AppEvent, CommandRecord, LinkEvent, MotorIntent};
use crate::infrastructure::bluetooth::lock;
use crate::infrastructure::bluetooth::protocol::{self, DriveCommand, Encoded, Gesture};
use crate::infrastructure::bluetooth::transport::{Transport, TransportError, TransportSlot};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a control session is already active")]
    AlreadyActive,

    #[error("no connected transport to control")]
    NoTransport,

    #[error("control session has been terminated")]
    Terminated,

    #[error("link disrupted: {0}")]
    Disrupted(#[source] TransportError),
}

/// Whether a control session is running. Shared by everything that may
/// start one.
///
/// The flag remembers the transport of the session holding it and reads as
/// inactive once that transport is closed, whether by `terminate()` or by a
/// connection reset.
#[derive(Clone, Default)]
pub struct CommunicationFlag {
    holder: Arc<Mutex<Option<Arc<Transport>>>>,
}

impl CommunicationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        lock(&self.holder)
            .as_ref()
            .is_some_and(|transport| !transport.is_closed())
    }

    fn try_activate(&self, transport: &Arc<Transport>) -> bool {
        let mut holder = lock(&self.holder);
        if holder.as_ref().is_some_and(|current| !current.is_closed()) {
            return false;
        }
        *holder = Some(transport.clone());
        true
    }

    /// Clears the flag only if `transport`'s session still holds it.
    fn deactivate(&self, transport: &Arc<Transport>) {
        let mut holder = lock(&self.holder);
        if holder
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, transport))
        {
            *holder = None;
        }
    }
}

pub struct ControlSession {
    transport: Arc<Transport>,
    slot: TransportSlot,
    active: CommunicationFlag,
    reader: Option<JoinHandle<()>>,
    terminated: bool,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ControlSession {
    /// Takes over the transport in `slot` and starts the reader task.
    pub fn start(
        slot: &TransportSlot,
        active: &CommunicationFlag,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self, SessionError> {
        if active.is_active() {
            return Err(SessionError::AlreadyActive);
        }

        let transport = match slot.current() {
            Some(transport) if !transport.is_closed() => transport,
            _ => return Err(SessionError::NoTransport),
        };
        if !active.try_activate(&transport) {
            return Err(SessionError::AlreadyActive);
        }

        info!(address = %transport.address(), "Control session started");
        let reader = tokio::spawn(read_loop(transport.clone(), event_sender.clone()));

        Ok(Self {
            transport,
            slot: slot.clone(),
            active: active.clone(),
            reader: Some(reader),
            terminated: false,
            event_sender,
        })
    }

    pub fn address(&self) -> &str {
        self.transport.address()
    }

    /// False once terminated or once the transport was closed under it.
    pub fn is_active(&self) -> bool {
        !self.terminated && !self.transport.is_closed()
    }

    /// Writes one framed command. A failed write is reported as
    /// `LinkDisrupted` and the transport is left open.
    pub async fn send_command(&self, text: &str) -> Result<(), SessionError> {
        if self.terminated {
            return Err(SessionError::Terminated);
        }

        match self.transport.write_line(text).await {
            Ok(()) => {
                info!(target: "user_command", "{}", text);
                self.notify(AppEvent::Traffic(CommandRecord::sent(text)));
                Ok(())
            }
            Err(e) => {
                error!("Failed to send command {:?}: {}", text, e);
                self.notify(AppEvent::Link(LinkEvent::LinkDisrupted {
                    reason: e.to_string(),
                }));
                Err(SessionError::Disrupted(e))
            }
        }
    }

    pub async fn send(&self, command: DriveCommand) -> Result<(), SessionError> {
        self.send_command(&command.to_string()).await
    }

    /// Encodes `gesture` against `intent` and sends it. The returned slider
    /// positions describe what was sent.
    pub async fn drive(&self, gesture: Gesture, intent: MotorIntent) -> Result<Encoded, SessionError> {
        let encoded = protocol::encode(gesture, intent);
        self.send(encoded.command).await?;
        Ok(encoded)
    }

    /// Closes the transport and ends the session. Later calls do nothing.
    pub async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if let Err(e) = self.transport.close().await {
            warn!("Failed to close transport: {}", e);
            self.notify(AppEvent::Link(LinkEvent::CloseFailed {
                reason: e.to_string(),
            }));
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        self.slot.release(&self.transport);
        self.active.deactivate(&self.transport);

        info!(address = %self.transport.address(), "Control session terminated");
    }

    fn notify(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if !self.terminated {
            self.active.deactivate(&self.transport);
        }
    }
}

async fn read_loop(transport: Arc<Transport>, event_sender: mpsc::UnboundedSender<AppEvent>) {
    loop {
        match transport.read_line().await {
            Ok(Some(line)) => {
                info!(target: "robot_message", "{}", line);
                let _ = event_sender.send(AppEvent::Traffic(CommandRecord::received(line)));
            }
            Ok(None) => {
                info!(address = %transport.address(), "Robot closed the link");
                break;
            }
            Err(TransportError::Closed) => {
                debug!(address = %transport.address(), "Reader stopped: transport closed");
                break;
            }
            Err(e) => {
                error!("Failed to read from robot: {}", e);
                let _ = event_sender.send(AppEvent::Link(LinkEvent::LinkDisrupted {
                    reason: e.to_string(),
                }));
                break;
            }
        }
    }
}
