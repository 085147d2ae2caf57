//! Connection Manager
//!
//! Tracks bonded and discovered peers, the user's selection, and the single
//! connect attempt. A successful attempt publishes its transport into the
//! [`TransportSlot`] for the control session to pick up.

use crate::domain::models::{
    AppEvent, ConnectionState, DiscoveryEvent, LinkEvent, Peer, PlatformEvent,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::gate::{AttemptTicket, ConnectionGate};
use crate::infrastructure::bluetooth::lock;
use crate::infrastructure::bluetooth::socket::SocketFactory;
use crate::infrastructure::bluetooth::transport::TransportSlot;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Source of the platform's bonded-peer snapshot.
pub trait BondedPeers: Send + Sync {
    fn bonded_peers(&self) -> Vec<Peer>;
}

impl BondedPeers for Vec<Peer> {
    fn bonded_peers(&self) -> Vec<Peer> {
        self.clone()
    }
}

impl BondedPeers for Settings {
    fn bonded_peers(&self) -> Vec<Peer> {
        Settings::bonded_peers(self)
    }
}

/// Why a connect request was turned away without starting an attempt.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRejected {
    #[error("peer is not the current selection")]
    NotSelected,
    #[error("a connect attempt is already in flight")]
    AttemptInFlight,
    #[error("already connected")]
    AlreadyConnected,
}

/// Terminal outcome of one accepted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Established,
    SocketCreateFailed,
    ConnectFailed,
    /// A reset happened while the attempt was in flight.
    Superseded,
}

/// Bonded and discovered peers, keyed by address.
#[derive(Debug, Default)]
struct PeerBook {
    bonded: BTreeMap<String, Peer>,
    discovered: BTreeMap<String, Peer>,
}

impl PeerBook {
    fn replace_bonded(&mut self, bonded: impl IntoIterator<Item = Peer>) {
        self.bonded.clear();
        for peer in bonded {
            merge_into(&mut self.bonded, peer);
        }
    }

    fn apply(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Started => self.discovered.clear(),
            DiscoveryEvent::PeerFound(peer) => merge_into(&mut self.discovered, peer),
        }
    }

    fn clear(&mut self) {
        self.bonded.clear();
        self.discovered.clear();
    }

    /// Union of both sets. A discovered name overrides the bonded one.
    fn all(&self) -> Vec<Peer> {
        let mut merged = self.bonded.clone();
        for peer in self.discovered.values() {
            merge_into(&mut merged, peer.clone());
        }
        merged.into_values().collect()
    }
}

fn merge_into(peers: &mut BTreeMap<String, Peer>, peer: Peer) {
    match peers.get_mut(&peer.address) {
        Some(existing) => {
            if peer.name.is_some() {
                existing.name = peer.name;
            }
        }
        None => {
            peers.insert(peer.address.clone(), peer);
        }
    }
}

pub struct ConnectionManager {
    peers: Mutex<PeerBook>,
    selected: Mutex<Option<Peer>>,
    attempt: Mutex<Option<AbortHandle>>,
    gate: Arc<ConnectionGate>,
    slot: TransportSlot,
    factory: Arc<dyn SocketFactory>,
    bonded_source: Arc<dyn BondedPeers>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn SocketFactory>,
        bonded_source: Arc<dyn BondedPeers>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            peers: Mutex::new(PeerBook::default()),
            selected: Mutex::new(None),
            attempt: Mutex::new(None),
            gate: Arc::new(ConnectionGate::new()),
            slot: TransportSlot::new(),
            factory,
            bonded_source,
            event_sender,
        }
    }

    /// The slot a control session takes its transport from.
    pub fn transport_slot(&self) -> &TransportSlot {
        &self.slot
    }

    pub fn state(&self) -> ConnectionState {
        self.gate.state()
    }

    pub fn is_ready_to_connect(&self) -> bool {
        self.gate.is_ready_to_connect()
    }

    pub fn peers(&self) -> Vec<Peer> {
        lock(&self.peers).all()
    }

    pub fn selected(&self) -> Option<Peer> {
        lock(&self.selected).clone()
    }

    /// Replaces the bonded set and applies a batch of discovery events.
    pub fn refresh_peers(
        &self,
        bonded: impl IntoIterator<Item = Peer>,
        discovered: impl IntoIterator<Item = DiscoveryEvent>,
    ) -> Vec<Peer> {
        let peers = {
            let mut book = lock(&self.peers);
            book.replace_bonded(bonded);
            for event in discovered {
                book.apply(event);
            }
            book.all()
        };
        debug!(count = peers.len(), "Peer set refreshed");
        self.send(AppEvent::PeersChanged(peers.clone()));
        peers
    }

    pub fn apply_discovery(&self, event: DiscoveryEvent) -> Vec<Peer> {
        let peers = {
            let mut book = lock(&self.peers);
            book.apply(event);
            book.all()
        };
        self.send(AppEvent::PeersChanged(peers.clone()));
        peers
    }

    /// Feeds discovery events from an external scanner until it hangs up.
    pub async fn track_discovery(&self, mut events: mpsc::UnboundedReceiver<DiscoveryEvent>) {
        while let Some(event) = events.recv().await {
            self.apply_discovery(event);
        }
        debug!("Discovery stream ended");
    }

    /// Selects `candidate` unless a connection is already established.
    pub fn select_peer(&self, candidate: Peer) -> bool {
        if self.gate.is_connected() {
            debug!(address = %candidate.address, "Selection ignored while connected");
            return false;
        }
        info!(peer = %candidate, "Peer selected");
        *lock(&self.selected) = Some(candidate);
        true
    }

    /// Starts a connect attempt on a spawned task.
    ///
    /// Must be called from within a tokio runtime. The returned handle
    /// resolves once the attempt reaches a terminal outcome.
    pub fn connect(&self, peer: &Peer) -> Result<JoinHandle<ConnectOutcome>, ConnectRejected> {
        // Held until the attempt is registered so a concurrent reset cannot
        // slip between the selection check and the gate.
        let selected = lock(&self.selected);
        if selected.as_ref() != Some(peer) {
            return Err(ConnectRejected::NotSelected);
        }

        let ticket = self.gate.try_begin().ok_or_else(|| {
            if self.gate.is_connected() {
                ConnectRejected::AlreadyConnected
            } else {
                ConnectRejected::AttemptInFlight
            }
        })?;

        info!(peer = %peer, "Attempting connection");
        self.send(AppEvent::ConnectionState(ConnectionState::Connecting));

        let attempt = ConnectAttempt {
            ticket,
            peer: peer.clone(),
            factory: self.factory.clone(),
            gate: self.gate.clone(),
            slot: self.slot.clone(),
            event_sender: self.event_sender.clone(),
        };
        let handle = tokio::spawn(attempt.run());
        *lock(&self.attempt) = Some(handle.abort_handle());
        drop(selected);

        Ok(handle)
    }

    /// Drops every peer and the selection, cancels any attempt, closes any
    /// live transport and returns the gate to idle.
    pub async fn reset(&self) {
        lock(&self.peers).clear();
        *lock(&self.selected) = None;

        let attempt = lock(&self.attempt).take();
        if let Some(attempt) = attempt {
            attempt.abort();
        }
        self.gate.reset();

        let transport = self.slot.take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                warn!("Failed to close transport during reset: {}", e);
                self.send(AppEvent::Link(LinkEvent::CloseFailed {
                    reason: e.to_string(),
                }));
            }
        }

        info!("Connection state reset");
        self.send(AppEvent::PeersChanged(Vec::new()));
        self.send(AppEvent::ConnectionState(ConnectionState::Idle));
    }

    /// Resets, then repopulates the bonded set from the snapshot source.
    pub async fn refresh(&self) -> Vec<Peer> {
        self.reset().await;
        let bonded = self.bonded_source.bonded_peers();
        self.refresh_peers(bonded, std::iter::empty())
    }

    /// Entry point for platform notifications forwarded by the host.
    pub async fn on_external_event(&self, event: PlatformEvent) {
        match event {
            PlatformEvent::DiscoveryStarted => {
                self.apply_discovery(DiscoveryEvent::Started);
            }
            PlatformEvent::PeerFound(peer) => {
                self.apply_discovery(DiscoveryEvent::PeerFound(peer));
            }
            PlatformEvent::BluetoothEnabled => {
                self.refresh().await;
            }
            PlatformEvent::BluetoothDisabled => {
                warn!("Bluetooth disabled, dropping connection state");
                self.reset().await;
            }
            PlatformEvent::LocationDisabled => {
                warn!("Location services disabled, dropping connection state");
                self.reset().await;
            }
        }
    }

    /// Host teardown.
    pub async fn shutdown(&self) {
        self.reset().await;
    }

    fn send(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }
}

struct ConnectAttempt {
    ticket: AttemptTicket,
    peer: Peer,
    factory: Arc<dyn SocketFactory>,
    gate: Arc<ConnectionGate>,
    slot: TransportSlot,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ConnectAttempt {
    async fn run(self) -> ConnectOutcome {
        let address = self.peer.address.clone();

        let mut socket = match self.factory.create_socket(&self.peer) {
            Ok(socket) => socket,
            Err(e) => {
                error!(%address, "Socket creation failed: {}", e);
                if !self.gate.fail(self.ticket) {
                    return ConnectOutcome::Superseded;
                }
                self.send(AppEvent::ConnectionState(ConnectionState::Idle));
                self.send(AppEvent::Link(LinkEvent::SocketCreateFailed {
                    address,
                    reason: e.to_string(),
                }));
                return ConnectOutcome::SocketCreateFailed;
            }
        };

        match socket.connect().await {
            Ok(transport) => {
                let transport = Arc::new(transport);
                let published = self
                    .gate
                    .complete(self.ticket, || self.slot.publish(transport.clone()));

                match published {
                    Some(displaced) => {
                        if let Some(displaced) = displaced {
                            warn!(address = %displaced.address(), "Replacing a stale transport");
                            if let Err(e) = displaced.close().await {
                                self.send(AppEvent::Link(LinkEvent::CloseFailed {
                                    reason: e.to_string(),
                                }));
                            }
                        }
                        info!(%address, "Connection established");
                        self.send(AppEvent::ConnectionState(ConnectionState::Connected));
                        self.send(AppEvent::Link(LinkEvent::ConnectionEstablished { address }));
                        ConnectOutcome::Established
                    }
                    None => {
                        debug!(%address, "Attempt superseded by reset, discarding transport");
                        let _ = transport.close().await;
                        ConnectOutcome::Superseded
                    }
                }
            }
            Err(e) => {
                error!(%address, "Connection failed: {}", e);
                let current = self.gate.fail(self.ticket);
                if current {
                    self.send(AppEvent::ConnectionState(ConnectionState::Idle));
                    self.send(AppEvent::Link(LinkEvent::ConnectFailed {
                        address,
                        reason: e.to_string(),
                    }));
                }

                if let Err(close_err) = socket.close().await {
                    warn!("Failed to close socket after connect failure: {}", close_err);
                    if current {
                        self.send(AppEvent::Link(LinkEvent::CloseFailed {
                            reason: close_err.to_string(),
                        }));
                    }
                }

                if current {
                    ConnectOutcome::ConnectFailed
                } else {
                    ConnectOutcome::Superseded
                }
            }
        }
    }

    fn send(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }
}
