use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A remote robot-side endpoint.
///
/// Identity is the hardware address alone; the display name is whatever the
/// peer advertised most recently and takes no part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Peer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }

    pub fn named(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: Some(name.into()),
        }
    }

    /// Name to show in device lists, falling back to the address.
    pub fn label(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.address,
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => write!(f, "{} ({})", name, self.address),
            _ => f.write_str(&self.address),
        }
    }
}

/// Lifecycle of the single process-wide connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Transient; the gate moves straight back to `Idle` after cleanup.
    Failed,
}

/// Speeds requested for each motor, in percent of full power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotorIntent {
    pub left: i8,
    pub right: i8,
}

impl MotorIntent {
    pub const MAX_SPEED: i32 = 100;

    /// Offset between a 0..=200 slider position and a signed speed.
    pub const SLIDER_OFFSET: i32 = 100;

    /// Builds an intent, clamping both sides into `[-100, 100]`.
    pub fn new(left: i32, right: i32) -> Self {
        Self {
            left: clamp_speed(left),
            right: clamp_speed(right),
        }
    }

    pub fn from_slider(left_progress: i32, right_progress: i32) -> Self {
        Self::new(
            left_progress - Self::SLIDER_OFFSET,
            right_progress - Self::SLIDER_OFFSET,
        )
    }

    pub fn to_slider(self) -> (i32, i32) {
        (
            self.left as i32 + Self::SLIDER_OFFSET,
            self.right as i32 + Self::SLIDER_OFFSET,
        )
    }
}

fn clamp_speed(speed: i32) -> i8 {
    speed.clamp(-MotorIntent::MAX_SPEED, MotorIntent::MAX_SPEED) as i8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDirection {
    Sent,
    Received,
}

/// One line of traffic on the link, kept for the log view only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub direction: TrafficDirection,
    pub text: String,
}

impl CommandRecord {
    pub fn sent(text: impl Into<String>) -> Self {
        Self {
            direction: TrafficDirection::Sent,
            text: text.into(),
        }
    }

    pub fn received(text: impl Into<String>) -> Self {
        Self {
            direction: TrafficDirection::Received,
            text: text.into(),
        }
    }
}

/// Status notices raised by the connection core.
///
/// Every failure class maps to exactly one variant, and each occurrence is
/// delivered; nothing is deduplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    SocketCreateFailed { address: String, reason: String },
    ConnectFailed { address: String, reason: String },
    ConnectionEstablished { address: String },
    LinkDisrupted { reason: String },
    CloseFailed { reason: String },
}

impl LinkEvent {
    pub fn severity(&self) -> MessageSeverity {
        match self {
            Self::ConnectionEstablished { .. } => MessageSeverity::Success,
            Self::CloseFailed { .. } => MessageSeverity::Warning,
            _ => MessageSeverity::Error,
        }
    }

    /// User-facing notice text.
    pub fn notice(&self) -> String {
        match self {
            Self::SocketCreateFailed { address, .. } => {
                format!("Could not create a socket for {}", address)
            }
            Self::ConnectFailed { address, .. } => {
                format!("Connection to {} failed", address)
            }
            Self::ConnectionEstablished { address } => {
                format!("Connected to {}", address)
            }
            Self::LinkDisrupted { .. } => "Communication with the robot was disrupted".to_string(),
            Self::CloseFailed { .. } => "Failed to close the robot socket".to_string(),
        }
    }
}

/// External platform events forwarded by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    DiscoveryStarted,
    PeerFound(Peer),
    BluetoothEnabled,
    BluetoothDisabled,
    LocationDisabled,
}

/// Discovery-only subset of [`PlatformEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Started,
    PeerFound(Peer),
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    Link(LinkEvent),
    Traffic(CommandRecord),
    PeersChanged(Vec<Peer>),
    ConnectionState(ConnectionState),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_peer_identity_is_address() {
        let a = Peer::named("00:11:22:33:44:55", "HC-06");
        let b = Peer::named("00:11:22:33:44:55", "robot");
        assert_eq!(a, b);

        let set: HashSet<Peer> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_peer_label_falls_back_to_address() {
        assert_eq!(Peer::new("AA:BB").label(), "AA:BB");
        assert_eq!(Peer::named("AA:BB", "").label(), "AA:BB");
        assert_eq!(Peer::named("AA:BB", "bot").label(), "bot");
    }

    #[test]
    fn test_motor_intent_clamps() {
        let intent = MotorIntent::new(150, -250);
        assert_eq!(intent, MotorIntent { left: 100, right: -100 });
    }

    #[test]
    fn test_slider_offset() {
        let intent = MotorIntent::from_slider(160, 40);
        assert_eq!(intent, MotorIntent { left: 60, right: -60 });
        assert_eq!(intent.to_slider(), (160, 40));
    }

    #[test]
    fn test_failure_notices_are_errors() {
        let event = LinkEvent::ConnectFailed {
            address: "AA".into(),
            reason: "refused".into(),
        };
        assert_eq!(event.severity(), MessageSeverity::Error);
        assert!(event.notice().contains("AA"));
    }
}
