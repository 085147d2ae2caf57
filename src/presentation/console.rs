//! Line-oriented control surface.
//!
//! Stands in for the touch UI: it forwards platform events, peer selection,
//! sliders and gesture buttons to the link core and prints status notices.

use crate::domain::models::{
    AppEvent, MessageSeverity, MotorIntent, Peer, PlatformEvent, StatusMessage, TrafficDirection,
};
use crate::infrastructure::bluetooth::protocol::Gesture;
use crate::infrastructure::bluetooth::{
    CommunicationFlag, ConnectionManager, ControlSession, SessionError,
};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const HELP: &str = "\
commands:
  peers                     list bonded and discovered peers
  scan                      start a discovery pass (clears discovered peers)
  found <address> [name]    report a discovered peer
  select <address>          select a peer
  connect                   connect to the selected peer
  control                   start a control session on the connection
  left <speed> | right <speed>
                            set a motor slider (-100..100)
  stop | fwd | back | tr | tl | sr | sl
                            gesture buttons
  send <text>               send raw command text
  disconnect                end the session and reset the link
  refresh                   reset and reload bonded peers
  bt on|off | location off  platform notifications
  status                    show link state
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Peers,
    Platform(PlatformEvent),
    Select(String),
    Connect,
    Control,
    SetLeft(i32),
    SetRight(i32),
    Gesture(Gesture),
    Raw(String),
    Disconnect,
    Refresh,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleParseError {
    #[error("unknown command: {0} (try `help`)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let speed = |usage: &'static str| {
            rest.parse::<i32>()
                .map_err(|_| ConsoleParseError::Usage(usage))
        };

        Ok(match word {
            "peers" => Self::Peers,
            "scan" => Self::Platform(PlatformEvent::DiscoveryStarted),
            "found" => {
                let mut parts = rest.splitn(2, char::is_whitespace);
                let address = parts
                    .next()
                    .filter(|a| !a.is_empty())
                    .ok_or(ConsoleParseError::Usage("found <address> [name]"))?;
                let peer = match parts.next().map(str::trim).filter(|n| !n.is_empty()) {
                    Some(name) => Peer::named(address, name),
                    None => Peer::new(address),
                };
                Self::Platform(PlatformEvent::PeerFound(peer))
            }
            "select" if !rest.is_empty() => Self::Select(rest.to_string()),
            "select" => return Err(ConsoleParseError::Usage("select <address>")),
            "connect" => Self::Connect,
            "control" => Self::Control,
            "left" => Self::SetLeft(speed("left <speed>")?),
            "right" => Self::SetRight(speed("right <speed>")?),
            "stop" => Self::Gesture(Gesture::Stop),
            "fwd" => Self::Gesture(Gesture::Forward),
            "back" => Self::Gesture(Gesture::Backward),
            "tr" => Self::Gesture(Gesture::TurnRight),
            "tl" => Self::Gesture(Gesture::TurnLeft),
            "sr" => Self::Gesture(Gesture::SpinRight),
            "sl" => Self::Gesture(Gesture::SpinLeft),
            "send" if !rest.is_empty() => Self::Raw(rest.to_string()),
            "send" => return Err(ConsoleParseError::Usage("send <text>")),
            "disconnect" => Self::Disconnect,
            "refresh" => Self::Refresh,
            "bt" => match rest {
                "on" => Self::Platform(PlatformEvent::BluetoothEnabled),
                "off" => Self::Platform(PlatformEvent::BluetoothDisabled),
                _ => return Err(ConsoleParseError::Usage("bt on|off")),
            },
            "location" if rest == "off" => Self::Platform(PlatformEvent::LocationDisabled),
            "location" => return Err(ConsoleParseError::Usage("location off")),
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(ConsoleParseError::Unknown(other.to_string())),
        })
    }
}

pub struct ConsoleHost {
    manager: Arc<ConnectionManager>,
    communication: CommunicationFlag,
    session: Option<ControlSession>,
    intent: MotorIntent,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ConsoleHost {
    pub fn new(manager: Arc<ConnectionManager>, event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            manager,
            communication: CommunicationFlag::new(),
            session: None,
            intent: MotorIntent::default(),
            event_sender,
        }
    }

    pub fn intent(&self) -> MotorIntent {
        self.intent
    }

    /// Reads commands from `input` until `quit` or end of input.
    pub async fn run<R>(&mut self, input: R) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        println!("{}", HELP);
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<ConsoleCommand>() {
                Ok(ConsoleCommand::Quit) => break,
                Ok(command) => self.execute(command).await,
                Err(e) => println!("{}", e),
            }
        }
        self.end_session().await;
        Ok(())
    }

    pub async fn execute(&mut self, command: ConsoleCommand) {
        debug!(?command, "Console command");
        match command {
            ConsoleCommand::Peers => {
                let peers = self.manager.peers();
                if peers.is_empty() {
                    println!("no peers");
                }
                for peer in peers {
                    println!("  {}", peer);
                }
            }
            ConsoleCommand::Platform(event) => {
                if matches!(
                    event,
                    PlatformEvent::BluetoothEnabled
                        | PlatformEvent::BluetoothDisabled
                        | PlatformEvent::LocationDisabled
                ) {
                    self.end_session().await;
                }
                self.manager.on_external_event(event).await;
            }
            ConsoleCommand::Select(address) => {
                let peer = self
                    .manager
                    .peers()
                    .into_iter()
                    .find(|p| p.address == address || p.name.as_deref() == Some(address.as_str()))
                    .unwrap_or_else(|| Peer::new(address));
                if !self.manager.select_peer(peer) {
                    self.notice("Already connected; disconnect first", MessageSeverity::Warning);
                }
            }
            ConsoleCommand::Connect => match self.manager.selected() {
                Some(peer) => match self.manager.connect(&peer) {
                    Ok(_attempt) => {
                        self.notice("Attempting connection...", MessageSeverity::Info)
                    }
                    Err(e) => debug!("Connect ignored: {}", e),
                },
                None => self.notice("Select a peer first", MessageSeverity::Warning),
            },
            ConsoleCommand::Control => {
                if self.session.as_ref().is_some_and(ControlSession::is_active) {
                    self.notice("Control session already running", MessageSeverity::Info);
                    return;
                }
                self.end_session().await;
                match ControlSession::start(
                    self.manager.transport_slot(),
                    &self.communication,
                    self.event_sender.clone(),
                ) {
                    Ok(session) => {
                        self.intent = MotorIntent::default();
                        self.session = Some(session);
                        self.notice("Control session started", MessageSeverity::Success);
                    }
                    Err(e) => self.notice(&e.to_string(), MessageSeverity::Warning),
                }
            }
            ConsoleCommand::SetLeft(speed) => {
                self.intent = MotorIntent::new(speed, self.intent.right as i32);
            }
            ConsoleCommand::SetRight(speed) => {
                self.intent = MotorIntent::new(self.intent.left as i32, speed);
            }
            ConsoleCommand::Gesture(gesture) => {
                self.drop_closed_session().await;
                let Some(session) = self.session.as_ref() else {
                    self.notice("No control session", MessageSeverity::Warning);
                    return;
                };
                match session.drive(gesture, self.intent).await {
                    Ok(encoded) => {
                        // Keep the sliders in step with what was sent.
                        self.intent = encoded.sliders;
                        println!("sliders: left {} right {}", self.intent.left, self.intent.right);
                    }
                    Err(SessionError::Disrupted(_)) => {}
                    Err(e) => self.notice(&e.to_string(), MessageSeverity::Warning),
                }
            }
            ConsoleCommand::Raw(text) => {
                self.drop_closed_session().await;
                match self.session.as_ref() {
                    Some(session) => {
                        if let Err(e) = session.send_command(&text).await {
                            debug!("Raw send failed: {}", e);
                        }
                    }
                    None => self.notice("No control session", MessageSeverity::Warning),
                }
            }
            ConsoleCommand::Disconnect | ConsoleCommand::Refresh => {
                self.end_session().await;
                self.manager.refresh().await;
            }
            ConsoleCommand::Status => {
                println!(
                    "state: {:?}, ready: {}, selected: {}, session: {}, sliders: {} / {}",
                    self.manager.state(),
                    self.manager.is_ready_to_connect(),
                    self.manager
                        .selected()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    self.communication.is_active(),
                    self.intent.left,
                    self.intent.right,
                );
            }
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => {}
        }
    }

    async fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.terminate().await;
        }
    }

    /// Forgets a session whose transport was closed by a connection reset.
    async fn drop_closed_session(&mut self) {
        if self.session.as_ref().is_some_and(|session| !session.is_active()) {
            self.end_session().await;
        }
    }

    fn notice(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

/// Prints events for the user until every sender is gone.
pub async fn print_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::Link(link) => {
                let tag = match link.severity() {
                    MessageSeverity::Error => "error",
                    MessageSeverity::Warning => "warn",
                    MessageSeverity::Success => "ok",
                    MessageSeverity::Info => "info",
                };
                println!("[{}] {}", tag, link.notice());
            }
            AppEvent::Traffic(record) => match record.direction {
                TrafficDirection::Sent => println!("> {}", record.text),
                TrafficDirection::Received => println!("< {}", record.text),
            },
            AppEvent::PeersChanged(peers) => debug!(count = peers.len(), "Peers changed"),
            AppEvent::ConnectionState(state) => println!("link: {:?}", state),
            AppEvent::LogMessage(message) => match message.severity {
                MessageSeverity::Warning | MessageSeverity::Error => {
                    warn!("{}", message.message);
                    println!("! {}", message.message);
                }
                _ => println!("{}", message.message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionState;
    use crate::infrastructure::bluetooth::testing::{Script, ScriptedFactory};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_commands() {
        assert_eq!("fwd".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Gesture(Gesture::Forward)));
        assert_eq!(" left -40 ".parse::<ConsoleCommand>(), Ok(ConsoleCommand::SetLeft(-40)));
        assert_eq!(
            "found 98:D3:31:F5:2A:10 HC 06".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Platform(PlatformEvent::PeerFound(Peer::named(
                "98:D3:31:F5:2A:10",
                "HC 06"
            ))))
        );
        assert_eq!(
            "send F 20".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Raw("F 20".to_string()))
        );
        assert_eq!(
            "bt off".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Platform(PlatformEvent::BluetoothDisabled))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "right fast".parse::<ConsoleCommand>(),
            Err(ConsoleParseError::Usage("right <speed>"))
        );
        assert_eq!(
            "select".parse::<ConsoleCommand>(),
            Err(ConsoleParseError::Usage("select <address>"))
        );
        assert!(matches!(
            "jump".parse::<ConsoleCommand>(),
            Err(ConsoleParseError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn test_select_connect_and_drive() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(factory.clone()),
            Arc::new(vec![Peer::named("AA", "robot")]),
            tx.clone(),
        ));
        manager.refresh().await;
        let mut host = ConsoleHost::new(manager.clone(), tx);

        host.execute(ConsoleCommand::Select("robot".into())).await;
        assert_eq!(manager.selected(), Some(Peer::new("AA")));

        host.execute(ConsoleCommand::Connect).await;
        while manager.state() != ConnectionState::Connected {
            tokio::task::yield_now().await;
        }

        host.execute(ConsoleCommand::Control).await;
        host.execute(ConsoleCommand::SetLeft(-30)).await;
        host.execute(ConsoleCommand::SetRight(50)).await;
        host.execute(ConsoleCommand::Gesture(Gesture::Backward)).await;
        assert_eq!(host.intent(), MotorIntent::new(-50, -50));

        let mut remote = factory.take_remote().unwrap();
        let mut buf = [0u8; 6];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"B 50\r\n");

        host.execute(ConsoleCommand::Disconnect).await;
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.peers(), vec![Peer::new("AA")]);
    }

    #[tokio::test]
    async fn test_drive_after_bluetooth_cycle() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(factory.clone()),
            Arc::new(vec![Peer::named("AA", "robot")]),
            tx.clone(),
        ));
        manager.refresh().await;
        let mut host = ConsoleHost::new(manager.clone(), tx);

        async fn connect_and_control(host: &mut ConsoleHost, manager: &ConnectionManager) {
            host.execute(ConsoleCommand::Select("AA".into())).await;
            host.execute(ConsoleCommand::Connect).await;
            while manager.state() != ConnectionState::Connected {
                tokio::task::yield_now().await;
            }
            host.execute(ConsoleCommand::Control).await;
        }

        connect_and_control(&mut host, &manager).await;
        assert!(host.communication.is_active());

        host.execute(ConsoleCommand::Platform(PlatformEvent::BluetoothDisabled)).await;
        assert!(host.session.is_none());
        assert!(!host.communication.is_active());
        host.execute(ConsoleCommand::Platform(PlatformEvent::BluetoothEnabled)).await;

        connect_and_control(&mut host, &manager).await;
        assert!(host.communication.is_active());
        host.execute(ConsoleCommand::SetLeft(60)).await;
        host.execute(ConsoleCommand::SetRight(60)).await;
        host.execute(ConsoleCommand::Gesture(Gesture::Forward)).await;

        let mut remote = factory.take_remote().unwrap();
        let mut buf = [0u8; 6];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"F 60\r\n");

        host.execute(ConsoleCommand::Disconnect).await;
    }

    #[tokio::test]
    async fn test_gesture_after_reset_reports_no_session() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(factory),
            Arc::new(vec![Peer::new("AA")]),
            tx.clone(),
        ));
        let mut host = ConsoleHost::new(manager.clone(), tx);
        host.execute(ConsoleCommand::Select("AA".into())).await;
        host.execute(ConsoleCommand::Connect).await;
        while manager.state() != ConnectionState::Connected {
            tokio::task::yield_now().await;
        }
        host.execute(ConsoleCommand::Control).await;

        // Reset from outside the console closes the session's transport.
        manager.reset().await;
        host.execute(ConsoleCommand::Gesture(Gesture::Stop)).await;
        assert!(host.session.is_none());

        let mut saw_notice = false;
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::LogMessage(message) = event {
                saw_notice |= message.message == "No control session";
            }
        }
        assert!(saw_notice);
    }
}
