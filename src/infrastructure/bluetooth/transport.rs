//! Transport Module
//!
//! A line-oriented byte stream to one peer, plus the single slot that hands
//! the live transport from the connection manager to the control session.

use crate::infrastructure::bluetooth::lock;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Line terminator appended to every outbound command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Longest inbound line, terminator included. Longer lines are split.
pub const MAX_LINE_LENGTH: u64 = 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("no socket mapping for peer {0}")]
    UnknownPeer(String),

    #[error("invalid peer address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open connection to one peer.
///
/// Reads and writes use independent halves and may run concurrently.
/// `close` is idempotent and wakes any pending read or write with
/// [`TransportError::Closed`].
pub struct Transport {
    address: String,
    reader: tokio::sync::Mutex<BufReader<BoxedReader>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
}

impl Transport {
    pub fn new(address: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            address: address.into(),
            reader: tokio::sync::Mutex::new(BufReader::new(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed,
        }
    }

    /// Splits a connected stream into the transport's read and write halves.
    pub fn open_streams<S>(address: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(address, Box::new(reader), Box::new(writer))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Reads one line without its terminator. `Ok(None)` is end of stream.
    pub async fn read_line(&self) -> Result<Option<String>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        let mut reader = self.reader.lock().await;
        let mut limited = (&mut *reader).take(MAX_LINE_LENGTH);
        let mut buf = Vec::new();
        let read = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => return Err(TransportError::Closed),
            read = limited.read_until(b'\n', &mut buf) => read,
        };

        let read = read?;
        if read == 0 {
            return Ok(None);
        }
        if read as u64 == MAX_LINE_LENGTH && buf.last() != Some(&b'\n') {
            warn!(
                address = %self.address,
                limit = MAX_LINE_LENGTH,
                "Inbound line too long, splitting"
            );
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Writes `text` followed by CRLF as a single frame.
    pub async fn write_line(&self, text: &str) -> Result<(), TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        let frame = format!("{}{}", text, LINE_TERMINATOR);

        let write = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            result = write => result.map_err(TransportError::from),
        };
        result
    }

    /// Closes both directions. Calls after the first are no-ops.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        debug!(address = %self.address, "Closing transport");

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

/// Holds the one live transport between connect and control.
#[derive(Clone, Default)]
pub struct TransportSlot {
    inner: Arc<Mutex<Option<Arc<Transport>>>>,
}

impl TransportSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `transport`, returning whatever it displaced.
    pub fn publish(&self, transport: Arc<Transport>) -> Option<Arc<Transport>> {
        lock(&self.inner).replace(transport)
    }

    pub fn current(&self) -> Option<Arc<Transport>> {
        lock(&self.inner).clone()
    }

    pub fn take(&self) -> Option<Arc<Transport>> {
        lock(&self.inner).take()
    }

    /// Clears the slot only if it still holds `transport`.
    pub fn release(&self, transport: &Arc<Transport>) -> bool {
        let mut slot = lock(&self.inner);
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, transport) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_occupied(&self) -> bool {
        lock(&self.inner).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn pair() -> (Transport, tokio::io::DuplexStream) {
        let (local, remote) = duplex(1024);
        (Transport::open_streams("test:1", local), remote)
    }

    #[tokio::test]
    async fn test_write_appends_crlf() {
        let (transport, mut remote) = pair();
        transport.write_line("F 60").await.unwrap();

        let mut buf = [0u8; 6];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"F 60\r\n");
    }

    #[tokio::test]
    async fn test_long_line_is_split_at_limit() {
        let (local, mut remote) = duplex(4096);
        let transport = Transport::open_streams("test:1", local);
        let long = "x".repeat(MAX_LINE_LENGTH as usize + 100);
        remote.write_all(format!("{}\r\nok\r\n", long).as_bytes()).await.unwrap();

        let first = transport.read_line().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_LINE_LENGTH as usize);
        let rest = transport.read_line().await.unwrap().unwrap();
        assert_eq!(rest, "x".repeat(100));
        assert_eq!(transport.read_line().await.unwrap().as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_read_lines_until_eof() {
        let (transport, mut remote) = pair();
        remote.write_all(b"ready\r\nspeed 40\n").await.unwrap();
        drop(remote);

        assert_eq!(transport.read_line().await.unwrap().as_deref(), Some("ready"));
        assert_eq!(
            transport.read_line().await.unwrap().as_deref(),
            Some("speed 40")
        );
        assert_eq!(transport.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (transport, _remote) = pair();
        let transport = Arc::new(transport);

        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.read_line().await })
        };
        tokio::task::yield_now().await;

        transport.close().await.unwrap();
        let result = reader.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, _remote) = pair();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());
        assert!(matches!(
            transport.write_line("STP").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_slot_release_only_matching() {
        let slot = TransportSlot::new();
        let (a, _ra) = pair();
        let (b, _rb) = pair();
        let a = Arc::new(a);
        let b = Arc::new(b);

        assert!(slot.publish(a.clone()).is_none());
        assert!(!slot.release(&b));
        assert!(slot.is_occupied());
        assert!(slot.release(&a));
        assert!(!slot.is_occupied());
    }
}
