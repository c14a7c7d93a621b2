//! In-memory transport for tests and simulation.
//!
//! A [`MemoryListener`] binds a name in a process-wide registry; a
//! [`MemoryTransport`] connects to it with a `mem://<name>` URI. Each side
//! gets a writer/reader pair backed by unbounded channels, so tests can
//! script a server against the real connector and session code without any
//! sockets.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{Transport, TransportReader, TransportWriter};

type Halves = (MemoryWriter, MemoryReader);

fn registry() -> &'static Mutex<HashMap<String, mpsc::UnboundedSender<Halves>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, mpsc::UnboundedSender<Halves>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn endpoint_name(uri: &str) -> Result<&str, TransportError> {
    uri.strip_prefix("mem://").ok_or_else(|| {
        TransportError::ConnectFailed(format!("expected a mem:// uri, got \"{uri}\""))
    })
}

/// Connects to a [`MemoryListener`] bound in the same process.
pub struct MemoryTransport;

/// Accepts in-memory connections for a bound name.
///
/// The binding is released when the listener is dropped.
pub struct MemoryListener {
    name: String,
    accept_rx: mpsc::UnboundedReceiver<Halves>,
}

/// Writing half of an in-memory connection.
pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

/// Reading half of an in-memory connection.
pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryListener {
    /// Bind `name` so `mem://<name>` connects here. Rebinding a live name
    /// fails.
    pub fn bind(name: &str) -> Result<Self, TransportError> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let mut registry = registry().lock().unwrap();
        match registry.get(name) {
            Some(existing) if !existing.is_closed() => {
                return Err(TransportError::ConnectFailed(format!(
                    "\"{name}\" is already bound"
                )))
            }
            _ => {
                registry.insert(name.to_string(), accept_tx);
            }
        }
        Ok(Self {
            name: name.to_string(),
            accept_rx,
        })
    }

    /// Wait for the next inbound connection and return the server-side
    /// halves. `None` once the listener's binding has been removed.
    pub async fn accept(&mut self) -> Option<Halves> {
        self.accept_rx.recv().await
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        // Mark our accept channel closed before checking the registry, so
        // the entry removed is ours and not a rebound listener's.
        self.accept_rx.close();
        let mut registry = registry().lock().unwrap();
        if registry
            .get(&self.name)
            .is_some_and(|sender| sender.is_closed())
        {
            registry.remove(&self.name);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    async fn connect(uri: &str) -> Result<(Self::Writer, Self::Reader), TransportError> {
        let name = endpoint_name(uri)?;
        let accept_tx = {
            let registry = registry().lock().unwrap();
            registry.get(name).cloned().ok_or_else(|| {
                TransportError::ConnectFailed(format!("nothing bound at \"{name}\""))
            })?
        };

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let server_halves = (
            MemoryWriter {
                tx: Some(server_tx),
            },
            MemoryReader { rx: server_rx },
        );
        accept_tx.send(server_halves).map_err(|_| {
            TransportError::ConnectFailed(format!("listener for \"{name}\" is gone"))
        })?;

        Ok((
            MemoryWriter {
                tx: Some(client_tx),
            },
            MemoryReader { rx: client_rx },
        ))
    }
}

#[async_trait]
impl TransportWriter for MemoryWriter {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the sender signals end-of-stream to the peer's reader.
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl TransportReader for MemoryReader {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_exchange_frames() {
        let mut listener = MemoryListener::bind("exchange").unwrap();
        let (mut client_writer, mut client_reader) =
            MemoryTransport::connect("mem://exchange").await.unwrap();
        let (mut server_writer, mut server_reader) = listener.accept().await.unwrap();

        client_writer.send("hello".to_string()).await.unwrap();
        assert_eq!(server_reader.receive().await.unwrap().as_deref(), Some("hello"));

        server_writer.send("world".to_string()).await.unwrap();
        assert_eq!(client_reader.receive().await.unwrap().as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let mut listener = MemoryListener::bind("close").unwrap();
        let (mut client_writer, _client_reader) =
            MemoryTransport::connect("mem://close").await.unwrap();
        let (_server_writer, mut server_reader) = listener.accept().await.unwrap();

        client_writer.close().await.unwrap();
        assert_eq!(server_reader.receive().await.unwrap(), None);
        assert!(matches!(
            client_writer.send("late".to_string()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let result = MemoryTransport::connect("mem://missing").await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn test_bad_scheme_fails() {
        let result = MemoryTransport::connect("ws://missing").await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }
}
