//! Transport abstraction for the message-framed socket connection.
//!
//! A [`Transport`] opens a bidirectional connection to a URI and yields a
//! writer/reader pair. Frames are complete logical messages: a reader never
//! returns a partial frame (reassembly of fragments is the implementation's
//! job), and a writer sends one frame per call.
//!
//! The connector's driver task is the sole owner of both halves, which
//! serializes writes without any extra locking.

use async_trait::async_trait;

use crate::error::TransportError;

pub mod mem;
pub mod websocket;

pub use mem::{MemoryListener, MemoryReader, MemoryTransport, MemoryWriter};
pub use websocket::WebSocketTransport;

/// A way to open a message-framed connection to a URI.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Reading half produced by [`Transport::connect`].
    type Reader: TransportReader;
    /// Writing half produced by [`Transport::connect`].
    type Writer: TransportWriter;

    /// Open a connection. On failure nothing is left running.
    async fn connect(uri: &str) -> Result<(Self::Writer, Self::Reader), TransportError>;
}

/// The receiving half of an open connection.
#[async_trait]
pub trait TransportReader: Send + 'static {
    /// Receive one complete frame. `Ok(None)` means the peer closed the
    /// connection cleanly.
    async fn receive(&mut self) -> Result<Option<String>, TransportError>;
}

/// The sending half of an open connection.
#[async_trait]
pub trait TransportWriter: Send + 'static {
    /// Send one complete frame.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the connection. Safe to call after a failure.
    async fn close(&mut self) -> Result<(), TransportError>;
}
