//! # Perilink
//!
//! Async client engine for a JSON device-control wire protocol.
//!
//! Perilink speaks protocol version 3 over a framed text transport
//! (WebSocket in production, an in-memory pair in tests): it performs the
//! version handshake, mirrors the server's device inventory, correlates
//! every request with its reply, keeps the connection alive against the
//! server's idle window, and streams subscribed sensor readings.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     client                                  │
//! │  DeviceClient lifecycle • device inventory • ClientEvent    │
//! │  keepalive loop • sensor subscriptions                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    connector                                │
//! │  driver task owning both transport halves                   │
//! │  read/write loops • pending-reply correlation table         │
//! ├──────────────────────────┬──────────────────────────────────┤
//! │         codec            │          message                 │
//! │  JSON array-of-envelope  │  typed protocol messages         │
//! │  frames                  │  and device capabilities         │
//! ├──────────────────────────┴──────────────────────────────────┤
//! │                    transport                                │
//! │  Transport trait • WebSocketTransport • MemoryTransport     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use perilink::prelude::*;
//!
//! let (client, mut events) = DeviceClient::new("my-app");
//! let cancel = CancellationToken::new();
//! client
//!     .connect::<WebSocketTransport>("ws://127.0.0.1:12345", &cancel)
//!     .await?;
//! for device in client.devices() {
//!     device.scalar_all(0.5, &cancel).await?;
//! }
//! ```

#![deny(missing_docs)]

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod prelude;
pub mod transport;

mod connector;

pub use client::{ClientEvent, ConnectionState, Device, DeviceClient, SensorSubscription};
pub use error::{ClientError, CodecError, TransportError};
