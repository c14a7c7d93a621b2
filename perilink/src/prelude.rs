//! Common imports for the perilink client engine.
//!
//! This module provides a convenient prelude for importing commonly used types and traits.

// Re-export core types
pub use crate::client::{
    ClientEvent, ConnectionState, Device, DeviceClient, SensorSubscription,
};
pub use crate::error::{ClientError, CodecError, TransportError};
pub use crate::message::{
    ActuatorType, DeviceInfo, ErrorCode, SensorType, PROTOCOL_VERSION,
};
pub use crate::transport::{MemoryTransport, Transport, WebSocketTransport};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;

/// Result type used across the client engine.
pub type Result<T> = std::result::Result<T, ClientError>;
