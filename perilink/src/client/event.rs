//! Session events delivered to the embedding application.

use std::sync::Arc;

use crate::client::Device;
use crate::error::ClientError;

/// Something happened on the session that the application may care about.
///
/// Events arrive on the receiver returned by [`DeviceClient::new`]; dropping
/// that receiver silently discards them without affecting the session.
///
/// [`DeviceClient::new`]: crate::client::DeviceClient::new
#[derive(Debug)]
pub enum ClientEvent {
    /// A device joined the inventory, at connect time or during scanning.
    DeviceAdded(Arc<Device>),
    /// A device left the inventory. The handle is already detached; its
    /// commands fail with [`ClientError::NotConnected`].
    DeviceRemoved(Arc<Device>),
    /// The server finished its scanning cycle on its own.
    ScanningFinished,
    /// A non-fatal or fatal session error. Fatal errors are followed by
    /// [`ClientEvent::Disconnected`].
    Error(ClientError),
    /// The session ended. Emitted exactly once per connection.
    Disconnected,
}
