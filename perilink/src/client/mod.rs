//! The client session: connection lifecycle, device inventory, and events.
//!
//! A [`DeviceClient`] walks one connection through a fixed lifecycle:
//!
//! ```text
//!   Disconnected ──connect──► Connecting ──handshake + inventory──► Connected
//!        ▲                        │ (failure)                          │
//!        └────────────────────────┴──────────── Disconnecting ◄────────┘
//! ```
//!
//! While connected, a spawned session task consumes the connector's inbound
//! sink (device arrivals and removals, scan completion, sensor readings)
//! and, when the server enforces an idle window, runs the keepalive loop.
//! Any fault on either loop is reported once as [`ClientEvent::Error`] and
//! followed by a full teardown ending in [`ClientEvent::Disconnected`].

mod device;
mod event;

pub use device::{Device, SensorSubscription};
pub use event::ClientEvent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connector::{Connector, Inbound};
use crate::error::ClientError;
use crate::message::{
    ErrorCode, Message, OkMessage, Ping, RequestDeviceList, RequestServerInfo, ServerInfo,
    StartScanning, StopAllDevices, StopScanning, PROTOCOL_VERSION,
};
use crate::transport::Transport;

/// Where the session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, and none being established.
    Disconnected,
    /// A connect attempt (transport, handshake, inventory) is in flight.
    Connecting,
    /// Handshake done; requests and notifications are flowing.
    Connected,
    /// Teardown is in progress.
    Disconnecting,
}

/// One live connection's moving parts, owned for the session's duration.
struct Connection {
    connector: Arc<Connector>,
    /// Cancelling this stops the session task's loops.
    root: CancellationToken,
    run: JoinHandle<()>,
}

struct Inner {
    name: String,
    state: Mutex<ConnectionState>,
    server_info: Mutex<Option<ServerInfo>>,
    /// Snapshot of the live connector for session-level requests; cleared
    /// on disconnect so new requests fail fast.
    link: Mutex<Option<Arc<Connector>>>,
    devices: RwLock<HashMap<u32, Arc<Device>>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    /// Serializes connect and disconnect. A disconnect that loses the race
    /// to another waits for it and then finds nothing left to do.
    connection: tokio::sync::Mutex<Option<Connection>>,
    is_scanning: AtomicBool,
}

/// Client session over one device-control connection.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct DeviceClient {
    inner: Arc<Inner>,
}

impl DeviceClient {
    /// Create a disconnected client and the receiver its session events
    /// arrive on. Dropping the receiver discards events without affecting
    /// the session.
    pub fn new(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(ConnectionState::Disconnected),
                server_info: Mutex::new(None),
                link: Mutex::new(None),
                devices: RwLock::new(HashMap::new()),
                events_tx,
                connection: tokio::sync::Mutex::new(None),
                is_scanning: AtomicBool::new(false),
            }),
        };
        (client, events_rx)
    }

    /// Name this client identifies itself with during the handshake.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    /// Whether the session is currently connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether a scanning cycle is active.
    pub fn is_scanning(&self) -> bool {
        self.inner.is_scanning.load(Ordering::SeqCst)
    }

    /// Name the server reported during the handshake, while connected.
    pub fn server_name(&self) -> Option<String> {
        self.inner
            .server_info
            .lock()
            .unwrap()
            .as_ref()
            .map(|info| info.server_name.clone())
    }

    /// Current device inventory, in no particular order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.inner.devices.read().unwrap().values().cloned().collect()
    }

    /// Look up a device by its server-assigned index.
    pub fn device(&self, index: u32) -> Option<Arc<Device>> {
        self.inner.devices.read().unwrap().get(&index).cloned()
    }

    /// Connect, perform the handshake, and load the device inventory.
    ///
    /// Each device already known to the server is surfaced as a
    /// [`ClientEvent::DeviceAdded`] before this returns. Cancelling `cancel`
    /// later tears the whole session down, the same as [`disconnect`].
    ///
    /// [`disconnect`]: DeviceClient::disconnect
    pub async fn connect<T: Transport>(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let mut slot = self.inner.connection.lock().await;
        if slot.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        self.inner.set_state(ConnectionState::Connecting);
        match Inner::establish::<T>(&self.inner, uri, cancel).await {
            Ok(connection) => {
                *slot = Some(connection);
                self.inner.set_state(ConnectionState::Connected);
                tracing::debug!(uri, "session connected");
                Ok(())
            }
            Err(error) => {
                self.inner.set_state(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    /// Tear the session down: stop the loops, cancel pending requests,
    /// detach every device, and emit [`ClientEvent::Disconnected`].
    ///
    /// Safe to call in any state; concurrent callers all return once the
    /// teardown has completed.
    pub async fn disconnect(&self) {
        self.inner.teardown().await;
    }

    /// Ask the server to start scanning for devices. New arrivals are
    /// surfaced as [`ClientEvent::DeviceAdded`].
    pub async fn start_scanning(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let connector = self.inner.connector()?;
        connector
            .send_expecting::<OkMessage>(
                Message::StartScanning(StartScanning {
                    id: connector.next_id(),
                }),
                cancel,
            )
            .await?;
        self.inner.is_scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Ask the server to stop scanning.
    pub async fn stop_scanning(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let connector = self.inner.connector()?;
        connector
            .send_expecting::<OkMessage>(
                Message::StopScanning(StopScanning {
                    id: connector.next_id(),
                }),
                cancel,
            )
            .await?;
        self.inner.is_scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Halt every device the server controls.
    pub async fn stop_all_devices(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let connector = self.inner.connector()?;
        connector
            .send_expecting::<OkMessage>(
                Message::StopAllDevices(StopAllDevices {
                    id: connector.next_id(),
                }),
                cancel,
            )
            .await?;
        Ok(())
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn connector(&self) -> Result<Arc<Connector>, ClientError> {
        self.link
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    fn emit(&self, event: ClientEvent) {
        // The application may have dropped the receiver; that is its choice.
        let _ = self.events_tx.send(event);
    }

    /// Open the transport, shake hands, load the inventory, and start the
    /// session task. On any failure the connector is torn down and nothing
    /// of the attempt remains.
    async fn establish<T: Transport>(
        inner: &Arc<Self>,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<Connection, ClientError> {
        let (connector, inbound) = Connector::connect::<T>(uri).await?;

        let handshake = async {
            let server_info = connector
                .send_expecting::<ServerInfo>(
                    Message::RequestServerInfo(RequestServerInfo {
                        id: connector.next_id(),
                        client_name: inner.name.clone(),
                        message_version: PROTOCOL_VERSION,
                    }),
                    cancel,
                )
                .await?;
            if server_info.message_version < PROTOCOL_VERSION {
                return Err(ClientError::IncompatibleServer {
                    server: server_info.message_version,
                    required: PROTOCOL_VERSION,
                });
            }

            let inventory = connector
                .send_expecting::<crate::message::DeviceList>(
                    Message::RequestDeviceList(RequestDeviceList {
                        id: connector.next_id(),
                    }),
                    cancel,
                )
                .await?;
            Ok((server_info, inventory))
        };

        let (server_info, inventory) = match handshake.await {
            Ok(outcome) => outcome,
            Err(error) => {
                connector.disconnect().await;
                return Err(error);
            }
        };
        tracing::debug!(
            server = %server_info.server_name,
            version = server_info.message_version,
            max_ping_time = server_info.max_ping_time,
            devices = inventory.devices.len(),
            "handshake complete"
        );

        {
            let mut devices = inner.devices.write().unwrap();
            for info in inventory.devices {
                let index = info.device_index;
                if devices.contains_key(&index) {
                    tracing::warn!(index, "inventory repeats a device index, keeping the first");
                    continue;
                }
                let device = Device::new(info, Arc::clone(&connector));
                devices.insert(index, Arc::clone(&device));
                inner.emit(ClientEvent::DeviceAdded(device));
            }
        }

        let max_ping_time = server_info.max_ping_time;
        *inner.server_info.lock().unwrap() = Some(server_info);
        *inner.link.lock().unwrap() = Some(Arc::clone(&connector));

        let root = cancel.child_token();
        let run = tokio::spawn(Arc::clone(inner).run_session(
            Arc::clone(&connector),
            inbound,
            root.clone(),
            max_ping_time,
        ));

        Ok(Connection {
            connector,
            root,
            run,
        })
    }

    /// Session task body. Faults are reported exactly once; every exit
    /// path funnels into the idempotent teardown.
    async fn run_session(
        self: Arc<Self>,
        connector: Arc<Connector>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        root: CancellationToken,
        max_ping_time: u64,
    ) {
        let keepalive = async {
            if max_ping_time == 0 {
                std::future::pending::<Result<(), ClientError>>().await
            } else {
                keepalive_loop(&connector, max_ping_time).await
            }
        };

        let result = tokio::select! {
            _ = root.cancelled() => Ok(()),
            result = self.notification_loop(&connector, inbound, &root) => result,
            result = keepalive => result,
        };

        if let Err(fault) = result {
            if !root.is_cancelled() {
                tracing::warn!(%fault, "session fault, disconnecting");
                self.emit(ClientEvent::Error(fault));
            }
        }

        // Whatever stopped the loops (fault, caller token, or our own
        // teardown), finish the teardown. It joins this task, so it must
        // run elsewhere; when teardown is already underway the spawned
        // call finds the connection slot empty and returns.
        let inner = Arc::clone(&self);
        tokio::spawn(async move { inner.teardown().await });
    }

    /// Consume the inbound sink until it closes or a fatal message arrives.
    async fn notification_loop(
        &self,
        connector: &Arc<Connector>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        root: &CancellationToken,
    ) -> Result<(), ClientError> {
        while let Some(item) = inbound.recv().await {
            let message = match item {
                Inbound::Message(message) => message,
                Inbound::Invalid(error) => {
                    // Bad frames are reported but do not end the session.
                    self.emit(ClientEvent::Error(error));
                    continue;
                }
            };
            match message {
                Message::DeviceAdded(added) => {
                    let index = added.device.device_index;
                    let device = {
                        let mut devices = self.devices.write().unwrap();
                        if devices.contains_key(&index) {
                            None
                        } else {
                            let device = Device::new(added.device, Arc::clone(connector));
                            devices.insert(index, Arc::clone(&device));
                            Some(device)
                        }
                    };
                    match device {
                        Some(device) => self.emit(ClientEvent::DeviceAdded(device)),
                        None => self.emit(ClientEvent::Error(ClientError::Protocol(format!(
                            "device index {index} added twice"
                        )))),
                    }
                }
                Message::DeviceRemoved(removed) => {
                    let index = removed.device_index;
                    let device = self.devices.write().unwrap().remove(&index);
                    match device {
                        Some(device) => {
                            device.detach();
                            self.emit(ClientEvent::DeviceRemoved(device));
                        }
                        None => self.emit(ClientEvent::Error(ClientError::Protocol(format!(
                            "unknown device index {index} removed"
                        )))),
                    }
                }
                Message::ScanningFinished(_) => {
                    self.is_scanning.store(false, Ordering::SeqCst);
                    self.emit(ClientEvent::ScanningFinished);
                }
                Message::SensorReading(reading) => {
                    let device = self
                        .devices
                        .read()
                        .unwrap()
                        .get(&reading.device_index)
                        .cloned();
                    match device {
                        Some(device) => device.deliver_reading(reading)?,
                        None => {
                            return Err(ClientError::Protocol(format!(
                                "reading for unknown device index {}",
                                reading.device_index
                            )))
                        }
                    }
                }
                Message::Error(error) => {
                    // An unsolicited error is connection-scoped and fatal.
                    return Err(if error.error_code == ErrorCode::Ping {
                        ClientError::PingTimeout
                    } else {
                        ClientError::Server {
                            code: error.error_code,
                            message: error.error_message,
                        }
                    });
                }
                other => {
                    return Err(ClientError::Protocol(format!(
                        "unsolicited {} message",
                        other.name()
                    )))
                }
            }
        }

        // The sink closed: either our own shutdown or a connector fault.
        if root.is_cancelled() {
            Ok(())
        } else {
            Err(connector
                .take_fault()
                .unwrap_or(ClientError::ConnectionClosed))
        }
    }

    /// Full teardown. Idempotent; the connection slot is the claim.
    async fn teardown(&self) {
        let connection = {
            let mut slot = self.connection.lock().await;
            match slot.take() {
                Some(connection) => connection,
                None => return,
            }
        };
        self.set_state(ConnectionState::Disconnecting);
        tracing::debug!("session disconnecting");

        *self.link.lock().unwrap() = None;
        connection.root.cancel();
        if let Err(error) = connection.run.await {
            tracing::warn!(?error, "session task panicked during shutdown");
        }
        connection.connector.disconnect().await;

        let drained: Vec<Arc<Device>> = {
            let mut devices = self.devices.write().unwrap();
            devices.drain().map(|(_, device)| device).collect()
        };
        for device in drained {
            device.detach();
            self.emit(ClientEvent::DeviceRemoved(device));
        }

        self.is_scanning.store(false, Ordering::SeqCst);
        *self.server_info.lock().unwrap() = None;
        self.set_state(ConnectionState::Disconnected);
        self.emit(ClientEvent::Disconnected);
    }
}

/// Ping on the half-interval cadence the server's idle window implies; a
/// ping unanswered within the full window is a fault.
async fn keepalive_loop(
    connector: &Arc<Connector>,
    max_ping_time: u64,
) -> Result<(), ClientError> {
    let window = Duration::from_millis(max_ping_time.max(1));
    let mut ticker = tokio::time::interval(Duration::from_millis((max_ping_time / 2).max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;
    let cancel = CancellationToken::new();
    loop {
        ticker.tick().await;
        let ping = Message::Ping(Ping {
            id: connector.next_id(),
        });
        match tokio::time::timeout(window, connector.send_expecting::<OkMessage>(ping, &cancel))
            .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => return Err(error),
            Err(_) => return Err(ClientError::PingTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_new_client_starts_disconnected() {
        let (client, _events) = DeviceClient::new("test");
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(!client.is_scanning());
        assert!(client.devices().is_empty());
        assert!(client.server_name().is_none());
        assert_eq!(client.name(), "test");
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_a_no_op() {
        let (client, mut events) = DeviceClient::new("test");
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let (client, _events) = DeviceClient::new("test");
        let cancel = CancellationToken::new();
        let result = client
            .connect::<MemoryTransport>("mem://nobody-is-listening", &cancel)
            .await;
        assert!(matches!(
            result,
            Err(ClientError::Transport(
                crate::error::TransportError::ConnectFailed(_)
            ))
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_session_requests_require_a_connection() {
        let (client, _events) = DeviceClient::new("test");
        let cancel = CancellationToken::new();
        assert!(matches!(
            client.start_scanning(&cancel).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.stop_all_devices(&cancel).await,
            Err(ClientError::NotConnected)
        ));
    }
}
