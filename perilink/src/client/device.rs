//! Device handles and sensor subscriptions.
//!
//! A [`Device`] is a capability snapshot plus a link to the live connection.
//! The wire format does not number individual actuators or sensors, so
//! indexes are assigned by declaration order within each command kind; the
//! index a caller passes to [`Device::scalar`] is the position of that
//! actuator in [`Device::scalar_actuators`].
//!
//! When the device leaves the inventory or the session ends, the handle is
//! detached: every command on it fails with [`ClientError::NotConnected`]
//! and open sensor subscription streams end.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connector::Connector;
use crate::error::ClientError;
use crate::message::{
    ActuatorAttribute, DeviceInfo, LinearCmd, LinearCommand, Message, OkMessage, RotateCmd,
    RotateCommand, ScalarCmd, ScalarCommand, SensorAttribute, SensorReadCmd, SensorReading,
    SensorSubscribeCmd, SensorType, SensorUnsubscribeCmd, StopDeviceCmd,
};

/// Subscription key. A device may expose several sensors of the same kind,
/// and several kinds at the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SensorKey {
    sensor_index: u32,
    sensor_type: SensorType,
}

/// One device in the server's inventory.
///
/// Handles are shared (`Arc<Device>`) between the session's inventory, the
/// application, and emitted events; a handle stays valid after removal but
/// its commands fail once detached.
pub struct Device {
    index: u32,
    name: String,
    display_name: Option<String>,
    message_timing_gap: u32,
    scalar_actuators: Vec<ActuatorAttribute>,
    rotate_actuators: Vec<ActuatorAttribute>,
    linear_actuators: Vec<ActuatorAttribute>,
    read_sensors: Vec<SensorAttribute>,
    subscribe_sensors: Vec<SensorAttribute>,
    supports_stop: bool,
    /// Cleared on detach; commands fail from then on.
    link: Mutex<Option<Arc<Connector>>>,
    subscriptions: Mutex<HashMap<SensorKey, mpsc::UnboundedSender<Vec<i32>>>>,
    /// Handed to subscriptions so they can reach back without keeping the
    /// device alive.
    weak_self: Weak<Device>,
}

impl Device {
    pub(crate) fn new(info: DeviceInfo, connector: Arc<Connector>) -> Arc<Self> {
        let attrs = info.device_messages;
        Arc::new_cyclic(|weak_self| Self {
            index: info.device_index,
            name: info.device_name,
            display_name: info.device_display_name,
            message_timing_gap: info.device_message_timing_gap,
            scalar_actuators: attrs.scalar_cmd,
            rotate_actuators: attrs.rotate_cmd,
            linear_actuators: attrs.linear_cmd,
            read_sensors: attrs.sensor_read_cmd,
            subscribe_sensors: attrs.sensor_subscribe_cmd,
            supports_stop: attrs.stop_device_cmd.is_some(),
            link: Mutex::new(Some(connector)),
            subscriptions: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Server-assigned device index, stable for the connection.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Factory name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// User-assigned display name, when configured.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Minimum milliseconds the device wants between commands.
    pub fn message_timing_gap(&self) -> u32 {
        self.message_timing_gap
    }

    /// Declared scalar actuators, in command-index order.
    pub fn scalar_actuators(&self) -> &[ActuatorAttribute] {
        &self.scalar_actuators
    }

    /// Declared rotating actuators, in command-index order.
    pub fn rotate_actuators(&self) -> &[ActuatorAttribute] {
        &self.rotate_actuators
    }

    /// Declared linear actuators, in command-index order.
    pub fn linear_actuators(&self) -> &[ActuatorAttribute] {
        &self.linear_actuators
    }

    /// Declared readable sensors, in command-index order.
    pub fn read_sensors(&self) -> &[SensorAttribute] {
        &self.read_sensors
    }

    /// Declared subscribable sensors, in command-index order.
    pub fn subscribe_sensors(&self) -> &[SensorAttribute] {
        &self.subscribe_sensors
    }

    /// Whether the device accepts a single-device halt.
    pub fn supports_stop(&self) -> bool {
        self.supports_stop
    }

    /// Whether the handle is still linked to a live connection.
    pub fn is_attached(&self) -> bool {
        self.link.lock().unwrap().is_some()
    }

    /// Drive one scalar actuator to `scalar` in `[0.0, 1.0]`.
    pub async fn scalar(
        &self,
        actuator_index: u32,
        scalar: f64,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let actuator = self.scalar_actuator(actuator_index)?;
        self.scalar_entries(
            vec![ScalarCommand {
                index: actuator_index,
                scalar,
                actuator_type: actuator.actuator_type,
            }],
            cancel,
        )
        .await
    }

    /// Drive every scalar actuator to the same value.
    pub async fn scalar_all(
        &self,
        scalar: f64,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let entries = self
            .scalar_actuators
            .iter()
            .enumerate()
            .map(|(index, actuator)| ScalarCommand {
                index: index as u32,
                scalar,
                actuator_type: actuator.actuator_type,
            })
            .collect();
        self.scalar_entries(entries, cancel).await
    }

    async fn scalar_entries(
        &self,
        scalars: Vec<ScalarCommand>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let connector = self.connector()?;
        connector
            .send_expecting::<OkMessage>(
                Message::ScalarCmd(ScalarCmd {
                    id: connector.next_id(),
                    device_index: self.index,
                    scalars,
                }),
                cancel,
            )
            .await?;
        Ok(())
    }

    /// Spin one rotating actuator at `speed` in `[0.0, 1.0]`.
    pub async fn rotate(
        &self,
        actuator_index: u32,
        speed: f64,
        clockwise: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        if self.rotate_actuators.get(actuator_index as usize).is_none() {
            return Err(ClientError::UnknownActuator {
                device_index: self.index,
                actuator_index,
            });
        }
        self.rotate_entries(
            vec![RotateCommand {
                index: actuator_index,
                speed,
                clockwise,
            }],
            cancel,
        )
        .await
    }

    /// Spin every rotating actuator at the same speed and direction.
    pub async fn rotate_all(
        &self,
        speed: f64,
        clockwise: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let entries = (0..self.rotate_actuators.len() as u32)
            .map(|index| RotateCommand {
                index,
                speed,
                clockwise,
            })
            .collect();
        self.rotate_entries(entries, cancel).await
    }

    async fn rotate_entries(
        &self,
        rotations: Vec<RotateCommand>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let connector = self.connector()?;
        connector
            .send_expecting::<OkMessage>(
                Message::RotateCmd(RotateCmd {
                    id: connector.next_id(),
                    device_index: self.index,
                    rotations,
                }),
                cancel,
            )
            .await?;
        Ok(())
    }

    /// Move one linear actuator to `position` in `[0.0, 1.0]` over
    /// `duration` milliseconds.
    pub async fn linear(
        &self,
        actuator_index: u32,
        duration: u32,
        position: f64,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        if self.linear_actuators.get(actuator_index as usize).is_none() {
            return Err(ClientError::UnknownActuator {
                device_index: self.index,
                actuator_index,
            });
        }
        self.linear_entries(
            vec![LinearCommand {
                index: actuator_index,
                duration,
                position,
            }],
            cancel,
        )
        .await
    }

    /// Move every linear actuator to the same position over the same
    /// duration.
    pub async fn linear_all(
        &self,
        duration: u32,
        position: f64,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let entries = (0..self.linear_actuators.len() as u32)
            .map(|index| LinearCommand {
                index,
                duration,
                position,
            })
            .collect();
        self.linear_entries(entries, cancel).await
    }

    async fn linear_entries(
        &self,
        vectors: Vec<LinearCommand>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let connector = self.connector()?;
        connector
            .send_expecting::<OkMessage>(
                Message::LinearCmd(LinearCmd {
                    id: connector.next_id(),
                    device_index: self.index,
                    vectors,
                }),
                cancel,
            )
            .await?;
        Ok(())
    }

    /// Halt this device.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let connector = self.connector()?;
        connector
            .send_expecting::<OkMessage>(
                Message::StopDeviceCmd(StopDeviceCmd {
                    id: connector.next_id(),
                    device_index: self.index,
                }),
                cancel,
            )
            .await?;
        Ok(())
    }

    /// Read one sensor and return its channel values.
    pub async fn read_sensor(
        &self,
        sensor_index: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<i32>, ClientError> {
        let sensor = self.read_sensor_attr(sensor_index)?;
        let sensor_type = sensor.sensor_type;
        let connector = self.connector()?;
        let reading = connector
            .send_expecting::<SensorReading>(
                Message::SensorReadCmd(SensorReadCmd {
                    id: connector.next_id(),
                    device_index: self.index,
                    sensor_index,
                    sensor_type,
                }),
                cancel,
            )
            .await?;
        Ok(reading.data)
    }

    /// Subscribe to a sensor's unsolicited readings.
    ///
    /// The returned stream ends when the subscription is cancelled, the
    /// device is removed, or the session disconnects. One live subscription
    /// per sensor; a second attempt fails with
    /// [`ClientError::AlreadySubscribed`].
    pub async fn subscribe_sensor(
        &self,
        sensor_index: u32,
        cancel: &CancellationToken,
    ) -> Result<SensorSubscription, ClientError> {
        let sensor = self.subscribe_sensor_attr(sensor_index)?;
        let key = SensorKey {
            sensor_index,
            sensor_type: sensor.sensor_type,
        };

        // Claim the slot before touching the wire so concurrent subscribers
        // to the same sensor cannot both succeed.
        let rx = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            if subscriptions.contains_key(&key) {
                return Err(ClientError::AlreadySubscribed);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            subscriptions.insert(key, tx);
            rx
        };

        let connector = self.connector()?;
        let result = connector
            .send_expecting::<OkMessage>(
                Message::SensorSubscribeCmd(SensorSubscribeCmd {
                    id: connector.next_id(),
                    device_index: self.index,
                    sensor_index,
                    sensor_type: key.sensor_type,
                }),
                cancel,
            )
            .await;
        if let Err(error) = result {
            self.subscriptions.lock().unwrap().remove(&key);
            return Err(error);
        }

        Ok(SensorSubscription {
            device: self.weak_self.clone(),
            key,
            readings: rx,
        })
    }

    /// Cancel a sensor subscription. A sensor that is not subscribed is
    /// left alone.
    pub async fn unsubscribe_sensor(
        &self,
        sensor_index: u32,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let sensor = self.subscribe_sensor_attr(sensor_index)?;
        let key = SensorKey {
            sensor_index,
            sensor_type: sensor.sensor_type,
        };
        if self.subscriptions.lock().unwrap().remove(&key).is_none() {
            return Ok(());
        }

        let connector = self.connector()?;
        connector
            .send_expecting::<OkMessage>(
                Message::SensorUnsubscribeCmd(SensorUnsubscribeCmd {
                    id: connector.next_id(),
                    device_index: self.index,
                    sensor_index,
                    sensor_type: key.sensor_type,
                }),
                cancel,
            )
            .await?;
        Ok(())
    }

    /// Route an unsolicited reading to its subscription stream.
    ///
    /// A reading for a sensor nobody subscribed is a protocol violation.
    pub(crate) fn deliver_reading(&self, reading: SensorReading) -> Result<(), ClientError> {
        let key = SensorKey {
            sensor_index: reading.sensor_index,
            sensor_type: reading.sensor_type,
        };
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let Some(tx) = subscriptions.get(&key) else {
            return Err(ClientError::Protocol(format!(
                "reading for unsubscribed sensor {} ({:?}) on device {}",
                reading.sensor_index, reading.sensor_type, reading.device_index
            )));
        };
        // A dead receiver means the subscription handle was dropped without
        // unsubscribing; retire the entry and keep the connection alive.
        if tx.send(reading.data).is_err() {
            subscriptions.remove(&key);
        }
        Ok(())
    }

    /// Sever the handle from the connection and end every subscription
    /// stream.
    pub(crate) fn detach(&self) {
        *self.link.lock().unwrap() = None;
        self.subscriptions.lock().unwrap().clear();
    }

    fn connector(&self) -> Result<Arc<Connector>, ClientError> {
        self.link
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    fn scalar_actuator(&self, actuator_index: u32) -> Result<&ActuatorAttribute, ClientError> {
        self.scalar_actuators
            .get(actuator_index as usize)
            .ok_or(ClientError::UnknownActuator {
                device_index: self.index,
                actuator_index,
            })
    }

    fn read_sensor_attr(&self, sensor_index: u32) -> Result<&SensorAttribute, ClientError> {
        self.read_sensors
            .get(sensor_index as usize)
            .ok_or(ClientError::UnknownSensor {
                device_index: self.index,
                sensor_index,
            })
    }

    fn subscribe_sensor_attr(&self, sensor_index: u32) -> Result<&SensorAttribute, ClientError> {
        self.subscribe_sensors
            .get(sensor_index as usize)
            .ok_or(ClientError::UnknownSensor {
                device_index: self.index,
                sensor_index,
            })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Live stream of readings for one subscribed sensor.
///
/// Dropping the handle stops delivery locally without telling the server;
/// call [`SensorSubscription::unsubscribe`] to cancel it on the wire too.
#[derive(Debug)]
pub struct SensorSubscription {
    device: Weak<Device>,
    key: SensorKey,
    readings: mpsc::UnboundedReceiver<Vec<i32>>,
}

impl SensorSubscription {
    /// Sensor index this subscription follows.
    pub fn sensor_index(&self) -> u32 {
        self.key.sensor_index
    }

    /// Sensor kind this subscription follows.
    pub fn sensor_type(&self) -> SensorType {
        self.key.sensor_type
    }

    /// Next reading, or `None` once the subscription has ended.
    pub async fn next_reading(&mut self) -> Option<Vec<i32>> {
        self.readings.recv().await
    }

    /// Cancel the subscription on the server and end the stream.
    pub async fn unsubscribe(mut self, cancel: &CancellationToken) -> Result<(), ClientError> {
        self.readings.close();
        match self.device.upgrade() {
            Some(device) => device.unsubscribe_sensor(self.key.sensor_index, cancel).await,
            // Device already gone; there is nothing left to cancel.
            None => Ok(()),
        }
    }
}

impl Drop for SensorSubscription {
    fn drop(&mut self) {
        // Close before the field itself drops so the sender observes it.
        self.readings.close();
        if let Some(device) = self.device.upgrade() {
            let mut subscriptions = device.subscriptions.lock().unwrap();
            // Only retire the entry if it is still ours; unsubscribe_sensor
            // may have removed it already.
            if subscriptions.get(&self.key).is_some_and(|tx| tx.is_closed()) {
                subscriptions.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ActuatorType, DeviceAttributes, VoidAttribute};

    fn capable_info() -> DeviceInfo {
        DeviceInfo {
            device_index: 1,
            device_name: "Test Device".to_string(),
            device_display_name: Some("Nightstand".to_string()),
            device_message_timing_gap: 20,
            device_messages: DeviceAttributes {
                scalar_cmd: vec![
                    ActuatorAttribute {
                        feature_descriptor: "Main".to_string(),
                        actuator_type: ActuatorType::Vibrate,
                        step_count: 20,
                    },
                    ActuatorAttribute {
                        feature_descriptor: "Tip".to_string(),
                        actuator_type: ActuatorType::Oscillate,
                        step_count: 10,
                    },
                ],
                sensor_read_cmd: vec![SensorAttribute {
                    feature_descriptor: "Battery".to_string(),
                    sensor_type: SensorType::Battery,
                    sensor_range: vec![vec![0, 100]],
                }],
                stop_device_cmd: Some(VoidAttribute {}),
                ..DeviceAttributes::default()
            },
        }
    }

    // Constructing a Connector requires a live transport; unit tests here
    // cover the capability snapshot and detach behavior, and the command
    // paths are exercised end to end in tests/session.rs.

    fn detached_device() -> Arc<Device> {
        let info = capable_info();
        Arc::new_cyclic(|weak_self| Device {
            index: info.device_index,
            name: info.device_name,
            display_name: info.device_display_name,
            message_timing_gap: info.device_message_timing_gap,
            scalar_actuators: info.device_messages.scalar_cmd,
            rotate_actuators: info.device_messages.rotate_cmd,
            linear_actuators: info.device_messages.linear_cmd,
            read_sensors: info.device_messages.sensor_read_cmd,
            subscribe_sensors: info.device_messages.sensor_subscribe_cmd,
            supports_stop: info.device_messages.stop_device_cmd.is_some(),
            link: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    #[test]
    fn test_capability_snapshot() {
        let device = detached_device();
        assert_eq!(device.index(), 1);
        assert_eq!(device.name(), "Test Device");
        assert_eq!(device.display_name(), Some("Nightstand"));
        assert_eq!(device.message_timing_gap(), 20);
        assert_eq!(device.scalar_actuators().len(), 2);
        assert_eq!(
            device.scalar_actuators()[1].actuator_type,
            ActuatorType::Oscillate
        );
        assert!(device.rotate_actuators().is_empty());
        assert!(device.supports_stop());
        assert!(!device.is_attached());
    }

    #[tokio::test]
    async fn test_detached_commands_fail() {
        let device = detached_device();
        let cancel = CancellationToken::new();
        assert!(matches!(
            device.scalar(0, 0.5, &cancel).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            device.stop(&cancel).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            device.read_sensor(0, &cancel).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unknown_feature_indexes_are_refused_before_the_wire() {
        let device = detached_device();
        let cancel = CancellationToken::new();
        // Capability checks run before the link check, so even a detached
        // handle reports the out-of-range index.
        assert!(matches!(
            device.scalar(5, 0.5, &cancel).await,
            Err(ClientError::UnknownActuator {
                device_index: 1,
                actuator_index: 5
            })
        ));
        assert!(matches!(
            device.rotate(0, 0.5, true, &cancel).await,
            Err(ClientError::UnknownActuator { .. })
        ));
        assert!(matches!(
            device.read_sensor(3, &cancel).await,
            Err(ClientError::UnknownSensor {
                device_index: 1,
                sensor_index: 3
            })
        ));
        assert!(matches!(
            device.subscribe_sensor(0, &cancel).await,
            Err(ClientError::UnknownSensor { .. })
        ));
    }

    #[test]
    fn test_reading_without_subscription_is_a_protocol_violation() {
        let device = detached_device();
        let reading = SensorReading {
            id: 0,
            device_index: 1,
            sensor_index: 0,
            sensor_type: SensorType::Battery,
            data: vec![80],
        };
        assert!(matches!(
            device.deliver_reading(reading),
            Err(ClientError::Protocol(_))
        ));
    }
}
