//! The device-control message catalog.
//!
//! Every message kind the protocol knows is a struct here, wrapped by the
//! [`Message`] enum. The enum uses serde's externally tagged representation,
//! so one message serializes as `{"TypeName": { ...fields }}`: the variant
//! name is the registered wire name in both directions, fixed at compile
//! time. An unknown name on the wire is a deserialization error.
//!
//! Correlation ids are `u64`. Id `0` is reserved for unsolicited server
//! notifications and is never issued for outgoing requests.

use serde::{Deserialize, Serialize};

/// Protocol version this client speaks and requires from the server.
pub const PROTOCOL_VERSION: u32 = 3;

/// Error classes the server can report in an [`ErrorMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unclassified failure.
    #[serde(rename = "ERROR_UNKNOWN")]
    Unknown,
    /// Handshake or initialization failure.
    #[serde(rename = "ERROR_INIT")]
    Init,
    /// The server gave up waiting for a keepalive ping.
    #[serde(rename = "ERROR_PING")]
    Ping,
    /// The request message was invalid.
    #[serde(rename = "ERROR_MSG")]
    Message,
    /// A device-level failure.
    #[serde(rename = "ERROR_DEVICE")]
    Device,
}

/// Kinds of actuators a device can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorType {
    /// Placeholder for an unrecognized actuator kind.
    Unknown,
    /// Vibration motor.
    Vibrate,
    /// Rotating motor.
    Rotate,
    /// Oscillating motor.
    Oscillate,
    /// Constriction mechanism.
    Constrict,
    /// Inflation mechanism.
    Inflate,
    /// Linear positioning axis.
    Position,
}

/// Kinds of sensors a device can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    /// Placeholder for an unrecognized sensor kind.
    Unknown,
    /// Battery level.
    Battery,
    /// Radio signal strength.
    #[serde(rename = "RSSI")]
    Rssi,
    /// Physical button state.
    Button,
    /// Pressure reading.
    Pressure,
}

/// One actuator declaration inside a device's attribute block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActuatorAttribute {
    /// Server-supplied description of the feature.
    #[serde(default)]
    pub feature_descriptor: String,
    /// What kind of actuator this is.
    pub actuator_type: ActuatorType,
    /// Number of discrete steps the actuator resolves.
    #[serde(default)]
    pub step_count: u32,
}

/// One sensor declaration inside a device's attribute block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorAttribute {
    /// Server-supplied description of the feature.
    #[serde(default)]
    pub feature_descriptor: String,
    /// What kind of sensor this is.
    pub sensor_type: SensorType,
    /// Value range per reading channel.
    #[serde(default)]
    pub sensor_range: Vec<Vec<u32>>,
}

/// Raw endpoint declaration. Parsed but not driven by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawAttribute {
    /// Endpoint names the device exposes.
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Marker attribute for commands that carry no parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidAttribute {}

/// The full capability block of one device, keyed by command name.
///
/// The wire format does not (yet) echo a per-attribute index; consumers
/// assign indexes by declaration order. See
/// [`Device`](crate::client::Device).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceAttributes {
    /// Actuators driven through `ScalarCmd`.
    #[serde(default)]
    pub scalar_cmd: Vec<ActuatorAttribute>,
    /// Actuators driven through `RotateCmd`.
    #[serde(default)]
    pub rotate_cmd: Vec<ActuatorAttribute>,
    /// Actuators driven through `LinearCmd`.
    #[serde(default)]
    pub linear_cmd: Vec<ActuatorAttribute>,
    /// Sensors readable through `SensorReadCmd`.
    #[serde(default)]
    pub sensor_read_cmd: Vec<SensorAttribute>,
    /// Sensors subscribable through `SensorSubscribeCmd`.
    #[serde(default)]
    pub sensor_subscribe_cmd: Vec<SensorAttribute>,
    /// Raw read endpoints.
    #[serde(default)]
    pub raw_read_cmd: Vec<RawAttribute>,
    /// Raw write endpoints.
    #[serde(default)]
    pub raw_write_cmd: Vec<RawAttribute>,
    /// Raw subscribe endpoints.
    #[serde(default)]
    pub raw_subscribe_cmd: Vec<RawAttribute>,
    /// Present when the device supports `StopDeviceCmd`.
    #[serde(default)]
    pub stop_device_cmd: Option<VoidAttribute>,
}

/// Identity and capabilities of one device, as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfo {
    /// Server-assigned device index, stable for the connection.
    pub device_index: u32,
    /// Factory name of the device.
    pub device_name: String,
    /// User-assigned display name, when configured.
    #[serde(default)]
    pub device_display_name: Option<String>,
    /// Minimum milliseconds the device wants between commands.
    #[serde(default)]
    pub device_message_timing_gap: u32,
    /// Capability block.
    #[serde(default)]
    pub device_messages: DeviceAttributes,
}

/// One scalar actuator command entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalarCommand {
    /// Actuator index within the device's scalar actuators.
    pub index: u32,
    /// Target intensity in `[0.0, 1.0]`.
    pub scalar: f64,
    /// Actuator kind being addressed.
    pub actuator_type: ActuatorType,
}

/// One rotation actuator command entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RotateCommand {
    /// Actuator index within the device's rotators.
    pub index: u32,
    /// Rotation speed in `[0.0, 1.0]`.
    pub speed: f64,
    /// Rotation direction.
    pub clockwise: bool,
}

/// One linear actuator command entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinearCommand {
    /// Actuator index within the device's linear actuators.
    pub index: u32,
    /// Milliseconds the movement should take.
    pub duration: u32,
    /// Target position in `[0.0, 1.0]`.
    pub position: f64,
}

/// Generic acknowledgement reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OkMessage {
    /// Correlation id of the request being acknowledged.
    pub id: u64,
}

/// Server-reported failure, either as a reply or unsolicited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorMessage {
    /// Correlation id of the failed request, or 0 for connection-scoped errors.
    #[serde(default)]
    pub id: u64,
    /// Human-readable description.
    #[serde(default)]
    pub error_message: String,
    /// Error class.
    pub error_code: ErrorCode,
}

/// Keepalive request; the server must acknowledge with `Ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ping {
    /// Correlation id.
    pub id: u64,
}

/// Handshake request carrying the client identity and protocol version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestServerInfo {
    /// Correlation id.
    pub id: u64,
    /// Name this client identifies itself with.
    pub client_name: String,
    /// Protocol version the client speaks.
    pub message_version: u32,
}

/// Handshake reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerInfo {
    /// Correlation id of the handshake request.
    pub id: u64,
    /// Protocol version the server speaks.
    pub message_version: u32,
    /// Maximum idle interval in milliseconds; 0 disables keepalive.
    #[serde(default)]
    pub max_ping_time: u64,
    /// Name the server identifies itself with.
    #[serde(default)]
    pub server_name: String,
}

/// Request for the current device inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestDeviceList {
    /// Correlation id.
    pub id: u64,
}

/// Inventory reply listing every currently connected device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceList {
    /// Correlation id of the inventory request.
    pub id: u64,
    /// Connected devices.
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

/// Ask the server to start scanning for devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartScanning {
    /// Correlation id.
    pub id: u64,
}

/// Ask the server to stop scanning for devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopScanning {
    /// Correlation id.
    pub id: u64,
}

/// Unsolicited notification that a scan has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScanningFinished {
    /// Always 0.
    #[serde(default)]
    pub id: u64,
}

/// Ask the server to halt every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopAllDevices {
    /// Correlation id.
    pub id: u64,
}

/// Unsolicited notification that a device was attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceAdded {
    /// Always 0.
    #[serde(default)]
    pub id: u64,
    /// Identity and capabilities of the new device.
    #[serde(flatten)]
    pub device: DeviceInfo,
}

/// Unsolicited notification that a device was detached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRemoved {
    /// Always 0.
    #[serde(default)]
    pub id: u64,
    /// Index of the removed device.
    pub device_index: u32,
}

/// Drive one or more scalar actuators on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalarCmd {
    /// Correlation id.
    pub id: u64,
    /// Target device.
    pub device_index: u32,
    /// Per-actuator command entries.
    pub scalars: Vec<ScalarCommand>,
}

/// Drive one or more rotating actuators on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RotateCmd {
    /// Correlation id.
    pub id: u64,
    /// Target device.
    pub device_index: u32,
    /// Per-actuator command entries.
    pub rotations: Vec<RotateCommand>,
}

/// Drive one or more linear actuators on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinearCmd {
    /// Correlation id.
    pub id: u64,
    /// Target device.
    pub device_index: u32,
    /// Per-actuator command entries.
    pub vectors: Vec<LinearCommand>,
}

/// Halt a single device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopDeviceCmd {
    /// Correlation id.
    pub id: u64,
    /// Target device.
    pub device_index: u32,
}

/// Read a sensor once; replied to with [`SensorReading`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorReadCmd {
    /// Correlation id.
    pub id: u64,
    /// Target device.
    pub device_index: u32,
    /// Sensor index within the device's readable sensors.
    pub sensor_index: u32,
    /// Sensor kind being addressed.
    pub sensor_type: SensorType,
}

/// Subscribe to a sensor's unsolicited readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorSubscribeCmd {
    /// Correlation id.
    pub id: u64,
    /// Target device.
    pub device_index: u32,
    /// Sensor index within the device's subscribable sensors.
    pub sensor_index: u32,
    /// Sensor kind being addressed.
    pub sensor_type: SensorType,
}

/// Cancel a sensor subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorUnsubscribeCmd {
    /// Correlation id.
    pub id: u64,
    /// Target device.
    pub device_index: u32,
    /// Sensor index within the device's subscribable sensors.
    pub sensor_index: u32,
    /// Sensor kind being addressed.
    pub sensor_type: SensorType,
}

/// Sensor data, either as a reply to [`SensorReadCmd`] (nonzero id) or
/// unsolicited for an active subscription (id 0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorReading {
    /// Correlation id, or 0 for subscription data.
    #[serde(default)]
    pub id: u64,
    /// Originating device.
    pub device_index: u32,
    /// Originating sensor index.
    pub sensor_index: u32,
    /// Originating sensor kind.
    pub sensor_type: SensorType,
    /// Reading values, one per sensor channel.
    #[serde(default)]
    pub data: Vec<i32>,
}

/// The closed set of protocol messages.
///
/// Serializes as `{"<VariantName>": { ...fields }}`, matching the wire
/// envelope exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Generic acknowledgement.
    Ok(OkMessage),
    /// Server-reported failure.
    Error(ErrorMessage),
    /// Keepalive request.
    Ping(Ping),
    /// Handshake request.
    RequestServerInfo(RequestServerInfo),
    /// Handshake reply.
    ServerInfo(ServerInfo),
    /// Inventory request.
    RequestDeviceList(RequestDeviceList),
    /// Inventory reply.
    DeviceList(DeviceList),
    /// Begin device scanning.
    StartScanning(StartScanning),
    /// End device scanning.
    StopScanning(StopScanning),
    /// Scan-complete notification.
    ScanningFinished(ScanningFinished),
    /// Halt every device.
    StopAllDevices(StopAllDevices),
    /// Device-attached notification.
    DeviceAdded(DeviceAdded),
    /// Device-detached notification.
    DeviceRemoved(DeviceRemoved),
    /// Scalar actuator command.
    ScalarCmd(ScalarCmd),
    /// Rotation actuator command.
    RotateCmd(RotateCmd),
    /// Linear actuator command.
    LinearCmd(LinearCmd),
    /// Single-device halt command.
    StopDeviceCmd(StopDeviceCmd),
    /// One-shot sensor read.
    SensorReadCmd(SensorReadCmd),
    /// Sensor subscription request.
    SensorSubscribeCmd(SensorSubscribeCmd),
    /// Sensor unsubscription request.
    SensorUnsubscribeCmd(SensorUnsubscribeCmd),
    /// Sensor data.
    SensorReading(SensorReading),
}

impl Message {
    /// Correlation id carried by this message. 0 marks an unsolicited
    /// notification.
    pub fn id(&self) -> u64 {
        match self {
            Message::Ok(m) => m.id,
            Message::Error(m) => m.id,
            Message::Ping(m) => m.id,
            Message::RequestServerInfo(m) => m.id,
            Message::ServerInfo(m) => m.id,
            Message::RequestDeviceList(m) => m.id,
            Message::DeviceList(m) => m.id,
            Message::StartScanning(m) => m.id,
            Message::StopScanning(m) => m.id,
            Message::ScanningFinished(m) => m.id,
            Message::StopAllDevices(m) => m.id,
            Message::DeviceAdded(m) => m.id,
            Message::DeviceRemoved(m) => m.id,
            Message::ScalarCmd(m) => m.id,
            Message::RotateCmd(m) => m.id,
            Message::LinearCmd(m) => m.id,
            Message::StopDeviceCmd(m) => m.id,
            Message::SensorReadCmd(m) => m.id,
            Message::SensorSubscribeCmd(m) => m.id,
            Message::SensorUnsubscribeCmd(m) => m.id,
            Message::SensorReading(m) => m.id,
        }
    }

    /// Registered wire name of this message kind.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Ok(_) => "Ok",
            Message::Error(_) => "Error",
            Message::Ping(_) => "Ping",
            Message::RequestServerInfo(_) => "RequestServerInfo",
            Message::ServerInfo(_) => "ServerInfo",
            Message::RequestDeviceList(_) => "RequestDeviceList",
            Message::DeviceList(_) => "DeviceList",
            Message::StartScanning(_) => "StartScanning",
            Message::StopScanning(_) => "StopScanning",
            Message::ScanningFinished(_) => "ScanningFinished",
            Message::StopAllDevices(_) => "StopAllDevices",
            Message::DeviceAdded(_) => "DeviceAdded",
            Message::DeviceRemoved(_) => "DeviceRemoved",
            Message::ScalarCmd(_) => "ScalarCmd",
            Message::RotateCmd(_) => "RotateCmd",
            Message::LinearCmd(_) => "LinearCmd",
            Message::StopDeviceCmd(_) => "StopDeviceCmd",
            Message::SensorReadCmd(_) => "SensorReadCmd",
            Message::SensorSubscribeCmd(_) => "SensorSubscribeCmd",
            Message::SensorUnsubscribeCmd(_) => "SensorUnsubscribeCmd",
            Message::SensorReading(_) => "SensorReading",
        }
    }

    /// Whether this is an unsolicited notification rather than a reply.
    pub fn is_notification(&self) -> bool {
        self.id() == 0
    }
}

/// A message kind that can be statically expected as the reply to a request.
///
/// `from_message` returns the original message on mismatch so the caller can
/// report what actually arrived.
pub trait Reply: Sized {
    /// Extract this kind from a catalog message, or give the message back.
    fn from_message(message: Message) -> Result<Self, Message>;
}

impl Reply for OkMessage {
    fn from_message(message: Message) -> Result<Self, Message> {
        match message {
            Message::Ok(m) => Ok(m),
            other => Err(other),
        }
    }
}

impl Reply for ServerInfo {
    fn from_message(message: Message) -> Result<Self, Message> {
        match message {
            Message::ServerInfo(m) => Ok(m),
            other => Err(other),
        }
    }
}

impl Reply for DeviceList {
    fn from_message(message: Message) -> Result<Self, Message> {
        match message {
            Message::DeviceList(m) => Ok(m),
            other => Err(other),
        }
    }
}

impl Reply for SensorReading {
    fn from_message(message: Message) -> Result<Self, Message> {
        match message {
            Message::SensorReading(m) => Ok(m),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_lookup() {
        let message = Message::Ok(OkMessage { id: 7 });
        assert_eq!(message.id(), 7);
        assert!(!message.is_notification());

        let message = Message::ScanningFinished(ScanningFinished { id: 0 });
        assert_eq!(message.id(), 0);
        assert!(message.is_notification());
    }

    #[test]
    fn test_wire_name_matches_variant() {
        let message = Message::RequestServerInfo(RequestServerInfo {
            id: 1,
            client_name: "test".to_string(),
            message_version: PROTOCOL_VERSION,
        });
        assert_eq!(message.name(), "RequestServerInfo");
    }

    #[test]
    fn test_reply_extraction_mismatch_returns_original() {
        let message = Message::Ping(Ping { id: 3 });
        let err = OkMessage::from_message(message).unwrap_err();
        assert_eq!(err.name(), "Ping");
        assert_eq!(err.id(), 3);
    }

    #[test]
    fn test_error_code_spelling() {
        let json = serde_json::to_string(&ErrorCode::Ping).unwrap();
        assert_eq!(json, "\"ERROR_PING\"");
        let code: ErrorCode = serde_json::from_str("\"ERROR_DEVICE\"").unwrap();
        assert_eq!(code, ErrorCode::Device);
    }
}
