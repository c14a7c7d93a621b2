//! Envelope (de)serialization for the wire protocol.
//!
//! A frame is a JSON array; each element is an object with exactly one
//! property whose key is a registered message name and whose value is the
//! message's field object:
//!
//! ```text
//! [{"Ok":{"Id":7}}]
//! [{"Ok":{"Id":0}},{"DeviceRemoved":{"Id":0,"DeviceIndex":2}}]
//! ```
//!
//! Decoding is strict per element: zero properties, a non-object payload, or
//! an unregistered name fails the whole frame with a [`CodecError`]. The
//! connector treats that as a tolerated per-frame failure (reported, read
//! loop continues), not a connection fault.

use serde_json::Value;

use crate::error::CodecError;
use crate::message::Message;

/// Serialize a batch of messages into one wire frame.
pub fn encode(messages: &[Message]) -> Result<String, CodecError> {
    Ok(serde_json::to_string(messages)?)
}

/// Deserialize one wire frame into its messages, preserving order.
pub fn decode(frame: &str) -> Result<Vec<Message>, CodecError> {
    let value: Value = serde_json::from_str(frame)?;
    let Value::Array(elements) = value else {
        return Err(CodecError::InvalidFrame(format!(
            "expected a JSON array, got {}",
            json_kind(&value)
        )));
    };

    let mut messages = Vec::with_capacity(elements.len());
    for element in elements {
        let Value::Object(envelope) = &element else {
            return Err(CodecError::Envelope(format!(
                "expected an object, got {}",
                json_kind(&element)
            )));
        };
        let mut properties = envelope.iter();
        let Some((name, payload)) = properties.next() else {
            return Err(CodecError::Envelope("object has no properties".to_string()));
        };
        if properties.next().is_some() {
            return Err(CodecError::Envelope(format!(
                "object has more than one property (first: \"{name}\")"
            )));
        }
        if !payload.is_object() {
            return Err(CodecError::Envelope(format!(
                "payload of \"{name}\" is {}, not an object",
                json_kind(payload)
            )));
        }
        let name = name.clone();

        // Unknown names surface here as serde's unknown-variant error.
        let message: Message = serde_json::from_value(element)
            .map_err(|e| CodecError::Envelope(format!("\"{name}\": {e}")))?;
        messages.push(message);
    }

    Ok(messages)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorCode, OkMessage, Ping, RequestServerInfo, PROTOCOL_VERSION};

    #[test]
    fn test_decode_single_message() {
        let messages = decode(r#"[{"Ok":{"Id":5}}]"#).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], Message::Ok(OkMessage { id: 5 }));
    }

    #[test]
    fn test_decode_preserves_order() {
        let messages = decode(r#"[{"Ok":{"Id":0}},{"Ok":{"Id":1}}]"#).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id(), 0);
        assert_eq!(messages[1].id(), 1);
    }

    #[test]
    fn test_decode_unknown_name_fails() {
        let err = decode(r#"[{"__Unknown__":{}}]"#).unwrap_err();
        assert!(matches!(err, CodecError::Envelope(_)));
    }

    #[test]
    fn test_decode_empty_object_fails() {
        let err = decode(r#"[{}]"#).unwrap_err();
        assert!(matches!(err, CodecError::Envelope(_)));
    }

    #[test]
    fn test_decode_non_object_payload_fails() {
        let err = decode(r#"[{"Ok":3}]"#).unwrap_err();
        assert!(matches!(err, CodecError::Envelope(_)));
    }

    #[test]
    fn test_decode_multiple_properties_fails() {
        let err = decode(r#"[{"Ok":{"Id":1},"Ping":{"Id":2}}]"#).unwrap_err();
        assert!(matches!(err, CodecError::Envelope(_)));
    }

    #[test]
    fn test_decode_non_array_frame_fails() {
        let err = decode(r#"{"Ok":{"Id":1}}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrame(_)));
    }

    #[test]
    fn test_encode_handshake_shape() {
        let frame = encode(&[Message::RequestServerInfo(RequestServerInfo {
            id: 1,
            client_name: "perilink".to_string(),
            message_version: PROTOCOL_VERSION,
        })])
        .unwrap();
        assert_eq!(
            frame,
            r#"[{"RequestServerInfo":{"Id":1,"ClientName":"perilink","MessageVersion":3}}]"#
        );
    }

    #[test]
    fn test_encode_decode_enum_spelling() {
        let frame = r#"[{"Error":{"Id":0,"ErrorMessage":"went away","ErrorCode":"ERROR_PING"}}]"#;
        let messages = decode(frame).unwrap();
        let Message::Error(error) = &messages[0] else {
            panic!("expected an Error message");
        };
        assert_eq!(error.error_code, ErrorCode::Ping);
        assert_eq!(error.error_message, "went away");
    }

    #[test]
    fn test_decode_device_list_with_sparse_attributes() {
        let frame = r#"[{"DeviceList":{"Id":2,"Devices":[
            {"DeviceIndex":0,"DeviceName":"Test Device",
             "DeviceMessages":{"ScalarCmd":[
                {"FeatureDescriptor":"Main motor","ActuatorType":"Vibrate","StepCount":20}]}}
        ]}}]"#;
        let messages = decode(frame).unwrap();
        let Message::DeviceList(list) = &messages[0] else {
            panic!("expected a DeviceList message");
        };
        assert_eq!(list.devices.len(), 1);
        let info = &list.devices[0];
        assert_eq!(info.device_name, "Test Device");
        assert_eq!(info.device_display_name, None);
        assert_eq!(info.device_message_timing_gap, 0);
        assert_eq!(info.device_messages.scalar_cmd.len(), 1);
        assert!(info.device_messages.sensor_read_cmd.is_empty());
        assert!(info.device_messages.stop_device_cmd.is_none());
    }

    #[test]
    fn test_ping_round_trips_through_value() {
        let frame = encode(&[Message::Ping(Ping { id: 9 })]).unwrap();
        assert_eq!(frame, r#"[{"Ping":{"Id":9}}]"#);
        let messages = decode(&frame).unwrap();
        assert_eq!(messages[0], Message::Ping(Ping { id: 9 }));
    }
}
