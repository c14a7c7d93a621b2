//! Error types for the perilink client engine.

use thiserror::Error;

use crate::message::ErrorCode;

/// Errors surfaced by the client session, connector, and correlation table.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Underlying socket transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The server answered a request with its error-kind message.
    #[error("server error ({code:?}): {message}")]
    Server {
        /// Error class reported by the server.
        code: ErrorCode,
        /// Human-readable description from the server.
        message: String,
    },

    /// The peer violated the protocol contract.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A request was registered with an id that is already pending.
    #[error("duplicate pending request id {0}")]
    DuplicateRequestId(u64),

    /// The peer replied to a request id that is not pending.
    #[error("no pending request with id {0}")]
    UnknownRequestId(u64),

    /// A request resolved with a reply of a different kind than expected.
    #[error("unexpected reply {name} (id {id})")]
    UnexpectedReply {
        /// Wire name of the reply that arrived.
        name: &'static str,
        /// Correlation id it carried.
        id: u64,
    },

    /// The server speaks an older protocol version than this client requires.
    #[error("incompatible server protocol version {server} (requires at least {required})")]
    IncompatibleServer {
        /// Version advertised by the server.
        server: u32,
        /// Minimum version this client accepts.
        required: u32,
    },

    /// A keepalive ping was not acknowledged within the idle window.
    #[error("keepalive ping timed out")]
    PingTimeout,

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The session or connector is not connected.
    #[error("not connected")]
    NotConnected,

    /// A connect attempt was made while a connection is already active.
    #[error("already connected")]
    AlreadyConnected,

    /// A command addressed an actuator index the device does not declare.
    #[error("device {device_index} has no such actuator at index {actuator_index}")]
    UnknownActuator {
        /// Index of the addressed device.
        device_index: u32,
        /// Actuator index that is out of range for the command kind.
        actuator_index: u32,
    },

    /// A command addressed a sensor index the device does not declare.
    #[error("device {device_index} has no such sensor at index {sensor_index}")]
    UnknownSensor {
        /// Index of the addressed device.
        device_index: u32,
        /// Sensor index that is out of range for the command kind.
        sensor_index: u32,
    },

    /// A sensor subscription already exists for this sensor.
    #[error("sensor is already subscribed")]
    AlreadySubscribed,

    /// The connection ended without an explicit fault.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Errors produced by a [`Transport`](crate::transport::Transport)
/// implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
}

/// Errors produced while encoding or decoding message envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame was not the expected outer JSON shape.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// One envelope inside the frame was malformed.
    #[error("malformed envelope: {0}")]
    Envelope(String),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
