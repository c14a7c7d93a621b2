//! Websocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;
use crate::transport::{Transport, TransportReader, TransportWriter};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Websocket implementation of [`Transport`].
///
/// Frames map to websocket text messages. Tungstenite reassembles
/// fragmented messages, so [`WebSocketReader::receive`] always yields one
/// complete frame.
pub struct WebSocketTransport;

/// Writing half of a websocket connection.
pub struct WebSocketWriter {
    sink: SplitSink<WsStream, WsMessage>,
}

/// Reading half of a websocket connection.
pub struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    type Reader = WebSocketReader;
    type Writer = WebSocketWriter;

    async fn connect(uri: &str) -> Result<(Self::Writer, Self::Reader), TransportError> {
        let (stream, _response) = connect_async(uri)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (sink, stream) = stream.split();
        Ok((WebSocketWriter { sink }, WebSocketReader { stream }))
    }
}

#[async_trait]
impl TransportWriter for WebSocketWriter {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Errors here usually mean the peer is already gone.
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl TransportReader for WebSocketReader {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(text)),
                Some(Ok(WsMessage::Binary(bytes))) => {
                    let text = String::from_utf8(bytes).map_err(|e| {
                        TransportError::ReceiveFailed(format!("binary frame is not UTF-8: {e}"))
                    })?;
                    return Ok(Some(text));
                }
                // Control frames are handled by tungstenite; skip them.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }
}
