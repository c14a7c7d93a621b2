//! Connection driver: owns the transport halves and the correlation table.
//!
//! A [`Connector`] wraps one established transport connection. A single
//! spawned driver task owns both transport halves and runs the read and
//! write loops until shutdown or fault:
//!
//! ```text
//!   send() ──► outbound queue ──► write loop ──► transport writer
//!
//!   transport reader ──► read loop ──┬── id != 0 ──► correlation table
//!                                    └── id == 0 ──► inbound sink
//! ```
//!
//! Writes are serialized by the queue, so concurrent callers never
//! interleave frames. Whatever stops the driver, teardown is uniform: the
//! writer is closed, every pending request is cancelled, and the inbound
//! sink is dropped so its consumer observes the end of the stream.

mod pending;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::error::{ClientError, TransportError};
use crate::message::{Message, Reply};
use crate::transport::{Transport, TransportReader, TransportWriter};

use pending::PendingReplies;

/// One item delivered on the inbound sink.
///
/// Frames that fail to decode are reported in-band rather than killing the
/// connection; the consumer decides how loudly to complain.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// An unsolicited message (wire id 0).
    Message(Message),
    /// A frame that could not be decoded.
    Invalid(ClientError),
}

/// Handle to one live connection.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub(crate) struct Connector {
    pending: Arc<PendingReplies>,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    disconnecting: AtomicBool,
    fault: Mutex<Option<ClientError>>,
    next_id: AtomicU64,
}

impl Connector {
    /// Establish a transport connection and spawn its driver task.
    ///
    /// Returns the connector and the inbound sink carrying unsolicited
    /// messages. On connect failure nothing is left running.
    pub(crate) async fn connect<T: Transport>(
        uri: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Inbound>), ClientError> {
        let (writer, reader) = T::connect(uri).await?;

        let pending = PendingReplies::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let connector = Arc::new(Self {
            pending: Arc::clone(&pending),
            outbound: outbound_tx,
            shutdown: shutdown.clone(),
            driver: Mutex::new(None),
            disconnecting: AtomicBool::new(false),
            fault: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });

        let driver = tokio::spawn(drive(
            writer,
            reader,
            outbound_rx,
            inbound_tx,
            pending,
            shutdown,
            Arc::clone(&connector),
        ));
        *connector.driver.lock().unwrap() = Some(driver);

        Ok((connector, inbound_rx))
    }

    /// Allocate the next request id. Ids start at 1; 0 marks unsolicited
    /// messages and is never handed out.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and wait for its correlated reply.
    ///
    /// The pending entry is registered before the message is queued, so the
    /// reply cannot race past an unregistered id. Cancelling `cancel`
    /// abandons the wait; the request itself may still reach the server.
    pub(crate) async fn send(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<Message, ClientError> {
        if self.disconnecting.load(Ordering::SeqCst) || self.outbound.is_closed() {
            return Err(ClientError::NotConnected);
        }

        let handle = PendingReplies::register(&self.pending, message.id(), cancel)?;
        self.outbound
            .send(message)
            .map_err(|_| ClientError::Transport(TransportError::Closed))?;
        handle.wait().await
    }

    /// Send a request and decode the reply as `R`.
    ///
    /// An acknowledgement of the wrong kind is an [`ClientError::UnexpectedReply`]
    /// fault, not a silent coercion.
    pub(crate) async fn send_expecting<R: Reply>(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<R, ClientError> {
        let reply = self.send(message, cancel).await?;
        R::from_message(reply).map_err(|other| ClientError::UnexpectedReply {
            name: other.name(),
            id: other.id(),
        })
    }

    /// Stop the driver and cancel everything pending. Idempotent; the first
    /// caller performs the teardown and later callers return immediately.
    pub(crate) async fn disconnect(&self) {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let driver = self.driver.lock().unwrap().take();
        if let Some(driver) = driver {
            if let Err(error) = driver.await {
                tracing::warn!(?error, "connection driver panicked during shutdown");
            }
        }

        // The driver already cancelled pending entries on its way out; this
        // covers a driver that was aborted before reaching teardown.
        self.pending.cancel_all();
    }

    /// Take the fault that stopped the driver, if it stopped on one.
    pub(crate) fn take_fault(&self) -> Option<ClientError> {
        self.fault.lock().unwrap().take()
    }

    fn record_fault(&self, error: ClientError) {
        let mut fault = self.fault.lock().unwrap();
        if fault.is_none() {
            *fault = Some(error);
        }
    }
}

/// Driver task body: run both loops until one stops, then tear down.
async fn drive<W: TransportWriter, R: TransportReader>(
    mut writer: W,
    mut reader: R,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    pending: Arc<PendingReplies>,
    shutdown: CancellationToken,
    connector: Arc<Connector>,
) {
    let result = {
        let read = read_loop(&mut reader, &inbound_tx, &pending);
        let write = write_loop(&mut writer, &mut outbound_rx);
        tokio::pin!(read);
        tokio::pin!(write);
        tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            result = &mut read => result,
            result = &mut write => result,
        }
    };

    if let Err(error) = result {
        if !shutdown.is_cancelled() {
            tracing::warn!(%error, "connection driver stopped on a fault");
            connector.record_fault(error);
        }
    }

    let _ = writer.close().await;
    pending.cancel_all();
    // Dropping the inbound sender ends the consumer's stream.
    drop(inbound_tx);
}

/// Pump frames off the wire, decode them, and route each message.
///
/// Correlated replies (id != 0) resolve their pending entry; a reply to an
/// id nobody is waiting on stops the connection. Unsolicited messages and
/// undecodable frames go to the inbound sink.
async fn read_loop<R: TransportReader>(
    reader: &mut R,
    inbound_tx: &mpsc::UnboundedSender<Inbound>,
    pending: &PendingReplies,
) -> Result<(), ClientError> {
    loop {
        let frame = match reader.receive().await? {
            Some(frame) => frame,
            None => return Err(ClientError::Transport(TransportError::Closed)),
        };
        if frame.trim().is_empty() {
            continue;
        }

        let messages = match codec::decode(&frame) {
            Ok(messages) => messages,
            Err(error) => {
                tracing::debug!(%error, "discarding undecodable frame");
                let _ = inbound_tx.send(Inbound::Invalid(error.into()));
                continue;
            }
        };

        for message in messages {
            if message.is_notification() {
                let _ = inbound_tx.send(Inbound::Message(message));
            } else {
                pending.fulfill(message)?;
            }
        }
    }
}

/// Drain the outbound queue onto the wire, one frame per message.
async fn write_loop<W: TransportWriter>(
    writer: &mut W,
    outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
) -> Result<(), ClientError> {
    while let Some(message) = outbound_rx.recv().await {
        tracing::debug!(name = message.name(), id = message.id(), "sending request");
        let frame = codec::encode(&[message])?;
        writer.send(frame).await?;
    }
    // Every sender is gone; nothing left to write.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{OkMessage, Ping, SensorReading, SensorType};
    use crate::transport::{MemoryListener, MemoryTransport};

    async fn connect_pair(
        name: &str,
    ) -> (
        Arc<Connector>,
        mpsc::UnboundedReceiver<Inbound>,
        crate::transport::MemoryWriter,
        crate::transport::MemoryReader,
    ) {
        let mut listener = MemoryListener::bind(name).unwrap();
        let uri = format!("mem://{name}");
        let (connect, accept) =
            tokio::join!(Connector::connect::<MemoryTransport>(&uri), listener.accept());
        let (connector, inbound) = connect.unwrap();
        let (server_writer, server_reader) = accept.unwrap();
        (connector, inbound, server_writer, server_reader)
    }

    #[tokio::test]
    async fn test_send_receives_correlated_reply() {
        let (connector, _inbound, mut server_writer, mut server_reader) =
            connect_pair("connector-reply").await;
        let cancel = CancellationToken::new();

        let id = connector.next_id();
        let send = connector.send(Message::Ping(Ping { id }), &cancel);
        let serve = async {
            let frame = server_reader.receive().await.unwrap().unwrap();
            assert!(frame.contains("\"Ping\""));
            let reply = codec::encode(&[Message::Ok(OkMessage { id })]).unwrap();
            server_writer.send(reply).await.unwrap();
        };

        let (reply, ()) = tokio::join!(send, serve);
        assert_eq!(reply.unwrap().id(), id);
        connector.disconnect().await;
    }

    #[tokio::test]
    async fn test_unsolicited_message_reaches_inbound_sink() {
        let (connector, mut inbound, mut server_writer, _server_reader) =
            connect_pair("connector-unsolicited").await;

        let reading = SensorReading {
            id: 0,
            device_index: 2,
            sensor_index: 0,
            sensor_type: SensorType::Battery,
            data: vec![74],
        };
        let frame = codec::encode(&[Message::SensorReading(reading)]).unwrap();
        server_writer.send(frame).await.unwrap();

        match inbound.recv().await.unwrap() {
            Inbound::Message(Message::SensorReading(reading)) => {
                assert_eq!(reading.device_index, 2);
                assert_eq!(reading.data, vec![74]);
            }
            other => panic!("expected a sensor reading, got {other:?}"),
        }
        connector.disconnect().await;
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_reported_and_tolerated() {
        let (connector, mut inbound, mut server_writer, _server_reader) =
            connect_pair("connector-garbage").await;

        server_writer.send("not json".to_string()).await.unwrap();
        match inbound.recv().await.unwrap() {
            Inbound::Invalid(ClientError::Codec(_)) => {}
            other => panic!("expected a codec fault, got {other:?}"),
        }

        // The connection survives; a later valid frame still comes through.
        let frame = codec::encode(&[Message::Ok(OkMessage { id: 0 })]).unwrap();
        server_writer.send(frame).await.unwrap();
        assert!(matches!(
            inbound.recv().await.unwrap(),
            Inbound::Message(Message::Ok(_))
        ));
        connector.disconnect().await;
    }

    #[tokio::test]
    async fn test_unknown_reply_id_faults_the_connection() {
        let (connector, mut inbound, mut server_writer, _server_reader) =
            connect_pair("connector-unknown-id").await;

        let frame = codec::encode(&[Message::Ok(OkMessage { id: 42 })]).unwrap();
        server_writer.send(frame).await.unwrap();

        // The driver stops; the sink closes without delivering anything.
        assert!(inbound.recv().await.is_none());
        connector.disconnect().await;
        assert!(matches!(
            connector.take_fault(),
            Some(ClientError::UnknownRequestId(42))
        ));
    }

    #[tokio::test]
    async fn test_peer_close_cancels_pending_requests() {
        let (connector, _inbound, server_writer, _server_reader) =
            connect_pair("connector-peer-close").await;
        let cancel = CancellationToken::new();

        let id = connector.next_id();
        let send = connector.send(Message::Ping(Ping { id }), &cancel);
        let close = async {
            let mut server_writer = server_writer;
            server_writer.close().await.unwrap();
        };

        let (reply, ()) = tokio::join!(send, close);
        assert!(matches!(reply, Err(ClientError::Cancelled)));
        connector.disconnect().await;
        assert!(matches!(
            connector.take_fault(),
            Some(ClientError::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_send_after_disconnect_is_refused() {
        let (connector, _inbound, _server_writer, _server_reader) =
            connect_pair("connector-send-after-disconnect").await;
        connector.disconnect().await;

        let cancel = CancellationToken::new();
        let id = connector.next_id();
        let reply = connector.send(Message::Ping(Ping { id }), &cancel).await;
        assert!(matches!(reply, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (connector, _inbound, _server_writer, _server_reader) =
            connect_pair("connector-double-disconnect").await;
        connector.disconnect().await;
        connector.disconnect().await;
    }

    #[tokio::test]
    async fn test_next_id_is_monotonic_and_never_zero() {
        let (connector, _inbound, _server_writer, _server_reader) =
            connect_pair("connector-ids").await;
        let first = connector.next_id();
        let second = connector.next_id();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        connector.disconnect().await;
    }
}
