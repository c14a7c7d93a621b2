//! The request correlation table.
//!
//! Every outgoing request registers its id here before it touches the wire;
//! the read loop resolves entries as correlated replies arrive. Each entry
//! gets exactly one terminal outcome (reply, fault, or cancellation),
//! decided by whoever removes the entry from the map first. Removal under
//! the lock is the single atomic claim, so a reply racing a cancellation can
//! never double-complete or leak an entry.
//!
//! ```text
//! caller ── register(id) ──► entries[id] = oneshot::Sender
//!                                  │
//!         read loop ── fulfill ────┤ remove + send reply/fault
//!         caller token ── cancel ──┤ remove, wait() returns Cancelled
//!         teardown ── cancel_all ──┘ drain + send Cancelled, close table
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::message::Message;

type ReplySender = oneshot::Sender<Result<Message, ClientError>>;

#[derive(Default)]
struct PendingInner {
    entries: HashMap<u64, ReplySender>,
    /// Set by `cancel_all`; registrations arriving after the drain started
    /// are refused so they cannot leak.
    closed: bool,
}

/// Correlation table mapping pending request ids to their waiting callers.
#[derive(Default)]
pub(crate) struct PendingReplies {
    inner: Mutex<PendingInner>,
}

impl PendingReplies {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a pending request and return the handle its caller awaits.
    ///
    /// Fails without creating an entry when `cancel` has already fired, when
    /// the table is draining, or when `id` is already pending (a programmer
    /// or protocol error, never retryable).
    pub(crate) fn register(
        table: &Arc<Self>,
        id: u64,
        cancel: &CancellationToken,
    ) -> Result<ReplyHandle, ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = table.inner.lock().unwrap();
            if inner.closed {
                return Err(ClientError::Cancelled);
            }
            if inner.entries.contains_key(&id) {
                return Err(ClientError::DuplicateRequestId(id));
            }
            inner.entries.insert(id, tx);
        }

        Ok(ReplyHandle {
            id,
            rx,
            cancel: cancel.clone(),
            table: Arc::clone(table),
        })
    }

    /// Resolve the entry matching `message.id()`.
    ///
    /// An error-kind message resolves the waiter with a fault carrying the
    /// server's code and description; anything else resolves as success. A
    /// reply to an id the table no longer tracks is a protocol violation and
    /// is surfaced to the caller, not swallowed.
    pub(crate) fn fulfill(&self, message: Message) -> Result<(), ClientError> {
        let id = message.id();
        let sender = self
            .inner
            .lock()
            .unwrap()
            .entries
            .remove(&id)
            .ok_or(ClientError::UnknownRequestId(id))?;

        let outcome = match message {
            Message::Error(error) => Err(ClientError::Server {
                code: error.error_code,
                message: error.error_message,
            }),
            message => Ok(message),
        };

        // The waiter may have been cancelled in the meantime; its entry was
        // already claimed here, so a dead receiver is fine.
        if sender.send(outcome).is_err() {
            tracing::debug!(id, "reply arrived for a caller that stopped waiting");
        }
        Ok(())
    }

    /// Drain every entry, cancelling its waiter, and refuse registrations
    /// from now on. Safe to call with zero entries and safe to call more
    /// than once.
    pub(crate) fn cancel_all(&self) {
        let drained: Vec<ReplySender> = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.entries.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "cancelling pending requests");
        }
        for tx in drained {
            let _ = tx.send(Err(ClientError::Cancelled));
        }
    }

    /// Remove an entry without resolving it (its caller stopped waiting).
    fn discard(&self, id: u64) {
        self.inner.lock().unwrap().entries.remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// Awaitable handle for one registered request.
///
/// Dropping the handle without awaiting it removes the entry, so a caller
/// abandoning the future cannot leak a registration.
pub(crate) struct ReplyHandle {
    id: u64,
    rx: oneshot::Receiver<Result<Message, ClientError>>,
    cancel: CancellationToken,
    table: Arc<PendingReplies>,
}

impl ReplyHandle {
    /// Wait for the entry's terminal outcome, racing the caller's token.
    ///
    /// When both are ready the reply wins; a resolved request is reported
    /// even if the caller cancelled in the same instant.
    pub(crate) async fn wait(mut self) -> Result<Message, ClientError> {
        tokio::select! {
            biased;
            outcome = &mut self.rx => match outcome {
                Ok(outcome) => outcome,
                // Sender dropped without resolving; only happens if the
                // table itself was dropped mid-flight.
                Err(_) => Err(ClientError::Cancelled),
            },
            _ = self.cancel.cancelled() => {
                self.table.discard(self.id);
                Err(ClientError::Cancelled)
            }
        }
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        self.table.discard(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorCode, ErrorMessage, OkMessage};

    #[tokio::test]
    async fn test_register_and_fulfill() {
        let table = PendingReplies::new();
        let cancel = CancellationToken::new();

        let handle = PendingReplies::register(&table, 1, &cancel).unwrap();
        assert_eq!(table.pending_count(), 1);

        table
            .fulfill(Message::Ok(OkMessage { id: 1 }))
            .unwrap();
        assert_eq!(table.pending_count(), 0);

        let reply = handle.wait().await.unwrap();
        assert_eq!(reply, Message::Ok(OkMessage { id: 1 }));
    }

    #[tokio::test]
    async fn test_register_with_cancelled_token_leaves_no_entry() {
        let table = PendingReplies::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = PendingReplies::register(&table, 1, &cancel);
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_refused() {
        let table = PendingReplies::new();
        let cancel = CancellationToken::new();

        let _handle = PendingReplies::register(&table, 7, &cancel).unwrap();
        let result = PendingReplies::register(&table, 7, &cancel);
        assert!(matches!(result, Err(ClientError::DuplicateRequestId(7))));
        assert_eq!(table.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_fulfill_unknown_id_fails_without_side_effects() {
        let table = PendingReplies::new();
        let cancel = CancellationToken::new();
        let _handle = PendingReplies::register(&table, 1, &cancel).unwrap();

        let result = table.fulfill(Message::Ok(OkMessage { id: 99 }));
        assert!(matches!(result, Err(ClientError::UnknownRequestId(99))));
        assert_eq!(table.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_error_reply_resolves_as_fault() {
        let table = PendingReplies::new();
        let cancel = CancellationToken::new();
        let handle = PendingReplies::register(&table, 3, &cancel).unwrap();

        table
            .fulfill(Message::Error(ErrorMessage {
                id: 3,
                error_message: "device unavailable".to_string(),
                error_code: ErrorCode::Device,
            }))
            .unwrap();

        let err = handle.wait().await.unwrap_err();
        match err {
            ClientError::Server { code, message } => {
                assert_eq!(code, ErrorCode::Device);
                assert_eq!(message, "device unavailable");
            }
            other => panic!("expected a server fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_all_cancels_every_waiter() {
        let table = PendingReplies::new();
        let cancel = CancellationToken::new();
        let first = PendingReplies::register(&table, 1, &cancel).unwrap();
        let second = PendingReplies::register(&table, 2, &cancel).unwrap();

        table.cancel_all();
        assert_eq!(table.pending_count(), 0);

        assert!(matches!(first.wait().await, Err(ClientError::Cancelled)));
        assert!(matches!(second.wait().await, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn test_register_after_drain_is_refused() {
        let table = PendingReplies::new();
        let cancel = CancellationToken::new();

        table.cancel_all();
        let result = PendingReplies::register(&table, 1, &cancel);
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_token_cancellation_removes_entry() {
        let table = PendingReplies::new();
        let cancel = CancellationToken::new();
        let handle = PendingReplies::register(&table, 5, &cancel).unwrap();

        cancel.cancel();
        assert!(matches!(handle.wait().await, Err(ClientError::Cancelled)));
        assert_eq!(table.pending_count(), 0);

        // The entry is gone, so a late reply is a protocol violation.
        let result = table.fulfill(Message::Ok(OkMessage { id: 5 }));
        assert!(matches!(result, Err(ClientError::UnknownRequestId(5))));
    }

    #[tokio::test]
    async fn test_dropping_handle_removes_entry() {
        let table = PendingReplies::new();
        let cancel = CancellationToken::new();

        let handle = PendingReplies::register(&table, 4, &cancel).unwrap();
        drop(handle);
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fulfill_beats_later_cancellation() {
        let table = PendingReplies::new();
        let cancel = CancellationToken::new();
        let handle = PendingReplies::register(&table, 6, &cancel).unwrap();

        table.fulfill(Message::Ok(OkMessage { id: 6 })).unwrap();
        cancel.cancel();

        // The reply claimed the entry first; the waiter still observes it.
        let reply = handle.wait().await.unwrap();
        assert_eq!(reply.id(), 6);
    }

    #[tokio::test]
    async fn test_cancel_all_is_idempotent() {
        let table = PendingReplies::new();
        table.cancel_all();
        table.cancel_all();
        assert_eq!(table.pending_count(), 0);
    }
}
