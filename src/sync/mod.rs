//! Client-side synchronization over the relay.
//!
//! - `protocol`: binary frame format shared by every room participant
//! - `document`: Automerge-backed replicated element list
//! - `presence`: ephemeral per-user awareness state
//! - `identity`: the locally cached user record presence advertises
//! - `provider`: WebSocket transport with reconnect and backoff
//! - `bridge`: reconciliation between a `FormStore` and its document

pub mod bridge;
pub mod document;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod provider;

use thiserror::Error;
use tokio::sync::mpsc;

use self::protocol::{Frame, ProtocolError};

/// Frames queued by a room participant for the transport to send
pub type Outbox = mpsc::UnboundedSender<Frame>;

/// Receiving side of an [`Outbox`], owned by the transport
pub type OutboxReceiver = mpsc::UnboundedReceiver<Frame>;

/// Create a connected outbox pair
pub fn outbox() -> (Outbox, OutboxReceiver) {
    mpsc::unbounded_channel()
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while talking to the relay
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Document error: {0}")]
    Document(#[from] document::DocumentError),

    #[error("Identity error: {0}")]
    Identity(#[from] identity::IdentityError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] crate::autosave::PersistenceError),

    #[error("Transport task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::from(ProtocolError::UnknownMessageType(0x99));
        assert_eq!(err.to_string(), "Protocol error: Unknown message type: 0x99");
    }

    #[test]
    fn test_outbox_pair() {
        let (tx, mut rx) = outbox();
        tx.send(Frame::empty(protocol::MessageType::AwarenessQuery)).unwrap();
        assert_eq!(
            rx.try_recv().unwrap().kind,
            protocol::MessageType::AwarenessQuery
        );
    }
}
