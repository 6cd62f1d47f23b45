//! Automerge-backed replicated element list.
//!
//! The document holds a single root list, `elements`, whose entries are JSON
//! encoded `FormElement`s. Every peer creates that list in an identical
//! genesis change (fixed actor, fixed timestamp), so independently created
//! documents share the same list object and their edits merge into it.
//!
//! Mutations are batched with [`ReplicatedDocument::transact`]; each committed
//! transaction becomes exactly one `Update` frame on the outbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use automerge::{
    transaction::{CommitOptions, Transactable},
    ActorId, AutoCommit, ChangeHash, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT,
};
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::protocol::{Frame, MessageType};
use super::provider::Channel;
use super::Outbox;
use crate::form::{FormElement, RoomKey};
use crate::observer::{Observers, Origin, Subscription};

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Document corruption: {0}")]
    Corruption(String),

    #[error("Document destroyed: {0}")]
    Destroyed(RoomKey),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Keys used in the Automerge document structure
mod keys {
    pub const ELEMENTS: &str = "elements";

    /// Actor of the shared genesis change
    pub const GENESIS_ACTOR: [u8; 16] = [0u8; 16];
}

/// Events raised by a replicated document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocEvent {
    /// The element list may have changed
    Changed { origin: Origin },
    /// The initial exchange with the room finished (or timed out) for the
    /// current connection
    Synced,
}

struct DocState {
    doc: AutoCommit,
    list: ObjId,
}

struct DocInner {
    room: RoomKey,
    state: Mutex<DocState>,
    outbox: Outbox,
    observers: Observers<DocEvent>,
    synced: AtomicBool,
    destroyed: AtomicBool,
}

/// Handle to one room's replicated element list
#[derive(Clone)]
pub struct ReplicatedDocument {
    inner: Arc<DocInner>,
}

impl ReplicatedDocument {
    /// Create an empty document for `room`; outgoing frames go to `outbox`
    pub fn new(room: RoomKey, outbox: Outbox) -> DocumentResult<Self> {
        let mut doc = AutoCommit::new().with_actor(ActorId::from(&keys::GENESIS_ACTOR[..]));
        let list = doc.put_object(ROOT, keys::ELEMENTS, ObjType::List)?;
        doc.commit_with(CommitOptions::default().with_time(0));
        doc.set_actor(ActorId::random());

        Ok(Self {
            inner: Arc::new(DocInner {
                room,
                state: Mutex::new(DocState { doc, list }),
                outbox,
                observers: Observers::new(),
                synced: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn room(&self) -> &RoomKey {
        &self.inner.room
    }

    /// Current element sequence; entries that fail to decode are skipped
    pub fn elements(&self) -> Vec<FormElement> {
        let state = self.inner.state.lock();
        read_elements(&state.doc, &state.list)
    }

    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.doc.length(&state.list)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_synced(&self) -> bool {
        self.inner.synced.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Full document state in Automerge's save format
    pub fn save(&self) -> Vec<u8> {
        self.inner.state.lock().doc.save()
    }

    pub fn heads(&self) -> Vec<ChangeHash> {
        self.inner.state.lock().doc.get_heads()
    }

    /// Run `f` as one transaction.
    ///
    /// A transaction that changes nothing emits nothing. On error every
    /// pending operation is rolled back.
    pub fn transact<R>(
        &self,
        f: impl FnOnce(&mut ElementsTxn<'_>) -> DocumentResult<R>,
    ) -> DocumentResult<R> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed(self.inner.room.clone()));
        }

        let (result, update) = {
            let mut state = self.inner.state.lock();
            let DocState { doc, list } = &mut *state;
            let before = doc.get_heads();

            let mut txn = ElementsTxn {
                doc: &mut *doc,
                list: &*list,
            };
            let result = match f(&mut txn) {
                Ok(result) => result,
                Err(e) => {
                    doc.rollback();
                    return Err(e);
                }
            };

            let update = doc.commit().map(|_| {
                doc.get_changes(&before)
                    .into_iter()
                    .flat_map(|change| change.raw_bytes().to_vec())
                    .collect::<Vec<u8>>()
            });
            (result, update)
        };

        if let Some(bytes) = update {
            debug!(room = %self.inner.room, bytes = bytes.len(), "Local transaction committed");
            self.send(Frame::new(MessageType::Update, bytes));
            self.inner.observers.notify(&DocEvent::Changed {
                origin: Origin::Local,
            });
        }

        Ok(result)
    }

    /// Clear the list and reinsert `elements` in order, as one transaction
    pub fn replace_all(&self, elements: &[FormElement]) -> DocumentResult<()> {
        self.transact(|txn| {
            txn.clear()?;
            for element in elements {
                txn.push(element)?;
            }
            Ok(())
        })
    }

    /// Append `elements` in one transaction
    pub fn push(&self, elements: &[FormElement]) -> DocumentResult<()> {
        self.transact(|txn| {
            for element in elements {
                txn.push(element)?;
            }
            Ok(())
        })
    }

    /// Listen for document events
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DocEvent) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(callback)
    }

    /// Merge Automerge bytes received from a peer.
    ///
    /// Returns whether the document heads moved; emits `Changed { Remote }`
    /// when they did.
    pub fn apply_remote(&self, data: &[u8]) -> DocumentResult<bool> {
        if self.is_destroyed() || data.is_empty() {
            return Ok(false);
        }

        let changed = {
            let mut state = self.inner.state.lock();
            let before = state.doc.get_heads();
            state.doc.load_incremental(data)?;
            state.doc.get_heads() != before
        };

        if changed {
            self.inner.observers.notify(&DocEvent::Changed {
                origin: Origin::Remote,
            });
        }
        Ok(changed)
    }

    /// Stop emitting frames and events and drop every observer
    pub fn destroy(&self) {
        if !self.inner.destroyed.swap(true, Ordering::SeqCst) {
            self.inner.observers.clear();
            info!(room = %self.inner.room, "Document destroyed");
        }
    }

    fn send(&self, frame: Frame) {
        if self.is_destroyed() {
            return;
        }
        if self.inner.outbox.send(frame).is_err() {
            debug!(room = %self.inner.room, "Outbox closed, dropping frame");
        }
    }

    fn mark_synced(&self) {
        if !self.is_destroyed() && !self.inner.synced.swap(true, Ordering::SeqCst) {
            info!(room = %self.inner.room, elements = self.len(), "Document synced");
            self.inner.observers.notify(&DocEvent::Synced);
        }
    }
}

impl Channel for ReplicatedDocument {
    fn on_connected(&self) {
        self.inner.synced.store(false, Ordering::SeqCst);
        // Our own state rides along with the request so peers pick up
        // anything we changed while offline.
        self.send(Frame::new(MessageType::SyncStep1, self.save()));
    }

    fn on_disconnected(&self) {
        self.inner.synced.store(false, Ordering::SeqCst);
    }

    fn handle_frame(&self, frame: Frame) {
        let result = match frame.kind {
            MessageType::SyncStep1 => {
                let applied = self.apply_remote(&frame.payload);
                self.send(Frame::new(MessageType::SyncStep2, Bytes::from(self.save())));
                applied
            }
            MessageType::SyncStep2 => {
                let applied = self.apply_remote(&frame.payload);
                self.mark_synced();
                applied
            }
            MessageType::Update => self.apply_remote(&frame.payload),
            MessageType::Awareness | MessageType::AwarenessQuery => Ok(false),
        };

        if let Err(e) = result {
            warn!(room = %self.inner.room, kind = ?frame.kind, "Dropping undecodable frame: {}", e);
        }
    }

    fn on_sync_timeout(&self) {
        if !self.is_synced() {
            debug!(room = %self.inner.room, "No peer answered, syncing alone");
            self.mark_synced();
        }
    }
}

impl std::fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("room", &self.inner.room)
            .field("synced", &self.is_synced())
            .finish()
    }
}

/// Mutable view of the element list inside one transaction
pub struct ElementsTxn<'a> {
    doc: &'a mut AutoCommit,
    list: &'a ObjId,
}

impl ElementsTxn<'_> {
    pub fn len(&self) -> usize {
        self.doc.length(self.list)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) -> DocumentResult<()> {
        for index in (0..self.len()).rev() {
            self.doc.delete(self.list, index)?;
        }
        Ok(())
    }

    pub fn push(&mut self, element: &FormElement) -> DocumentResult<()> {
        let index = self.len();
        self.insert(index, element)
    }

    pub fn insert(&mut self, index: usize, element: &FormElement) -> DocumentResult<()> {
        let encoded = serde_json::to_string(element)?;
        self.doc.insert(self.list, index, encoded)?;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> DocumentResult<()> {
        self.doc.delete(self.list, index)?;
        Ok(())
    }

    pub fn elements(&self) -> Vec<FormElement> {
        read_elements(self.doc, self.list)
    }
}

fn read_elements(doc: &AutoCommit, list: &ObjId) -> Vec<FormElement> {
    (0..doc.length(list))
        .filter_map(|index| match doc.get(list, index) {
            Ok(Some((Value::Scalar(scalar), _))) => match &*scalar {
                ScalarValue::Str(text) => match serde_json::from_str(text) {
                    Ok(element) => Some(element),
                    Err(e) => {
                        warn!(index, "Skipping undecodable element: {}", e);
                        None
                    }
                },
                other => {
                    warn!(index, "Skipping non-string element: {:?}", other);
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                warn!(index, "Failed to read element: {}", e);
                None
            }
        })
        .collect()
}
