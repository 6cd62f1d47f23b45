//! Reconciliation between a `FormStore` and its replicated document.
//!
//! Local edits are pushed into the document as a full replace of the list;
//! remote document changes overwrite the store's elements. The origin tag on
//! each store write keeps the two directions from feeding each other.
//!
//! Both directions run under one per-bridge gate and compare against the
//! last list the two sides agreed on. A remote change that lands while a
//! local edit is still unpushed flushes the edit first, so the store and the
//! document never settle on different lists.
//!
//! On every `Synced` event the bridge runs the join policy: an empty document
//! is seeded from the store, a non-empty document overwrites the store.

use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, warn};

use super::document::{DocEvent, ReplicatedDocument};
use crate::form::FormElement;
use crate::observer::{Origin, Subscription};
use crate::store::{FormStore, StoreChange};

/// Live link between one store and one document.
///
/// Both subscriptions are released on [`SyncBridge::detach`] or drop, which
/// also breaks the reference cycle between the two handles.
#[derive(Debug)]
pub struct SyncBridge {
    store_subscription: Subscription,
    doc_subscription: Subscription,
}

/// State shared by the two directions of one bridge.
///
/// The gate is reentrant: adopting remote elements notifies store listeners
/// on the same thread, and one of them may write locally.
#[derive(Default)]
struct Link {
    gate: ReentrantMutex<()>,
    agreed: Mutex<Vec<FormElement>>,
}

impl Link {
    /// Push the store's current elements if they moved since the last agreement
    fn push_local(&self, store: &FormStore, doc: &ReplicatedDocument) {
        let _gate = self.gate.lock();
        let current = store.elements();
        if *self.agreed.lock() == current {
            return;
        }
        debug!(room = %doc.room(), count = current.len(), "Pushing local elements to document");
        match doc.replace_all(&current) {
            Ok(()) => *self.agreed.lock() = current,
            Err(e) => warn!(room = %doc.room(), "Failed to push local elements: {}", e),
        }
    }

    fn apply_remote(&self, store: &FormStore, doc: &ReplicatedDocument) {
        let _gate = self.gate.lock();
        self.push_local(store, doc);
        self.adopt(store, doc);
    }

    fn reconcile_on_sync(&self, store: &FormStore, doc: &ReplicatedDocument) {
        let _gate = self.gate.lock();
        if doc.is_empty() {
            let local = store.elements();
            if !local.is_empty() {
                info!(room = %doc.room(), count = local.len(), "Seeding empty document from local store");
                if let Err(e) = doc.push(&local) {
                    warn!(room = %doc.room(), "Failed to seed document: {}", e);
                }
            }
            *self.agreed.lock() = doc.elements();
        } else {
            info!(room = %doc.room(), count = doc.len(), "Adopting document state on join");
            self.adopt(store, doc);
        }
    }

    fn adopt(&self, store: &FormStore, doc: &ReplicatedDocument) {
        let remote = doc.elements();
        *self.agreed.lock() = remote.clone();
        if remote != store.elements() {
            store.set_elements(remote, Origin::Remote);
        }
    }
}

impl SyncBridge {
    pub fn attach(store: &FormStore, doc: &ReplicatedDocument) -> Self {
        let link = Arc::new(Link::default());

        let store_subscription = {
            let doc = doc.clone();
            let store_handle = store.clone();
            let link = link.clone();
            store.subscribe(move |change: &StoreChange| {
                if change.origin.is_remote() || !change.elements_changed() {
                    return;
                }
                link.push_local(&store_handle, &doc);
            })
        };

        let doc_subscription = {
            let store = store.clone();
            let handle = doc.clone();
            doc.observe(move |event| match event {
                DocEvent::Changed {
                    origin: Origin::Remote,
                } => {
                    // Before the join handshake completes the Synced branch
                    // decides what the store gets
                    if handle.is_synced() {
                        link.apply_remote(&store, &handle);
                    }
                }
                DocEvent::Changed {
                    origin: Origin::Local,
                } => {}
                DocEvent::Synced => link.reconcile_on_sync(&store, &handle),
            })
        };

        Self {
            store_subscription,
            doc_subscription,
        }
    }

    /// Stop propagating in both directions
    pub fn detach(self) {
        let Self {
            store_subscription,
            doc_subscription,
        } = self;
        store_subscription.unsubscribe();
        doc_subscription.unsubscribe();
    }
}
