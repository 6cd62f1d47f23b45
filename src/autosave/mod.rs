//! Debounced autosave.
//!
//! Watches a `FormStore` and, once its elements have differed from the last
//! saved snapshot for a quiet period, sends them to the persistence API.
//! Failures are logged and dropped; the next change schedules a new window.

mod persistence;

pub use persistence::{HttpPersistence, PersistenceApi, PersistenceError, PersistenceResult, StoredForm};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_AUTOSAVE_DELAY;
use crate::form::FormId;
use crate::observer::Subscription;
use crate::store::{serialize_elements, FormStore, StoreChange};

/// Autosave lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutosaveEvent {
    Scheduled { form_id: FormId, delay: Duration },
    Saved { form_id: FormId },
    Failed { form_id: FormId, error: String },
}

/// The armed debounce timer. Only the timer whose generation is still in
/// the slot may fire.
struct PendingTimer {
    generation: u64,
    task: JoinHandle<()>,
}

struct AutosaveInner {
    store: FormStore,
    api: Arc<dyn PersistenceApi>,
    delay: Duration,
    runtime: Handle,
    generation: AtomicU64,
    pending: Mutex<Option<PendingTimer>>,
    events: broadcast::Sender<AutosaveEvent>,
}

/// Autosave scheduler bound to one store
pub struct Autosave {
    inner: Arc<AutosaveInner>,
    subscription: Option<Subscription>,
}

impl Autosave {
    /// Start watching `store` with the default 2 second window.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(store: &FormStore, api: Arc<dyn PersistenceApi>) -> Self {
        Self::with_delay(store, api, DEFAULT_AUTOSAVE_DELAY)
    }

    pub fn with_delay(store: &FormStore, api: Arc<dyn PersistenceApi>, delay: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(AutosaveInner {
            store: store.clone(),
            api,
            delay,
            runtime: Handle::current(),
            generation: AtomicU64::new(0),
            pending: Mutex::new(None),
            events,
        });

        let weak = Arc::downgrade(&inner);
        let subscription = store.subscribe(move |change: &StoreChange| {
            if let Some(inner) = weak.upgrade() {
                inner.on_store_change(change);
            }
        });

        Self {
            inner,
            subscription: Some(subscription),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<AutosaveEvent> {
        self.inner.events.subscribe()
    }

    pub fn has_pending(&self) -> bool {
        self.inner.pending.lock().is_some()
    }

    /// Stop watching and drop any pending timer. A save already in flight
    /// is left to finish.
    pub fn cancel(&mut self) {
        self.subscription.take();
        if let Some(timer) = self.inner.pending.lock().take() {
            timer.task.abort();
            debug!(form_id = %self.inner.store.form_id(), "Pending autosave cancelled");
        }
    }
}

impl Drop for Autosave {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Autosave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autosave")
            .field("delay", &self.inner.delay)
            .field("pending", &self.has_pending())
            .finish()
    }
}

impl AutosaveInner {
    fn on_store_change(self: &Arc<Self>, change: &StoreChange) {
        if change.state.serialized_elements() == change.state.last_saved_elements {
            return;
        }

        let mut pending = self.pending.lock();
        if !change.elements_changed() && pending.is_some() {
            return;
        }
        if let Some(timer) = pending.take() {
            timer.task.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(self);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(inner.delay).await;
            inner.fire(generation);
        });
        *pending = Some(PendingTimer { generation, task });
        drop(pending);

        let _ = self.events.send(AutosaveEvent::Scheduled {
            form_id: change.state.form_id.clone(),
            delay: self.delay,
        });
    }

    /// Start the save for timer `generation` if it is still the armed one.
    ///
    /// An aborted timer that already woke runs to completion anyway, so it
    /// must not clear the slot of the timer that replaced it.
    fn fire(self: &Arc<Self>, generation: u64) -> bool {
        {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(timer) if timer.generation == generation => {
                    pending.take();
                }
                _ => {
                    debug!(form_id = %self.store.form_id(), generation, "Superseded autosave timer ignored");
                    return false;
                }
            }
        }

        // Detached so a later change cannot cancel a save in flight
        let saver = Arc::clone(self);
        self.runtime.spawn(async move { saver.save().await });
        true
    }

    async fn save(&self) {
        let state = self.store.get_state();
        let snapshot = serialize_elements(&state.elements);

        match self.api.save_elements(&state.form_id, &state.elements).await {
            Ok(()) => {
                self.store.mark_saved_as(snapshot);
                info!(form_id = %state.form_id, count = state.elements.len(), "Auto-saved");
                let _ = self.events.send(AutosaveEvent::Saved {
                    form_id: state.form_id,
                });
            }
            Err(e) => {
                warn!(form_id = %state.form_id, "Auto-save failed: {}", e);
                let _ = self.events.send(AutosaveEvent::Failed {
                    form_id: state.form_id,
                    error: e.to_string(),
                });
            }
        }
    }
}
