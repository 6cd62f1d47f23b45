//! Observable per-form store.
//!
//! The editor mutates this store optimistically; the sync bridge and the
//! autosave scheduler each observe it independently. Every write carries an
//! [`Origin`] so observers can tell editor actions from remotely applied
//! updates without a shared mutable flag.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::form::{ColSpan, ElementId, FieldType, FormElement, FormError, FormId};
use crate::observer::{Observers, Origin, Subscription};

/// Snapshot of one form's editable state
#[derive(Debug, Clone, PartialEq)]
pub struct FormState {
    pub form_id: FormId,
    pub elements: Vec<FormElement>,
    /// Weak reference: may point at an element that no longer exists
    pub selected_element_id: Option<ElementId>,
    /// Serialized `elements` as of the last successful save
    pub last_saved_elements: String,
}

impl FormState {
    pub fn selected_element(&self) -> Option<&FormElement> {
        let id = self.selected_element_id.as_deref()?;
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn serialized_elements(&self) -> String {
        serialize_elements(&self.elements)
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.serialized_elements() != self.last_saved_elements
    }
}

/// Notification delivered to store listeners after every write
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub state: FormState,
    pub prev: FormState,
    pub origin: Origin,
}

impl StoreChange {
    pub fn elements_changed(&self) -> bool {
        self.state.elements != self.prev.elements
    }
}

struct StoreInner {
    state: RwLock<FormState>,
    listeners: Observers<StoreChange>,
}

/// Cheaply cloneable handle to one form's store
#[derive(Clone)]
pub struct FormStore {
    inner: Arc<StoreInner>,
}

impl FormStore {
    pub fn new(form_id: impl Into<FormId>, initial_elements: Vec<FormElement>) -> Self {
        let last_saved_elements = serialize_elements(&initial_elements);
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(FormState {
                    form_id: form_id.into(),
                    elements: initial_elements,
                    selected_element_id: None,
                    last_saved_elements,
                }),
                listeners: Observers::new(),
            }),
        }
    }

    pub fn form_id(&self) -> FormId {
        self.inner.state.read().form_id.clone()
    }

    pub fn get_state(&self) -> FormState {
        self.inner.state.read().clone()
    }

    pub fn elements(&self) -> Vec<FormElement> {
        self.inner.state.read().elements.clone()
    }

    /// Apply `update` and notify listeners with the given origin
    pub fn set_state<R>(&self, origin: Origin, update: impl FnOnce(&mut FormState) -> R) -> R {
        let (result, change) = {
            let mut state = self.inner.state.write();
            let prev = state.clone();
            let result = update(&mut *state);
            let change = StoreChange {
                state: state.clone(),
                prev,
                origin,
            };
            (result, change)
        };

        self.inner.listeners.notify(&change);
        result
    }

    /// Listen to every write
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    /// Listen to a slice of the state; `listener(current, previous, origin)`
    /// fires only when `equal` reports the slice changed
    pub fn subscribe_with_selector<T, S, E, F>(
        &self,
        selector: S,
        equal: E,
        listener: F,
    ) -> Subscription
    where
        T: 'static,
        S: Fn(&FormState) -> T + Send + Sync + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
        F: Fn(&T, &T, Origin) + Send + Sync + 'static,
    {
        self.subscribe(move |change| {
            let current = selector(&change.state);
            let previous = selector(&change.prev);
            if !equal(&current, &previous) {
                listener(&current, &previous, change.origin);
            }
        })
    }

    /// Append an element of `field_type` and select it
    pub fn add_element(&self, field_type: FieldType) -> ElementId {
        let element = FormElement::new(field_type);
        let id = element.id.clone();
        self.set_state(Origin::Local, |state| {
            state.elements.push(element);
            state.selected_element_id = Some(id.clone());
        });
        id
    }

    /// Append a caller-built element without touching the selection
    pub fn push_element(&self, element: FormElement) {
        self.set_state(Origin::Local, |state| state.elements.push(element));
    }

    pub fn remove_element(&self, id: &str) {
        self.set_state(Origin::Local, |state| {
            state.elements.retain(|e| e.id != id);
            if state.selected_element_id.as_deref() == Some(id) {
                state.selected_element_id = None;
            }
        });
    }

    pub fn resize_element(&self, id: &str, col_span: ColSpan) {
        self.set_state(Origin::Local, |state| {
            if let Some(element) = state.elements.iter_mut().find(|e| e.id == id) {
                element.col_span = col_span;
            }
        });
    }

    /// Move the element at `from` so it ends up at `to`.
    ///
    /// An out-of-range `from` leaves the order untouched; `to` is clamped.
    pub fn reorder_elements(&self, from: usize, to: usize) {
        self.set_state(Origin::Local, |state| {
            if from < state.elements.len() {
                let moved = state.elements.remove(from);
                let to = to.min(state.elements.len());
                state.elements.insert(to, moved);
            }
        });
    }

    pub fn update_element_property(
        &self,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), FormError> {
        let mut updated = self
            .inner
            .state
            .read()
            .elements
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| FormError::ElementNotFound(id.to_string()))?;
        updated.apply_property(key, value)?;

        self.set_state(Origin::Local, |state| {
            if let Some(element) = state.elements.iter_mut().find(|e| e.id == id) {
                *element = updated;
            }
        });
        Ok(())
    }

    /// Replace every element and treat the result as saved.
    ///
    /// Used for remote updates and for loading a form; neither should
    /// trigger an autosave.
    pub fn set_elements(&self, elements: Vec<FormElement>, origin: Origin) {
        debug!(count = elements.len(), ?origin, "Replacing store elements");
        let snapshot = serialize_elements(&elements);
        self.set_state(origin, |state| {
            state.elements = elements;
            state.last_saved_elements = snapshot;
        });
    }

    pub fn select_element(&self, id: Option<ElementId>) {
        self.set_state(Origin::Local, |state| state.selected_element_id = id);
    }

    /// The selected element, or `None` when nothing (or a deleted element)
    /// is selected
    pub fn selected_element(&self) -> Option<FormElement> {
        self.inner.state.read().selected_element().cloned()
    }

    pub fn mark_saved(&self) {
        self.set_state(Origin::Local, |state| {
            state.last_saved_elements = state.serialized_elements();
        });
    }

    /// Record `snapshot` (the payload that was actually persisted) as saved
    pub fn mark_saved_as(&self, snapshot: String) {
        self.set_state(Origin::Local, |state| state.last_saved_elements = snapshot);
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.inner.state.read().has_unsaved_changes()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl std::fmt::Debug for FormStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("FormStore")
            .field("form_id", &state.form_id)
            .field("elements", &state.elements.len())
            .finish()
    }
}

/// Canonical serialized form of an element list
pub fn serialize_elements(elements: &[FormElement]) -> String {
    serde_json::to_string(elements).unwrap_or_default()
}
