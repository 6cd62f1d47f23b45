//! Per-form sync sessions and the client that owns them.
//!
//! A [`FormSession`] wires one form's store, replicated document, transport,
//! bridge and autosave together. Sessions live in a [`SessionRegistry`] owned
//! by the caller, keyed by form id, with explicit open/close. The
//! [`CollabClient`] adds the canvas-wide awareness room on top.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::autosave::{Autosave, PersistenceApi, StoredForm};
use crate::config::ClientConfig;
use crate::form::{FormElement, FormId, RoomKey};
use crate::observer::Subscription;
use crate::store::{serialize_elements, FormStore};
use crate::sync::bridge::SyncBridge;
use crate::sync::document::ReplicatedDocument;
use crate::sync::identity::UserIdentity;
use crate::sync::presence::{Awareness, Collaborator};
use crate::sync::provider::{Channel, WebsocketProvider};
use crate::sync::{outbox, SyncResult};

/// Everything that keeps one form in sync
pub struct FormSession {
    form_id: FormId,
    store: FormStore,
    document: ReplicatedDocument,
    api: Arc<dyn PersistenceApi>,
    autosave: Option<Autosave>,
    bridge: Option<SyncBridge>,
    provider: Option<WebsocketProvider>,
    selection: Option<Subscription>,
}

impl FormSession {
    /// Create the store and document for `form_id` and start connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        config: &ClientConfig,
        form_id: impl Into<FormId>,
        initial_elements: Vec<FormElement>,
        api: Arc<dyn PersistenceApi>,
    ) -> SyncResult<Self> {
        let form_id = form_id.into();
        let room = RoomKey::form(&form_id);
        let (tx, rx) = outbox();

        let document = ReplicatedDocument::new(room.clone(), tx)?;
        let store = FormStore::new(form_id.clone(), initial_elements);
        let bridge = SyncBridge::attach(&store, &document);
        let autosave = Autosave::with_delay(&store, api.clone(), config.autosave_delay);
        let channel: Arc<dyn Channel> = Arc::new(document.clone());
        let provider = WebsocketProvider::connect(config, room, channel, rx);

        info!(form_id = %form_id, "Form session opened");
        Ok(Self {
            form_id,
            store,
            document,
            api,
            autosave: Some(autosave),
            bridge: Some(bridge),
            provider: Some(provider),
            selection: None,
        })
    }

    pub fn form_id(&self) -> &str {
        &self.form_id
    }

    pub fn store(&self) -> &FormStore {
        &self.store
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.document
    }

    pub fn provider(&self) -> Option<&WebsocketProvider> {
        self.provider.as_ref()
    }

    /// Mirror this store's selected element into `awareness`
    pub fn forward_selection(&mut self, awareness: &Awareness) {
        let awareness = awareness.clone();
        self.selection = Some(self.store.subscribe_with_selector(
            |state| state.selected_element_id.clone(),
            |a, b| a == b,
            move |current, _, _| awareness.set_selected_element(current.clone()),
        ));
    }

    /// Whole-form save: `PUT {layout, schema}`, then mark the sent layout
    /// as saved
    pub async fn save_form(&self, schema: Value) -> SyncResult<StoredForm> {
        let elements = self.store.elements();
        let snapshot = serialize_elements(&elements);
        let stored = self.api.save_form(&self.form_id, &elements, schema).await?;
        self.store.mark_saved_as(snapshot);
        Ok(stored)
    }

    /// Tear down in order: autosave timer, selection forwarding, bridge,
    /// transport, document
    pub async fn close(mut self) -> SyncResult<()> {
        self.teardown_local();
        let result = match self.provider.take() {
            Some(provider) => provider.disconnect().await,
            None => Ok(()),
        };
        self.document.destroy();
        info!(form_id = %self.form_id, "Form session closed");
        result
    }

    fn teardown_local(&mut self) {
        if let Some(mut autosave) = self.autosave.take() {
            autosave.cancel();
        }
        self.selection.take();
        if let Some(bridge) = self.bridge.take() {
            bridge.detach();
        }
    }
}

impl Drop for FormSession {
    fn drop(&mut self) {
        self.teardown_local();
        self.provider.take();
        self.document.destroy();
    }
}

impl std::fmt::Debug for FormSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormSession")
            .field("form_id", &self.form_id)
            .field("document", &self.document)
            .finish()
    }
}

/// Keyed registry of open form sessions
pub struct SessionRegistry {
    config: ClientConfig,
    api: Arc<dyn PersistenceApi>,
    sessions: HashMap<FormId, FormSession>,
    active: Option<FormId>,
    awareness: Option<Awareness>,
}

impl SessionRegistry {
    pub fn new(config: ClientConfig, api: Arc<dyn PersistenceApi>) -> Self {
        Self {
            config,
            api,
            sessions: HashMap::new(),
            active: None,
            awareness: None,
        }
    }

    /// Forward selections of every session opened from now on to `awareness`
    pub fn with_awareness(mut self, awareness: Awareness) -> Self {
        self.awareness = Some(awareness);
        self
    }

    /// Open a session for `form_id`, closing any existing one for the same
    /// form first
    pub async fn open(
        &mut self,
        form_id: impl Into<FormId>,
        initial_elements: Vec<FormElement>,
    ) -> SyncResult<&FormSession> {
        let form_id = form_id.into();
        if let Some(existing) = self.sessions.remove(&form_id) {
            debug!(form_id = %form_id, "Replacing existing session");
            existing.close().await?;
        }

        let mut session = FormSession::open(&self.config, form_id.clone(), initial_elements, self.api.clone())?;
        if let Some(awareness) = &self.awareness {
            session.forward_selection(awareness);
        }

        let session = self.sessions.entry(form_id).or_insert(session);
        Ok(&*session)
    }

    /// Load `form_id` from the persistence API and open it
    pub async fn open_from_api(&mut self, form_id: impl Into<FormId>) -> SyncResult<&FormSession> {
        let form_id = form_id.into();
        let stored = self.api.load_form(&form_id).await?;
        let elements = stored.elements()?;
        self.open(form_id, elements).await
    }

    pub fn get(&self, form_id: &str) -> Option<&FormSession> {
        self.sessions.get(form_id)
    }

    pub fn contains(&self, form_id: &str) -> bool {
        self.sessions.contains_key(form_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn form_ids(&self) -> Vec<FormId> {
        self.sessions.keys().cloned().collect()
    }

    pub async fn close(&mut self, form_id: &str) -> SyncResult<bool> {
        if self.active.as_deref() == Some(form_id) {
            self.active = None;
        }
        match self.sessions.remove(form_id) {
            Some(session) => {
                session.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn close_all(&mut self) -> SyncResult<()> {
        self.active = None;
        let mut first_error = None;
        for (_, session) in self.sessions.drain() {
            if let Err(e) = session.close().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Mark `form_id` as the one the user is editing; `None` clears it.
    /// Returns false when no such session is open.
    pub fn set_active(&mut self, form_id: Option<&str>) -> bool {
        match form_id {
            Some(id) if self.sessions.contains_key(id) => {
                self.active = Some(id.to_string());
                true
            }
            Some(_) => false,
            None => {
                self.active = None;
                true
            }
        }
    }

    pub fn active_form_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_store(&self) -> Option<FormStore> {
        self.active
            .as_deref()
            .and_then(|id| self.sessions.get(id))
            .map(|session| session.store().clone())
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("active", &self.active)
            .finish()
    }
}

/// A collaborating user: canvas awareness plus the forms they have open
pub struct CollabClient {
    canvas_id: String,
    awareness: Awareness,
    awareness_provider: Option<WebsocketProvider>,
    registry: SessionRegistry,
}

impl CollabClient {
    /// Connect using the identity cached at `config.identity_path`
    pub fn connect(
        config: ClientConfig,
        canvas_id: impl Into<String>,
        api: Arc<dyn PersistenceApi>,
    ) -> SyncResult<Self> {
        let identity = UserIdentity::load_or_create(&config.identity_path)?;
        Ok(Self::with_identity(config, canvas_id, identity, api))
    }

    /// Must be called from within a tokio runtime
    pub fn with_identity(
        config: ClientConfig,
        canvas_id: impl Into<String>,
        identity: UserIdentity,
        api: Arc<dyn PersistenceApi>,
    ) -> Self {
        let canvas_id = canvas_id.into();
        let (tx, rx) = outbox();
        let awareness = Awareness::with_timing(
            identity,
            tx,
            config.awareness_renew_interval,
            config.awareness_timeout,
        );
        let channel: Arc<dyn Channel> = Arc::new(awareness.clone());
        let awareness_provider =
            WebsocketProvider::connect(&config, RoomKey::awareness(&canvas_id), channel, rx);
        let registry = SessionRegistry::new(config, api).with_awareness(awareness.clone());

        info!(canvas_id = %canvas_id, user = %awareness.identity().id, "Collaboration client started");
        Self {
            canvas_id,
            awareness,
            awareness_provider: Some(awareness_provider),
            registry,
        }
    }

    pub fn canvas_id(&self) -> &str {
        &self.canvas_id
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn sessions_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    pub async fn open_form(
        &mut self,
        form_id: impl Into<FormId>,
        initial_elements: Vec<FormElement>,
    ) -> SyncResult<&FormSession> {
        self.registry.open(form_id, initial_elements).await
    }

    /// Select a canvas node (a form) and advertise it to collaborators
    pub fn select_node(&mut self, form_id: Option<&str>, form_name: Option<String>) {
        self.registry.set_active(form_id);
        self.awareness
            .set_selected_node(form_id.map(str::to_string), form_name);
    }

    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.awareness.get_peers()
    }

    pub fn collaborator_editing(&self, element_id: &str) -> Option<Collaborator> {
        self.awareness.get_collaborator_editing(element_id)
    }

    /// Call `callback` with the full collaborator list after every peer
    /// transition
    pub fn on_collaborators_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Vec<Collaborator>) + Send + Sync + 'static,
    {
        let awareness = self.awareness.clone();
        self.awareness
            .on_peers_changed(move |_| callback(awareness.get_peers()))
    }

    /// Close every form session, then leave the awareness room
    pub async fn shutdown(mut self) -> SyncResult<()> {
        let sessions = self.registry.close_all().await;
        if let Some(provider) = self.awareness_provider.take() {
            provider.disconnect().await?;
        }
        info!(canvas_id = %self.canvas_id, "Collaboration client stopped");
        sessions
    }
}

impl std::fmt::Debug for CollabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabClient")
            .field("canvas_id", &self.canvas_id)
            .field("awareness", &self.awareness)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autosave::{PersistenceError, PersistenceResult};
    use crate::form::FieldType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct StaticApi;

    #[async_trait]
    impl PersistenceApi for StaticApi {
        async fn save_elements(&self, _form_id: &str, _elements: &[FormElement]) -> PersistenceResult<()> {
            Ok(())
        }

        async fn save_form(
            &self,
            form_id: &str,
            layout: &[FormElement],
            schema: Value,
        ) -> PersistenceResult<StoredForm> {
            Ok(StoredForm {
                id: form_id.to_string(),
                name: "Saved".into(),
                layout: serde_json::to_value(layout)?,
                schema,
                created_at: None,
            })
        }

        async fn load_form(&self, form_id: &str) -> PersistenceResult<StoredForm> {
            if form_id == "missing" {
                return Err(PersistenceError::Status {
                    status: 404,
                    body: "Not Found".into(),
                });
            }
            let layout = serde_json::to_string(&[FormElement::with_id("e1", FieldType::Input)])?;
            Ok(StoredForm {
                id: form_id.to_string(),
                name: "Loaded".into(),
                layout: Value::String(layout),
                schema: json!([]),
                created_at: None,
            })
        }
    }

    fn offline_config() -> ClientConfig {
        ClientConfig::new("ws://127.0.0.1:9")
            .with_reconnect(Duration::from_millis(5), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_registry_open_replace_close() {
        let mut registry = SessionRegistry::new(offline_config(), Arc::new(StaticApi));

        registry.open("f1", vec![]).await.unwrap();
        let first_doc = registry.get("f1").unwrap().document().clone();
        registry
            .open("f1", vec![FormElement::with_id("x", FieldType::Number)])
            .await
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(first_doc.is_destroyed());
        assert_eq!(registry.get("f1").unwrap().store().elements().len(), 1);

        assert!(registry.set_active(Some("f1")));
        assert!(!registry.set_active(Some("nope")));
        assert!(registry.active_store().is_some());

        assert!(tokio_test::assert_ok!(registry.close("f1").await));
        assert!(registry.active_store().is_none());
        assert!(!tokio_test::assert_ok!(registry.close("f1").await));
    }

    #[tokio::test]
    async fn test_open_from_api() {
        let mut registry = SessionRegistry::new(offline_config(), Arc::new(StaticApi));
        let session = registry.open_from_api("f9").await.unwrap();
        assert_eq!(session.store().elements()[0].id, "e1");
        assert!(!session.store().has_unsaved_changes());

        tokio_test::assert_err!(registry.open_from_api("missing").await);
        registry.close_all().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_save_form_marks_saved() {
        let mut registry = SessionRegistry::new(offline_config(), Arc::new(StaticApi));
        let session = registry.open("f1", vec![]).await.unwrap();
        session.store().add_element(FieldType::Input);
        assert!(session.store().has_unsaved_changes());

        let stored = session.save_form(json!([])).await.unwrap();
        assert_eq!(stored.elements().unwrap().len(), 1);
        assert!(!session.store().has_unsaved_changes());
        registry.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_selection_forwarded_to_awareness() {
        let identity = UserIdentity {
            id: "u1".into(),
            name: "Alice".into(),
            color: "#EF4444".into(),
        };
        let mut client = CollabClient::with_identity(offline_config(), "main", identity, Arc::new(StaticApi));

        let store = client.open_form("f1", vec![]).await.unwrap().store().clone();
        let id = store.add_element(FieldType::Button);
        assert_eq!(client.awareness().local_state().selected_element_id, Some(id));

        client.select_node(Some("f1"), Some("Signup".into()));
        let local = client.awareness().local_state();
        assert_eq!(local.selected_node_id.as_deref(), Some("f1"));
        assert_eq!(local.selected_form_name.as_deref(), Some("Signup"));
        assert!(client.sessions().active_store().is_some());

        client.shutdown().await.unwrap();
    }
}
