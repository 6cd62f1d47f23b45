//! Presence/awareness for collaborators.
//!
//! Each connection advertises one ephemeral `Collaborator` record under a
//! random per-connection client id. Records carry a per-client clock; a peer's
//! update wins when its clock is newer, so each field follows last write per
//! peer. Nothing here is persisted: states live only while they keep being
//! renewed over an open transport.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::identity::UserIdentity;
use super::protocol::{Frame, MessageType, ProtocolError};
use super::provider::Channel;
use super::Outbox;
use crate::config::{DEFAULT_AWARENESS_RENEW, DEFAULT_AWARENESS_TIMEOUT};
use crate::form::ElementId;
use crate::observer::{Observers, Subscription};

/// Per-connection awareness client id
pub type ClientId = u64;

/// What one user advertises to the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: String,
    pub name: String,
    pub color: String,
    pub selected_element_id: Option<ElementId>,
    pub selected_node_id: Option<String>,
    pub selected_form_name: Option<String>,
}

impl Collaborator {
    pub fn from_identity(identity: &UserIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            color: identity.color.clone(),
            selected_element_id: None,
            selected_node_id: None,
            selected_form_name: None,
        }
    }
}

/// Partial update of the local selection; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPatch {
    pub selected_element_id: Option<Option<ElementId>>,
    pub selected_node_id: Option<Option<String>>,
    pub selected_form_name: Option<Option<String>>,
}

impl SelectionPatch {
    pub fn element(element_id: Option<ElementId>) -> Self {
        Self {
            selected_element_id: Some(element_id),
            ..Default::default()
        }
    }

    /// Selecting a node always rewrites the form name alongside it
    pub fn node(node_id: Option<String>, form_name: Option<String>) -> Self {
        Self {
            selected_node_id: Some(node_id),
            selected_form_name: Some(form_name),
            ..Default::default()
        }
    }

    fn apply(self, target: &mut Collaborator) {
        if let Some(value) = self.selected_element_id {
            target.selected_element_id = value;
        }
        if let Some(value) = self.selected_node_id {
            target.selected_node_id = value;
        }
        if let Some(value) = self.selected_form_name {
            target.selected_form_name = value;
        }
    }
}

/// One client's record on the wire; `state: None` announces departure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u64,
    pub state: Option<Collaborator>,
}

/// Payload of an `Awareness` frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::new(MessageType::Awareness, bincode::serialize(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Peer transitions delivered to `on_peers_changed` listeners
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeersChanged {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl PeersChanged {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

struct PeerMeta {
    clock: u64,
    last_updated: Instant,
}

struct AwarenessState {
    local: Collaborator,
    clock: u64,
    last_broadcast: Instant,
    peers: BTreeMap<ClientId, Collaborator>,
    meta: HashMap<ClientId, PeerMeta>,
}

struct AwarenessInner {
    client_id: ClientId,
    identity: UserIdentity,
    outbox: Outbox,
    state: Mutex<AwarenessState>,
    observers: Observers<PeersChanged>,
    renew_interval: Duration,
    timeout: Duration,
}

/// Handle to one room's awareness state
#[derive(Clone)]
pub struct Awareness {
    inner: Arc<AwarenessInner>,
}

impl Awareness {
    pub fn new(identity: UserIdentity, outbox: Outbox) -> Self {
        Self::with_timing(identity, outbox, DEFAULT_AWARENESS_RENEW, DEFAULT_AWARENESS_TIMEOUT)
    }

    pub fn with_timing(
        identity: UserIdentity,
        outbox: Outbox,
        renew_interval: Duration,
        timeout: Duration,
    ) -> Self {
        let client_id = rand::random::<ClientId>();
        let local = Collaborator::from_identity(&identity);
        Self {
            inner: Arc::new(AwarenessInner {
                client_id,
                identity,
                outbox,
                state: Mutex::new(AwarenessState {
                    local,
                    clock: 0,
                    last_broadcast: Instant::now(),
                    peers: BTreeMap::new(),
                    meta: HashMap::new(),
                }),
                observers: Observers::new(),
                renew_interval,
                timeout,
            }),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.inner.identity
    }

    pub fn local_state(&self) -> Collaborator {
        self.inner.state.lock().local.clone()
    }

    /// Merge `patch` into the advertised state and broadcast it if anything
    /// changed
    pub fn set_local_selection(&self, patch: SelectionPatch) {
        let entry = {
            let mut state = self.inner.state.lock();
            let mut next = state.local.clone();
            patch.apply(&mut next);
            if next == state.local {
                return;
            }
            state.local = next;
            self.bump_local(&mut state)
        };
        self.broadcast(vec![entry]);
    }

    pub fn set_selected_element(&self, element_id: Option<ElementId>) {
        self.set_local_selection(SelectionPatch::element(element_id));
    }

    pub fn set_selected_node(&self, node_id: Option<String>, form_name: Option<String>) {
        self.set_local_selection(SelectionPatch::node(node_id, form_name));
    }

    /// Every known peer state except those sharing our stable user id, in
    /// client id order
    pub fn get_peers(&self) -> Vec<Collaborator> {
        let state = self.inner.state.lock();
        state
            .peers
            .values()
            .filter(|peer| peer.id != self.inner.identity.id)
            .cloned()
            .collect()
    }

    /// First peer whose selection is `element_id`
    pub fn get_collaborator_editing(&self, element_id: &str) -> Option<Collaborator> {
        self.get_peers()
            .into_iter()
            .find(|peer| peer.selected_element_id.as_deref() == Some(element_id))
    }

    /// Listen for peer joins, leaves and field updates
    pub fn on_peers_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PeersChanged) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(callback)
    }

    /// Apply a decoded update from the room
    pub fn apply_update(&self, update: AwarenessUpdate) {
        let now = Instant::now();
        let mut change = PeersChanged::default();

        {
            let mut state = self.inner.state.lock();
            for entry in update.entries {
                if entry.client_id == self.inner.client_id {
                    continue;
                }

                let known = state.meta.get(&entry.client_id).map(|m| m.clock);
                let present = state.peers.contains_key(&entry.client_id);
                let newer = known.map_or(true, |clock| entry.clock > clock);
                let equal_removal =
                    known == Some(entry.clock) && entry.state.is_none() && present;
                if !newer && !equal_removal {
                    continue;
                }

                state.meta.insert(
                    entry.client_id,
                    PeerMeta {
                        clock: entry.clock,
                        last_updated: now,
                    },
                );

                match entry.state {
                    Some(peer) => match state.peers.insert(entry.client_id, peer.clone()) {
                        None => change.added.push(entry.client_id),
                        Some(previous) if previous != peer => change.updated.push(entry.client_id),
                        Some(_) => {}
                    },
                    None => {
                        if state.peers.remove(&entry.client_id).is_some() {
                            change.removed.push(entry.client_id);
                        }
                    }
                }
            }
        }

        self.emit(change);
    }

    /// Announce departure to the room
    pub fn leave(&self) {
        let clock = {
            let mut state = self.inner.state.lock();
            state.clock += 1;
            state.clock
        };
        debug!(client_id = self.inner.client_id, "Leaving awareness room");
        self.broadcast(vec![AwarenessEntry {
            client_id: self.inner.client_id,
            clock,
            state: None,
        }]);
    }

    /// Forget every remote state, as when the transport is lost
    pub fn remove_remote_states(&self) {
        let change = {
            let mut state = self.inner.state.lock();
            let removed: Vec<ClientId> = state.peers.keys().copied().collect();
            state.peers.clear();
            state.meta.clear();
            PeersChanged {
                removed,
                ..Default::default()
            }
        };
        self.emit(change);
    }

    /// Renew our own state and expire peers that stopped renewing
    pub fn check_at(&self, now: Instant) {
        let (renewal, change) = {
            let mut state = self.inner.state.lock();

            let renewal = if now.saturating_duration_since(state.last_broadcast)
                >= self.inner.renew_interval
            {
                Some(self.bump_local_at(&mut state, now))
            } else {
                None
            };

            let timeout = self.inner.timeout;
            let expired: Vec<ClientId> = state
                .meta
                .iter()
                .filter(|(_, meta)| now.saturating_duration_since(meta.last_updated) >= timeout)
                .map(|(client_id, _)| *client_id)
                .collect();

            let mut change = PeersChanged::default();
            for client_id in expired {
                if state.peers.remove(&client_id).is_some() {
                    // Removal restarts the clock so stale replays are still
                    // rejected for one more timeout
                    if let Some(meta) = state.meta.get_mut(&client_id) {
                        meta.last_updated = now;
                    }
                    change.removed.push(client_id);
                }
            }
            change.removed.sort_unstable();

            let AwarenessState { peers, meta, .. } = &mut *state;
            meta.retain(|client_id, meta| {
                peers.contains_key(client_id)
                    || now.saturating_duration_since(meta.last_updated) < timeout
            });
            (renewal, change)
        };

        if !change.removed.is_empty() {
            info!(count = change.removed.len(), "Dropping outdated awareness states");
        }
        if let Some(entry) = renewal {
            self.broadcast(vec![entry]);
        }
        self.emit(change);
    }

    fn bump_local(&self, state: &mut AwarenessState) -> AwarenessEntry {
        self.bump_local_at(state, Instant::now())
    }

    fn bump_local_at(&self, state: &mut AwarenessState, now: Instant) -> AwarenessEntry {
        state.clock += 1;
        state.last_broadcast = now;
        self.local_entry(state)
    }

    fn local_entry(&self, state: &AwarenessState) -> AwarenessEntry {
        AwarenessEntry {
            client_id: self.inner.client_id,
            clock: state.clock,
            state: Some(state.local.clone()),
        }
    }

    fn broadcast(&self, entries: Vec<AwarenessEntry>) {
        match (AwarenessUpdate { entries }).encode() {
            Ok(frame) => {
                if self.inner.outbox.send(frame).is_err() {
                    debug!("Outbox closed, dropping awareness update");
                }
            }
            Err(e) => warn!("Failed to encode awareness update: {}", e),
        }
    }

    fn emit(&self, change: PeersChanged) {
        if !change.is_empty() {
            self.inner.observers.notify(&change);
        }
    }
}

impl Channel for Awareness {
    fn on_connected(&self) {
        let entry = {
            let mut state = self.inner.state.lock();
            self.bump_local(&mut state)
        };
        self.broadcast(vec![entry]);
        if self
            .inner
            .outbox
            .send(Frame::empty(MessageType::AwarenessQuery))
            .is_err()
        {
            debug!("Outbox closed, dropping awareness query");
        }
    }

    fn on_disconnected(&self) {
        self.remove_remote_states();
    }

    fn handle_frame(&self, frame: Frame) {
        match frame.kind {
            MessageType::Awareness => match AwarenessUpdate::decode(&frame.payload) {
                Ok(update) => self.apply_update(update),
                Err(e) => warn!("Dropping undecodable awareness frame: {}", e),
            },
            MessageType::AwarenessQuery => {
                let entry = self.local_entry(&self.inner.state.lock());
                self.broadcast(vec![entry]);
            }
            MessageType::SyncStep1 | MessageType::SyncStep2 | MessageType::Update => {}
        }
    }

    fn on_leave(&self) {
        self.leave();
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some((self.inner.timeout / 10).max(Duration::from_millis(10)))
    }

    fn tick(&self) {
        self.check_at(Instant::now());
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.inner.client_id)
            .field("user", &self.inner.identity.id)
            .finish()
    }
}
