//! Form Collab - real-time collaboration core for the form builder
//!
//! Building blocks, leaves first:
//! - `form`: the form element model shared by every layer
//! - `store`: the observable local store the editor mutates optimistically
//! - `sync`: Automerge replicated document, presence, wire framing and the
//!   WebSocket provider, plus the bridge reconciling store and document
//! - `autosave`: debounced persistence against the external forms API
//! - `session`: explicit registry of per-form sync sessions
//! - `relay`: the stateless per-room WebSocket fan-out server

pub mod autosave;
pub mod config;
pub mod form;
pub mod observer;
pub mod relay;
pub mod session;
pub mod store;
pub mod sync;

pub use autosave::{Autosave, HttpPersistence, PersistenceApi, PersistenceError};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use form::{ColSpan, ElementId, FieldType, FormElement, FormError, FormId, RoomKey};
pub use observer::{Origin, Subscription};
pub use relay::RelayHub;
pub use session::{CollabClient, FormSession, SessionRegistry};
pub use store::{FormState, FormStore, StoreChange};
pub use sync::{
    bridge::SyncBridge,
    document::{DocEvent, ReplicatedDocument},
    presence::{Awareness, Collaborator, SelectionPatch},
    provider::WebsocketProvider,
    SyncError,
};
