//! End-to-end sessions between clients talking through a live relay.

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use form_collab::autosave::{PersistenceResult, StoredForm};
use form_collab::sync::identity::UserIdentity;
use form_collab::sync::provider::ConnectionStatus;
use form_collab::{
    relay, ClientConfig, CollabClient, FieldType, FormElement, FormStore, PersistenceApi, RelayHub,
};

const TIMEOUT: Duration = Duration::from_secs(5);

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("form_collab=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Default)]
struct RecordingApi {
    saves: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingApi {
    fn saves(&self) -> Vec<(String, Vec<String>)> {
        self.saves.lock().clone()
    }
}

#[async_trait]
impl PersistenceApi for RecordingApi {
    async fn save_elements(&self, form_id: &str, elements: &[FormElement]) -> PersistenceResult<()> {
        self.saves.lock().push((
            form_id.to_string(),
            elements.iter().map(|e| e.id.clone()).collect(),
        ));
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
            name: form_id.to_string(),
            layout: serde_json::to_value(layout)?,
            schema,
            created_at: None,
        })
    }

    async fn load_form(&self, form_id: &str) -> PersistenceResult<StoredForm> {
        Ok(StoredForm {
            id: form_id.to_string(),
            name: form_id.to_string(),
            layout: Value::Array(vec![]),
            schema: Value::Array(vec![]),
            created_at: None,
        })
    }
}

async fn start_relay() -> SocketAddr {
    init_tracing();
    let app = relay::router(RelayHub::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Forward every connection accepted on `listener` to `upstream`.
///
/// Aborting the returned task drops the listener and every live link.
fn start_proxy(listener: TcpListener, upstream: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut links = JoinSet::new();
        while let Ok((mut inbound, _)) = listener.accept().await {
            links.spawn(async move {
                if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                    let _ = copy_bidirectional(&mut inbound, &mut outbound).await;
                }
            });
        }
    })
}

/// Bind `addr` again once the previous listener on it is gone
async fn rebind(addr: SocketAddr) -> TcpListener {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return listener,
            Err(e) if tokio::time::Instant::now() >= deadline => panic!("Could not rebind {}: {}", addr, e),
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
}

fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(format!("ws://{}", addr))
        .with_autosave_delay(Duration::from_millis(300))
        .with_sync_timeout(Duration::from_millis(200))
        .with_reconnect(Duration::from_millis(20), Duration::from_millis(200))
}

fn user(id: &str, name: &str) -> UserIdentity {
    UserIdentity {
        id: id.to_string(),
        name: name.to_string(),
        color: "#3B82F6".to_string(),
    }
}

fn el(id: &str) -> FormElement {
    FormElement::with_id(id, FieldType::Input)
}

fn ids(store: &FormStore) -> Vec<String> {
    store.elements().into_iter().map(|e| e.id).collect()
}

/// Poll until `check` holds or the timeout passes
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn client(addr: SocketAddr, identity: UserIdentity, api: Arc<RecordingApi>) -> CollabClient {
    CollabClient::with_identity(config(addr), "main", identity, api)
}

/// Open `form_id` on `client` and wait for its join handshake
async fn open_synced(client: &mut CollabClient, form_id: &str, initial: Vec<FormElement>) -> FormStore {
    let session = client.open_form(form_id, initial).await.unwrap();
    let document = session.document().clone();
    let store = session.store().clone();
    assert!(eventually(|| document.is_synced()).await, "{} never synced", form_id);
    store
}

#[tokio::test]
async fn test_two_edits_save_once_and_reach_peer() {
    let addr = start_relay().await;
    let x_api = Arc::new(RecordingApi::default());
    let y_api = Arc::new(RecordingApi::default());
    let mut x = client(addr, user("ux", "Ada"), x_api.clone()).await;
    let mut y = client(addr, user("uy", "Grace"), y_api.clone()).await;

    let x_store = open_synced(&mut x, "f1", vec![]).await;
    let y_store = open_synced(&mut y, "f1", vec![]).await;

    x_store.push_element(el("e1"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    x_store.push_element(el("e2"));

    assert!(eventually(|| ids(&y_store) == ["e1", "e2"]).await);
    assert!(eventually(|| !x_api.saves().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        x_api.saves(),
        vec![("f1".to_string(), vec!["e1".to_string(), "e2".to_string()])]
    );
    // Remote writes are not the peer's to save
    assert!(y_api.saves().is_empty());
    assert!(!y_store.has_unsaved_changes());

    x.shutdown().await.unwrap();
    y.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_first_client_seeds_and_later_client_adopts() {
    let addr = start_relay().await;
    let api = Arc::new(RecordingApi::default());
    let mut x = client(addr, user("ux", "Ada"), api.clone()).await;
    let x_store = open_synced(&mut x, "f2", vec![el("a"), el("b")]).await;

    let mut y = client(addr, user("uy", "Grace"), api.clone()).await;
    let y_store = open_synced(&mut y, "f2", vec![el("stale")]).await;

    assert!(eventually(|| ids(&y_store) == ["a", "b"]).await);
    assert_eq!(ids(&x_store), vec!["a", "b"]);

    x.shutdown().await.unwrap();
    y.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_edits_from_both_sides_converge() {
    let addr = start_relay().await;
    let api = Arc::new(RecordingApi::default());
    let mut x = client(addr, user("ux", "Ada"), api.clone()).await;
    let mut y = client(addr, user("uy", "Grace"), api.clone()).await;
    let x_store = open_synced(&mut x, "f3", vec![]).await;
    let y_store = open_synced(&mut y, "f3", vec![]).await;

    x_store.push_element(el("a"));
    assert!(eventually(|| ids(&y_store) == ["a"]).await);

    y_store.update_element_property("a", "label", Value::String("Email".into())).unwrap();
    assert!(eventually(|| x_store.elements()[0].label == "Email").await);

    y_store.push_element(el("b"));
    x_store.push_element(el("c"));
    assert!(eventually(|| x_store.elements() == y_store.elements() && x_store.elements().len() >= 3).await);

    x.shutdown().await.unwrap();
    y.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_forms_do_not_leak_into_each_other() {
    let addr = start_relay().await;
    let api = Arc::new(RecordingApi::default());
    let mut x = client(addr, user("ux", "Ada"), api.clone()).await;
    let mut y = client(addr, user("uy", "Grace"), api.clone()).await;
    let x_store = open_synced(&mut x, "form-a", vec![]).await;
    let y_store = open_synced(&mut y, "form-b", vec![]).await;

    x_store.push_element(el("only-a"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(y_store.elements().is_empty());

    x.shutdown().await.unwrap();
    y.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_presence_follows_selection_and_leave() {
    let addr = start_relay().await;
    let api = Arc::new(RecordingApi::default());
    let mut x = client(addr, user("ux", "Ada"), api.clone()).await;
    let y = client(addr, user("uy", "Grace"), api.clone()).await;

    assert!(eventually(|| y.collaborators().len() == 1 && x.collaborators().len() == 1).await);
    assert_eq!(y.collaborators()[0].name, "Ada");

    let x_store = open_synced(&mut x, "f4", vec![]).await;
    let id = x_store.add_element(FieldType::Number);
    assert!(eventually(|| y.collaborator_editing(&id).is_some()).await);
    assert_eq!(y.collaborator_editing(&id).unwrap().id, "ux");

    x.select_node(Some("f4"), Some("Survey".into()));
    assert!(eventually(|| {
        y.collaborators()
            .first()
            .and_then(|c| c.selected_form_name.clone())
            .as_deref()
            == Some("Survey")
    })
    .await);

    x.shutdown().await.unwrap();
    assert!(eventually(|| y.collaborators().is_empty()).await);
    y.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_presence_expires_after_abrupt_drop() {
    let addr = start_relay().await;
    let api = Arc::new(RecordingApi::default());
    let fast = config(addr).with_awareness_timing(Duration::from_millis(100), Duration::from_millis(400));
    let x = CollabClient::with_identity(fast.clone(), "main", user("ux", "Ada"), api.clone());
    let y = CollabClient::with_identity(fast, "main", user("uy", "Grace"), api.clone());

    assert!(eventually(|| y.collaborators().len() == 1).await);

    // Renewals keep a live peer around past the timeout
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(y.collaborators().len(), 1);

    drop(x);
    assert!(eventually(|| y.collaborators().is_empty()).await);
    y.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_same_user_in_two_tabs_is_not_a_collaborator() {
    let addr = start_relay().await;
    let api = Arc::new(RecordingApi::default());
    let tab1 = client(addr, user("ux", "Ada"), api.clone()).await;
    let tab2 = client(addr, user("ux", "Ada"), api.clone()).await;
    let other = client(addr, user("uy", "Grace"), api.clone()).await;

    assert!(eventually(|| other.collaborators().len() == 2).await);
    assert!(eventually(|| tab1.collaborators().len() == 1).await);
    assert_eq!(tab2.collaborators().len(), 1);
    assert_eq!(tab1.collaborators()[0].id, "uy");

    tab1.shutdown().await.unwrap();
    tab2.shutdown().await.unwrap();
    other.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_offline_edits_cross_after_reconnect() {
    let addr = start_relay().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let proxy = start_proxy(listener, addr);

    let api = Arc::new(RecordingApi::default());
    let mut x = client(proxy_addr, user("ux", "Ada"), api.clone()).await;
    let mut y = client(addr, user("uy", "Grace"), api.clone()).await;
    let x_store = open_synced(&mut x, "f5", vec![]).await;
    let y_store = open_synced(&mut y, "f5", vec![]).await;
    let status = || x.sessions().get("f5").unwrap().provider().unwrap().status();

    x_store.push_element(el("a"));
    assert!(eventually(|| ids(&y_store) == ["a"]).await);

    // Cut X off from the relay
    proxy.abort();
    let _ = proxy.await;
    assert!(eventually(|| status() != ConnectionStatus::Connected).await);

    x_store.push_element(el("x-offline"));
    y_store.push_element(el("y-offline"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!ids(&y_store).contains(&"x-offline".to_string()));
    assert!(!ids(&x_store).contains(&"y-offline".to_string()));

    let proxy = start_proxy(rebind(proxy_addr).await, addr);
    assert!(eventually(|| status() == ConnectionStatus::Connected).await);
    assert!(eventually(|| x.sessions().get("f5").unwrap().document().is_synced()).await);

    assert!(eventually(|| {
        let x_ids = ids(&x_store);
        x_ids.contains(&"x-offline".to_string()) && x_ids.contains(&"y-offline".to_string())
    })
    .await);
    assert!(eventually(|| x_store.elements() == y_store.elements()).await);

    // Still live after the reconnect
    y_store.push_element(el("after"));
    assert!(eventually(|| ids(&x_store).contains(&"after".to_string())).await);
    assert!(eventually(|| x_store.elements() == y_store.elements()).await);

    x.shutdown().await.unwrap();
    y.shutdown().await.unwrap();
    proxy.abort();
}
