//! Client for the external forms API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::form::{FormElement, FormId};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid form payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// A form as returned by the forms API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredForm {
    pub id: FormId,
    pub name: String,
    /// Element list, either as a JSON array or as a string holding one
    #[serde(default)]
    pub layout: Value,
    #[serde(default)]
    pub schema: Value,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl StoredForm {
    /// Decode `layout` into elements; anything other than an array is empty
    pub fn elements(&self) -> PersistenceResult<Vec<FormElement>> {
        let layout = match &self.layout {
            Value::String(raw) => serde_json::from_str(raw)?,
            other => other.clone(),
        };
        match layout {
            Value::Array(_) => Ok(serde_json::from_value(layout)?),
            _ => Ok(Vec::new()),
        }
    }
}

/// Durable storage for form content
#[async_trait]
pub trait PersistenceApi: Send + Sync + 'static {
    /// Autosave path: `PUT {elements}`
    async fn save_elements(&self, form_id: &str, elements: &[FormElement]) -> PersistenceResult<()>;

    /// Whole-form save path: `PUT {layout, schema}`
    async fn save_form(&self, form_id: &str, layout: &[FormElement], schema: Value)
        -> PersistenceResult<StoredForm>;

    async fn load_form(&self, form_id: &str) -> PersistenceResult<StoredForm>;
}

/// [`PersistenceApi`] over HTTP against `<base>/api/forms/<id>`
#[derive(Debug, Clone)]
pub struct HttpPersistence {
    client: Client,
    base_url: String,
}

impl HttpPersistence {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn form_url(&self, form_id: &str) -> String {
        format!("{}/api/forms/{}", self.base_url, form_id)
    }

    async fn put(&self, form_id: &str, body: Value) -> PersistenceResult<reqwest::Response> {
        let url = self.form_url(form_id);
        debug!("PUT {}", url);
        let resp = self.client.put(&url).json(&body).send().await?;
        check_status(resp).await
    }
}

#[async_trait]
impl PersistenceApi for HttpPersistence {
    async fn save_elements(&self, form_id: &str, elements: &[FormElement]) -> PersistenceResult<()> {
        self.put(form_id, json!({ "elements": elements })).await?;
        Ok(())
    }

    async fn save_form(
        &self,
        form_id: &str,
        layout: &[FormElement],
        schema: Value,
    ) -> PersistenceResult<StoredForm> {
        let resp = self
            .put(form_id, json!({ "layout": layout, "schema": schema }))
            .await?;
        Ok(resp.json().await?)
    }

    async fn load_form(&self, form_id: &str) -> PersistenceResult<StoredForm> {
        let url = self.form_url(form_id);
        debug!("GET {}", url);
        let resp = check_status(self.client.get(&url).send().await?).await?;
        Ok(resp.json().await?)
    }
}

async fn check_status(resp: reqwest::Response) -> PersistenceResult<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(PersistenceError::Status { status, body })
}
