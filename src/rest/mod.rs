//! Platform REST access used by the dispatch core.
//!
//! Only what the core consumes: authentication and org resolution, and the
//! definitions (actions, functions, low-code destinations, fields) that
//! drive subscriptions and event naming.

pub mod client;
pub mod mock;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

pub use client::RestClient;

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Organization not found: {0}")]
    OrgNotFound(String),

    #[error("User belongs to multiple organizations ({0}); set 'org' in the configuration")]
    AmbiguousOrg(String),

    #[error("User does not belong to any organization")]
    NoOrgs,

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Client configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RestError>;

/// The organization this process acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgContext {
    pub org_id: i64,
    pub org_name: String,
    pub actions_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(default)]
    pub input_type: String,
    #[serde(default)]
    pub text: String,
}

/// Definitions cached at startup and refreshed on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlatformMetadata {
    pub org_id: i64,
    pub actions_enabled: bool,
    /// Action id to display name.
    pub action_names: HashMap<i64, String>,
    /// Function name to the queue its invocations arrive on.
    pub function_destinations: HashMap<String, String>,
    /// Fully qualified low-code destinations.
    pub low_code_destinations: Vec<String>,
    pub incident_fields: HashMap<String, FieldDefinition>,
    pub action_fields: HashMap<String, FieldDefinition>,
}

/// REST operations the core needs from the platform.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Authenticate and resolve the organization.
    async fn connect(&self) -> Result<OrgContext>;

    /// GET a platform path (`/rest/...`) or absolute URL.
    async fn get(&self, path: &str) -> Result<Value>;

    /// POST JSON to a platform path or absolute URL.
    async fn post(&self, path: &str, body: &Value) -> Result<Value>;

    /// Drop the HTTP session; the next call re-authenticates.
    fn reset(&self);

    /// Time since the last request.
    fn idle_for(&self) -> Duration;
}

/// Pick the configured org by name, or the only one.
pub fn select_org(orgs: &Value, wanted: Option<&str>) -> Result<(i64, String)> {
    let orgs: Vec<(i64, String)> = orgs
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|org| {
                    Some((
                        org.get("id")?.as_i64()?,
                        org.get("name")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    match wanted.map(str::trim).filter(|w| !w.is_empty()) {
        Some(name) => orgs
            .into_iter()
            .find(|(_, org_name)| org_name == name)
            .ok_or_else(|| RestError::OrgNotFound(name.to_string())),
        None => match orgs.len() {
            0 => Err(RestError::NoOrgs),
            1 => Ok(orgs.into_iter().next().ok_or(RestError::NoOrgs)?),
            _ => Err(RestError::AmbiguousOrg(
                orgs.iter()
                    .map(|(_, name)| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        },
    }
}

/// List payloads come bare or wrapped in `{"entities": [...]}`.
fn entities(value: &Value) -> &[Value] {
    value
        .as_array()
        .or_else(|| value.get("entities").and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub async fn fetch_action_names(api: &dyn PlatformApi, org_id: i64) -> Result<HashMap<i64, String>> {
    let actions = api.get(&format!("/rest/orgs/{org_id}/actions")).await?;
    Ok(entities(&actions)
        .iter()
        .filter_map(|a| Some((a.get("id")?.as_i64()?, a.get("name")?.as_str()?.to_string())))
        .collect())
}

async fn fetch_fields(
    api: &dyn PlatformApi,
    org_id: i64,
    type_name: &str,
) -> Result<HashMap<String, FieldDefinition>> {
    let fields = api
        .get(&format!("/rest/orgs/{org_id}/types/{type_name}/fields"))
        .await?;
    Ok(entities(&fields)
        .iter()
        .filter_map(|f| serde_json::from_value::<FieldDefinition>(f.clone()).ok())
        .map(|f| (f.name.clone(), f))
        .collect())
}

/// Warm the metadata cache for `org`.
pub async fn load_metadata(api: &dyn PlatformApi, org: &OrgContext) -> Result<PlatformMetadata> {
    let org_id = org.org_id;
    let action_names = fetch_action_names(api, org_id).await?;

    let functions = api.get(&format!("/rest/orgs/{org_id}/functions")).await?;
    let function_destinations = entities(&functions)
        .iter()
        .filter_map(|f| {
            let name = f.get("name")?.as_str()?.to_string();
            let destination = match f.get("destination_handle")? {
                Value::String(handle) => handle.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some((name, destination))
        })
        .collect();

    let low_code = api
        .get(&format!("/rest/orgs/{org_id}/low_code/destinations"))
        .await?;
    let low_code_destinations = entities(&low_code)
        .iter()
        .filter_map(|d| d.get("name")?.as_str().map(str::to_string))
        .collect();

    let metadata = PlatformMetadata {
        org_id,
        actions_enabled: org.actions_enabled,
        action_names,
        function_destinations,
        low_code_destinations,
        incident_fields: fetch_fields(api, org_id, "incident").await?,
        action_fields: fetch_fields(api, org_id, "actioninvocation").await?,
    };
    info!(
        org_id,
        actions = metadata.action_names.len(),
        functions = metadata.function_destinations.len(),
        low_code = metadata.low_code_destinations.len(),
        "Platform metadata loaded"
    );
    Ok(metadata)
}

/// Shared, swappable metadata snapshot.
#[derive(Debug, Clone, Default)]
pub struct MetadataCache {
    inner: Arc<RwLock<Arc<PlatformMetadata>>>,
}

impl MetadataCache {
    pub fn new(metadata: PlatformMetadata) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(metadata))),
        }
    }

    pub fn get(&self) -> Arc<PlatformMetadata> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, metadata: PlatformMetadata) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(metadata);
    }

    pub fn set_action_names(&self, names: HashMap<i64, String>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut metadata = (**guard).clone();
        debug!(count = names.len(), "Action definitions refreshed");
        metadata.action_names = names;
        *guard = Arc::new(metadata);
    }
}
