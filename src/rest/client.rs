//! reqwest-backed platform client.
//!
//! User/password logins get a cookie session plus the `X-sess-id` CSRF
//! header; API keys use basic auth on every request. A 401 triggers one
//! re-authentication and a single retry.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::{select_org, OrgContext, PlatformApi, RestError, Result};
use crate::config::{ConnectorOptions, NO_VERIFY};
use crate::stomp::{Credentials, ProxyConfig, TlsTrust};

const CSRF_HEADER: &str = "X-sess-id";

/// Connection settings for [`RestClient`].
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// Scheme, host and port, e.g. `https://platform.example:443`.
    pub base_url: String,
    pub credentials: Credentials,
    pub org: Option<String>,
    pub trust: TlsTrust,
    pub proxy: Option<ProxyConfig>,
    pub timeout: Duration,
}

impl RestClientConfig {
    pub fn from_options(options: &ConnectorOptions) -> crate::config::Result<Self> {
        let trust = match options.cafile.as_deref() {
            None | Some("") => TlsTrust::WebPki,
            Some(value) if value.eq_ignore_ascii_case(NO_VERIFY) => TlsTrust::NoVerification,
            Some(path) => TlsTrust::CaFile(path.into()),
        };
        Ok(Self {
            base_url: format!("https://{}:{}", options.host, options.port),
            credentials: options.credentials()?,
            org: options.org.clone(),
            trust,
            proxy: options.proxy(),
            timeout: Duration::from_secs(options.stomp_timeout.max(1)),
        })
    }
}

struct SessionState {
    http: Client,
    csrf: Option<String>,
    authenticated: bool,
}

pub struct RestClient {
    config: RestClientConfig,
    state: Mutex<SessionState>,
    last_used: Mutex<Instant>,
}

impl RestClient {
    pub fn new(config: RestClientConfig) -> Result<Self> {
        let http = build_http(&config)?;
        Ok(Self {
            config,
            state: Mutex::new(SessionState {
                http,
                csrf: None,
                authenticated: false,
            }),
            last_used: Mutex::new(Instant::now()),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// One request, no retry.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let (http, csrf) = {
            let state = self.state();
            (state.http.clone(), state.csrf.clone())
        };
        let mut request = http.request(method, url);
        match &self.config.credentials {
            Credentials::ApiKey { id, secret } => {
                request = request.basic_auth(id, Some(secret));
            }
            Credentials::UserPassword { .. } => {
                if let Some(token) = csrf {
                    request = request.header(CSRF_HEADER, token);
                }
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        self.touch();
        Ok(request.send().await?)
    }

    async fn authenticate(&self) -> Result<OrgContext> {
        let url = self.url("/rest/session");
        let response = match &self.config.credentials {
            Credentials::ApiKey { .. } => self.execute(Method::GET, &url, None).await?,
            Credentials::UserPassword { user, password } => {
                let login = json!({"email": user, "password": password, "interactive": false});
                self.execute(Method::POST, &url, Some(&login)).await?
            }
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, "Platform authentication failed");
            return Err(RestError::Auth(format!("{status}: {body}")));
        }
        let session: Value = response
            .json()
            .await
            .map_err(|e| RestError::Decode(format!("session: {e}")))?;

        let (org_id, org_name) = select_org(
            session.get("orgs").unwrap_or(&Value::Null),
            self.config.org.as_deref(),
        )?;
        {
            let mut state = self.state();
            state.csrf = session
                .get("csrf_token")
                .and_then(Value::as_str)
                .map(str::to_string);
            state.authenticated = true;
        }

        let org_url = self.url(&format!("/rest/orgs/{org_id}"));
        let org = read_json("GET", &org_url, self.execute(Method::GET, &org_url, None).await?).await?;
        let actions_enabled = org
            .get("actions_framework_enabled")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        info!(org_id, org = %org_name, actions_enabled, "Authenticated with platform");
        Ok(OrgContext {
            org_id,
            org_name,
            actions_enabled,
        })
    }

    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.url(path);
        if !self.state().authenticated {
            self.authenticate().await?;
        }
        let mut response = self.execute(method.clone(), &url, body).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %url, "Session rejected, re-authenticating");
            self.authenticate().await?;
            response = self.execute(method.clone(), &url, body).await?;
        }
        read_json(method.as_str(), &url, response).await
    }
}

async fn read_json(method: &str, url: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(RestError::Status {
            method: method.to_string(),
            url: url.to_string(),
            status: status.as_u16(),
            body: text.chars().take(200).collect(),
        });
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| RestError::Decode(format!("{url}: {e}")))
}

fn build_http(config: &RestClientConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .cookie_store(true)
        .timeout(config.timeout);

    match &config.trust {
        TlsTrust::WebPki => {}
        TlsTrust::NoVerification => {
            warn!("Platform certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        TlsTrust::CaFile(path) => {
            let pem = std::fs::read(path)
                .map_err(|e| RestError::Config(format!("{}: {e}", path.display())))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
    }

    if let Some(proxy) = &config.proxy {
        let mut p = reqwest::Proxy::all(format!("http://{}:{}", proxy.host, proxy.port))?;
        if let Some(user) = &proxy.user {
            p = p.basic_auth(user, proxy.password.as_deref().unwrap_or(""));
        }
        builder = builder.proxy(p);
    }

    Ok(builder.build()?)
}

#[async_trait]
impl PlatformApi for RestClient {
    async fn connect(&self) -> Result<OrgContext> {
        self.authenticate().await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    fn reset(&self) {
        match build_http(&self.config) {
            Ok(http) => {
                let mut state = self.state();
                state.http = http;
                state.csrf = None;
                state.authenticated = false;
                debug!("REST session reset");
            }
            Err(e) => error!(error = %e, "Failed to rebuild REST client"),
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}
