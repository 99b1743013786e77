//! Application configuration.
//!
//! Options live in the `[resilient]` section of an INI `app.config` file.
//! Every other section is kept as a string map for the app's own handlers.
//! Values may carry secret placeholders (see [`secrets`]), resolved after
//! loading.

pub mod jwe;
pub mod secrets;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::DEFAULT_NUM_WORKERS;
use crate::stomp::{Credentials, ProxyConfig, SessionConfig, TlsTrust, DEFAULT_STOMP_PORT};
use secrets::{is_placeholder, SecretResolver};

pub use jwe::JweError;

/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "APP_CONFIG_FILE";
/// Prefix for configuration environment variables (`APP__RESILIENT__HOST`).
pub const CONFIG_ENV_PREFIX: &str = "APP";
/// Set when running inside an app host container.
pub const CONTAINER_ENV_VAR: &str = "APP_HOST_CONTAINER";
/// Section holding the connector options.
pub const CONNECTOR_SECTION: &str = "resilient";
/// Default configuration file, relative to the home directory.
pub const DEFAULT_CONFIG_FILE: &str = ".resilient/app.config";
/// Upper bound for `num_workers`.
pub const MAX_NUM_WORKERS: usize = 500;
/// Trust-store value that disables certificate verification.
pub const NO_VERIFY: &str = "false";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing required option: {0}")]
    Missing(&'static str),

    #[error("Invalid option {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("Unresolved secret placeholder in option {0}")]
    UnresolvedSecret(&'static str),

    #[error("Protected secret error: {0}")]
    Secret(#[from] JweError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Connector options from the `[resilient]` section.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorOptions {
    /// Platform REST host.
    pub host: String,
    pub port: u16,
    /// Organization name; optional when the user belongs to one org.
    pub org: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub api_key_id: Option<String>,
    pub api_key_secret: Option<String>,
    /// Trust store for REST and, unless overridden, the broker. `false` disables verification.
    pub cafile: Option<String>,
    pub stomp_host: Option<String>,
    pub stomp_port: u16,
    pub stomp_cafile: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
    /// Connect and connected timeouts, seconds.
    pub stomp_timeout: u64,
    /// Retry bound for failed acks and replies; 0 retries forever.
    pub stomp_max_retries: u32,
    pub stomp_prefetch_limit: u32,
    /// Seconds between delivery retry passes.
    pub stomp_timer_interval: u64,
    pub stomp_reconnect_delay: u64,
    pub stomp_max_connection_errors: u32,
    /// Comma-separated broker error substrings that end the process.
    pub stomp_unrecoverable_errors: String,
    pub stomp_client_heartbeat_ms: u64,
    pub stomp_server_heartbeat_ms: u64,
    pub num_workers: usize,
    pub ignore_message_failure: bool,
    /// Seconds; unset disables the check.
    pub heartbeat_timeout_threshold: Option<u64>,
    /// Zero or negative retries forever.
    pub max_connection_retries: i32,
    pub include_stack_trace: bool,
    /// Minutes of REST inactivity before the client session is dropped.
    pub rest_idle_reset_minutes: u64,
    pub test_actions: bool,
    pub test_host: String,
    pub test_port: u16,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 443,
            org: None,
            email: None,
            password: None,
            api_key_id: None,
            api_key_secret: None,
            cafile: None,
            stomp_host: None,
            stomp_port: DEFAULT_STOMP_PORT,
            stomp_cafile: None,
            proxy_host: None,
            proxy_port: None,
            proxy_user: None,
            proxy_password: None,
            stomp_timeout: 60,
            stomp_max_retries: 3,
            stomp_prefetch_limit: 20,
            stomp_timer_interval: 60,
            stomp_reconnect_delay: 60,
            stomp_max_connection_errors: 3,
            stomp_unrecoverable_errors: "already subscribed".to_string(),
            stomp_client_heartbeat_ms: 0,
            stomp_server_heartbeat_ms: 15_000,
            num_workers: DEFAULT_NUM_WORKERS,
            ignore_message_failure: false,
            heartbeat_timeout_threshold: None,
            max_connection_retries: 0,
            include_stack_trace: true,
            rest_idle_reset_minutes: 10,
            test_actions: false,
            test_host: "localhost".to_string(),
            test_port: 8008,
        }
    }
}

impl std::fmt::Debug for ConnectorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("org", &self.org)
            .field("email", &self.email)
            .field("api_key_id", &self.api_key_id)
            .field("stomp_host", &self.stomp_host)
            .field("stomp_port", &self.stomp_port)
            .field("num_workers", &self.num_workers)
            .field("test_actions", &self.test_actions)
            .finish_non_exhaustive()
    }
}

impl ConnectorOptions {
    /// Credentials, API key preferred.
    pub fn credentials(&self) -> Result<Credentials> {
        match (&self.api_key_id, &self.api_key_secret, &self.email, &self.password) {
            (Some(id), Some(secret), _, _) if !id.is_empty() => Ok(Credentials::ApiKey {
                id: id.clone(),
                secret: secret.clone(),
            }),
            (_, _, Some(user), Some(password)) if !user.is_empty() => {
                Ok(Credentials::UserPassword {
                    user: user.clone(),
                    password: password.clone(),
                })
            }
            _ => Err(ConfigError::Missing(
                "api_key_id/api_key_secret or email/password",
            )),
        }
    }

    pub fn tls_trust(&self) -> TlsTrust {
        match self.stomp_cafile.as_deref().or(self.cafile.as_deref()) {
            None | Some("") => TlsTrust::WebPki,
            Some(value) if value.eq_ignore_ascii_case(NO_VERIFY) => TlsTrust::NoVerification,
            Some(path) => TlsTrust::CaFile(PathBuf::from(path)),
        }
    }

    pub fn proxy(&self) -> Option<ProxyConfig> {
        let host = self.proxy_host.as_ref().filter(|h| !h.is_empty())?;
        Some(ProxyConfig {
            host: host.clone(),
            port: self.proxy_port.unwrap_or(3128),
            user: self.proxy_user.clone().filter(|u| !u.is_empty()),
            password: self.proxy_password.clone(),
        })
    }

    pub fn unrecoverable_errors(&self) -> Vec<String> {
        self.stomp_unrecoverable_errors
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.stomp_timer_interval.max(1))
    }

    pub fn idle_reset(&self) -> Duration {
        Duration::from_secs(self.rest_idle_reset_minutes * 60)
    }

    /// Connection settings for a new broker session.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let host = self
            .stomp_host
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.host.clone());
        let timeout = Duration::from_secs(self.stomp_timeout);
        let mut config = SessionConfig::new(host, self.stomp_port, self.credentials()?);
        config.tls = self.tls_trust();
        config.proxy = self.proxy();
        config.client_heartbeat = Duration::from_millis(self.stomp_client_heartbeat_ms);
        config.server_heartbeat = Duration::from_millis(self.stomp_server_heartbeat_ms);
        config.connect_timeout = timeout;
        config.connected_timeout = timeout;
        config.reconnect_delay = Duration::from_secs(self.stomp_reconnect_delay);
        config.max_connection_retries = self.max_connection_retries;
        config.max_connection_errors = self.stomp_max_connection_errors;
        config.unrecoverable_errors = self.unrecoverable_errors();
        config.heartbeat_timeout_threshold =
            self.heartbeat_timeout_threshold.map(Duration::from_secs);
        config.prefetch_limit = Some(self.stomp_prefetch_limit);
        Ok(config)
    }

    fn resolve_secrets(&mut self, resolver: &SecretResolver) -> Result<()> {
        let fields: [&mut Option<String>; 8] = [
            &mut self.org,
            &mut self.email,
            &mut self.password,
            &mut self.api_key_id,
            &mut self.api_key_secret,
            &mut self.proxy_host,
            &mut self.proxy_user,
            &mut self.proxy_password,
        ];
        for field in fields {
            if let Some(value) = field.as_mut() {
                *value = resolver.resolve(value)?;
            }
        }
        self.host = resolver.resolve(&self.host)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Missing("host"));
        }
        let credentials = self.credentials()?;
        let (login, secret) = credentials.login();
        let (login_name, secret_name) = match credentials {
            Credentials::ApiKey { .. } => ("api_key_id", "api_key_secret"),
            Credentials::UserPassword { .. } => ("email", "password"),
        };
        if is_placeholder(login) {
            return Err(ConfigError::UnresolvedSecret(login_name));
        }
        if is_placeholder(secret) {
            return Err(ConfigError::UnresolvedSecret(secret_name));
        }
        if self.num_workers == 0 || self.num_workers > MAX_NUM_WORKERS {
            return Err(ConfigError::Invalid {
                name: "num_workers",
                reason: format!("must be between 1 and {MAX_NUM_WORKERS}"),
            });
        }
        if let TlsTrust::CaFile(path) = self.tls_trust() {
            if !path.is_file() {
                return Err(ConfigError::Invalid {
                    name: "cafile",
                    reason: format!("{} does not exist", path.display()),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    resilient: ConnectorOptions,
    #[serde(flatten)]
    sections: HashMap<String, HashMap<String, String>>,
}

/// Main application configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub options: ConnectorOptions,
    /// Every other section, for the app's handlers.
    pub sections: HashMap<String, HashMap<String, String>>,
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `path` argument, else `APP_CONFIG_FILE`, else `~/.resilient/app.config` if present
    /// 2. `APP__<SECTION>__<KEY>` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, &SecretResolver::from_env())
    }

    pub fn load_with(path: Option<&Path>, resolver: &SecretResolver) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let (path, required) = match path {
            Some(p) => (Some(p.to_path_buf()), true),
            None => match std::env::var(CONFIG_ENV_VAR) {
                Ok(p) => (Some(PathBuf::from(p)), true),
                Err(_) => (
                    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(DEFAULT_CONFIG_FILE)),
                    false,
                ),
            },
        };

        let mut builder = ConfigLib::builder();
        if let Some(path) = &path {
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(FileFormat::Ini)
                    .required(required),
            );
        }
        let raw: RawConfig = builder
            .add_source(Environment::with_prefix(CONFIG_ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        let mut options = raw.resilient;
        options.resolve_secrets(resolver)?;

        let mut sections = raw.sections;
        sections.remove(CONNECTOR_SECTION);
        for values in sections.values_mut() {
            for value in values.values_mut() {
                *value = resolver.resolve(value)?;
            }
        }

        options.validate()?;
        Ok(Self {
            options,
            sections,
            path,
        })
    }

    /// Options of an app section.
    pub fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(name)
    }
}
