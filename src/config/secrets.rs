//! Secret placeholder substitution.
//!
//! `$NAME` and `${NAME}` resolve to a protected secret (container mode only)
//! and then to the environment. `^NAME` and `^{NAME}` go to the PAM plugin.
//! Placeholders that resolve to nothing are left as written.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::jwe::{decrypt_compact, Jwk};
use super::{ConfigError, CONTAINER_ENV_VAR};

/// Directory holding protected secrets in container mode.
pub const SECRETS_DIR: &str = "/etc/secrets";
/// Key file inside the secrets directory.
pub const JWK_FILE: &str = "key.jwk";

/// External privileged-access-management lookup for `^` placeholders.
pub trait PamPlugin: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct SecretResolver {
    secrets_dir: Option<PathBuf>,
    pam: Option<Arc<dyn PamPlugin>>,
    env: EnvLookup,
}

impl fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretResolver")
            .field("secrets_dir", &self.secrets_dir)
            .field("pam", &self.pam.is_some())
            .finish()
    }
}

impl Default for SecretResolver {
    fn default() -> Self {
        Self {
            secrets_dir: None,
            pam: None,
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }
}

impl SecretResolver {
    /// Resolver for the current process: protected secrets only when
    /// `APP_HOST_CONTAINER` is set.
    pub fn from_env() -> Self {
        let mut resolver = Self::default();
        if std::env::var_os(CONTAINER_ENV_VAR).is_some() {
            resolver.secrets_dir = Some(PathBuf::from(SECRETS_DIR));
        }
        resolver
    }

    pub fn with_secrets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.secrets_dir = Some(dir.into());
        self
    }

    pub fn with_pam(mut self, pam: Arc<dyn PamPlugin>) -> Self {
        self.pam = Some(pam);
        self
    }

    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    /// Substitute every placeholder in `value`.
    pub fn resolve(&self, value: &str) -> Result<String, ConfigError> {
        if let Some(name) = value.strip_prefix('$').filter(|n| is_name(n)) {
            return Ok(self.lookup(name)?.unwrap_or_else(|| value.to_string()));
        }
        if let Some(rest) = value.strip_prefix('^') {
            let name = rest
                .strip_prefix('{')
                .and_then(|r| r.strip_suffix('}'))
                .unwrap_or(rest);
            if is_name(name) {
                return Ok(self.pam_lookup(name).unwrap_or_else(|| value.to_string()));
            }
        }
        self.substitute_braced(value)
    }

    fn substitute_braced(&self, value: &str) -> Result<String, ConfigError> {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) if is_name(&after[..end]) => {
                    match self.lookup(&after[..end])? {
                        Some(secret) => out.push_str(&secret),
                        None => out.push_str(&rest[start..start + 3 + end]),
                    }
                    rest = &after[end + 1..];
                }
                _ => {
                    out.push_str("${");
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    fn lookup(&self, name: &str) -> Result<Option<String>, ConfigError> {
        if let Some(dir) = &self.secrets_dir {
            let path = dir.join(name);
            if path.is_file() {
                debug!(secret = %name, "Using protected secret");
                return read_protected(dir, &path).map(Some);
            }
        }
        let value = (self.env)(name);
        if value.is_none() {
            warn!(placeholder = %name, "Secret placeholder not resolved");
        }
        Ok(value)
    }

    fn pam_lookup(&self, name: &str) -> Option<String> {
        let Some(pam) = &self.pam else {
            warn!(placeholder = %name, "No PAM plugin configured");
            return None;
        };
        pam.get(name)
    }
}

fn read_protected(dir: &Path, path: &Path) -> Result<String, ConfigError> {
    let jwk = Jwk::from_json(&std::fs::read_to_string(dir.join(JWK_FILE))?)?;
    let token = std::fs::read_to_string(path)?;
    let plaintext = decrypt_compact(&token, &jwk)?;
    String::from_utf8(plaintext).map_err(|_| ConfigError::Invalid {
        name: "protected secret",
        reason: format!("{} is not UTF-8", path.display()),
    })
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether a value still looks like an unresolved placeholder.
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    value.contains("${")
        || value.strip_prefix('$').is_some_and(is_name)
        || value
            .strip_prefix('^')
            .map(|r| r.trim_start_matches('{').trim_end_matches('}'))
            .is_some_and(is_name)
}
