//! Auth provider configuration stored at `auth/auth-config.json`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{BaseFsHandle, FsError, AUTH_CONFIG_FILE};

/// Default session lifetime when the config does not set one.
pub const DEFAULT_SESSION_TIMEOUT_HOURS: u32 = 48;

/// Settings for how operator authorization is configured. A missing config
/// file loads as the default with an empty `auth_type`, which `serve`
/// treats as "not initialized".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type", default)]
    pub auth_type: String,

    /// Session lifetime; zero means "use the default of 48 hours".
    #[serde(default)]
    pub session_timeout_hours: u32,

    /// Scope names granted to users the provider creates on first login.
    #[serde(default)]
    pub new_user_default_scopes: Vec<String>,

    /// Provider-specific settings, passed through opaquely.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AuthConfig {
    #[must_use]
    pub fn session_timeout_hours(&self) -> u32 {
        if self.session_timeout_hours == 0 {
            DEFAULT_SESSION_TIMEOUT_HOURS
        } else {
            self.session_timeout_hours
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthFsHandle {
    base: BaseFsHandle,
}

impl AuthFsHandle {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            base: BaseFsHandle::new(root),
        }
    }

    /// Loads the auth configuration; a missing file yields the default.
    pub fn auth_config(&self) -> Result<AuthConfig, FsError> {
        let content = self.base.read_file(AUTH_CONFIG_FILE, true)?;
        if content.is_empty() {
            return Ok(AuthConfig::default());
        }
        serde_json::from_str(&content).map_err(|e| FsError::Malformed {
            path: self.base.path(AUTH_CONFIG_FILE),
            detail: format!("unable to parse auth config: {e}"),
        })
    }

    pub fn save_auth_config(&self, cfg: &AuthConfig) -> Result<(), FsError> {
        let data = serde_json::to_string_pretty(cfg).map_err(|e| FsError::Malformed {
            path: self.base.path(AUTH_CONFIG_FILE),
            detail: format!("unable to serialize auth config: {e}"),
        })?;
        self.base
            .write_file(AUTH_CONFIG_FILE, data.as_bytes(), 0o640)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let auth = AuthFsHandle::new(dir.path().to_path_buf());

        let cfg = auth.auth_config().unwrap();
        assert_eq!(cfg.auth_type, "");
        assert_eq!(cfg.session_timeout_hours(), DEFAULT_SESSION_TIMEOUT_HOURS);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let auth = AuthFsHandle::new(dir.path().to_path_buf());

        let cfg = AuthConfig {
            auth_type: "local".into(),
            session_timeout_hours: 12,
            new_user_default_scopes: vec!["devices:read".into()],
            config: serde_json::json!({"MinPasswordLength": 8}),
        };
        auth.save_auth_config(&cfg).unwrap();

        let loaded = auth.auth_config().unwrap();
        assert_eq!(loaded.auth_type, "local");
        assert_eq!(loaded.session_timeout_hours(), 12);
        assert_eq!(loaded.new_user_default_scopes, vec!["devices:read"]);
    }
}
