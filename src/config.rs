use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::Error;

const DEFAULT_API_URL: &str = "http://localhost:3001";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOGIN_PATH: &str = "/admin/login";
const DEFAULT_ADMIN_HOME_PATH: &str = "/admin";

/// Which token the request pipeline attaches to authenticated calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenMode {
    /// Fresh identity-provider token, refreshable on `401`.
    #[default]
    Identity,
    /// Backend-issued token kept under `authToken` in the local store.
    /// Cannot be refreshed: a `401` invalidates the session directly.
    StoredBackendToken,
}

impl FromStr for TokenMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Self::Identity),
            "backend" | "legacy" => Ok(Self::StoredBackendToken),
            other => Err(Error::Configuration(format!(
                "AUTH_TOKEN_MODE: unknown mode '{other}'"
            ))),
        }
    }
}

/// Hosted identity-provider project settings.
///
/// Required fields are constructor parameters; optional ones use `with_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct IdentityConfig {
    pub api_key: String,
    pub auth_domain: String,
    pub project_id: String,
    pub storage_bucket: Option<String>,
    pub messaging_sender_id: Option<String>,
    pub app_id: Option<String>,
    pub measurement_id: Option<String>,
}

impl IdentityConfig {
    #[must_use]
    pub fn new(
        api_key: impl Into<String>,
        auth_domain: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            auth_domain: auth_domain.into(),
            project_id: project_id.into(),
            storage_bucket: None,
            messaging_sender_id: None,
            app_id: None,
            measurement_id: None,
        }
    }

    #[must_use]
    pub fn with_storage_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.storage_bucket = Some(bucket.into());
        self
    }

    #[must_use]
    pub fn with_messaging_sender_id(mut self, id: impl Into<String>) -> Self {
        self.messaging_sender_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_app_id(mut self, id: impl Into<String>) -> Self {
        self.app_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_measurement_id(mut self, id: impl Into<String>) -> Self {
        self.measurement_id = Some(id.into());
        self
    }
}

/// Identity configuration as found in the environment.
///
/// Missing required values do not fail construction: a build step or a
/// health check can still load the config. [`require`](Self::require) fails
/// the first time a live sign-in actually needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySettings {
    Configured(IdentityConfig),
    Unconfigured { missing: Vec<&'static str> },
}

impl IdentitySettings {
    /// Read identity settings from the environment.
    ///
    /// # Required env vars
    /// - `IDENTITY_API_KEY`
    /// - `IDENTITY_AUTH_DOMAIN`
    /// - `IDENTITY_PROJECT_ID`
    ///
    /// # Optional env vars
    /// - `IDENTITY_STORAGE_BUCKET`
    /// - `IDENTITY_MESSAGING_SENDER_ID`
    /// - `IDENTITY_APP_ID`
    /// - `IDENTITY_MEASUREMENT_ID`
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = lookup("IDENTITY_API_KEY");
        let auth_domain = lookup("IDENTITY_AUTH_DOMAIN");
        let project_id = lookup("IDENTITY_PROJECT_ID");

        let (Some(api_key), Some(auth_domain), Some(project_id)) =
            (api_key.clone(), auth_domain.clone(), project_id.clone())
        else {
            let missing: Vec<&'static str> = [
                ("IDENTITY_API_KEY", api_key.is_none()),
                ("IDENTITY_AUTH_DOMAIN", auth_domain.is_none()),
                ("IDENTITY_PROJECT_ID", project_id.is_none()),
            ]
            .into_iter()
            .filter_map(|(key, absent)| absent.then_some(key))
            .collect();
            tracing::warn!(missing = ?missing, "Identity provider is not fully configured");
            return Self::Unconfigured { missing };
        };

        let mut config = IdentityConfig::new(api_key, auth_domain, project_id);
        config.storage_bucket = lookup("IDENTITY_STORAGE_BUCKET");
        config.messaging_sender_id = lookup("IDENTITY_MESSAGING_SENDER_ID");
        config.app_id = lookup("IDENTITY_APP_ID");
        config.measurement_id = lookup("IDENTITY_MEASUREMENT_ID");
        Self::Configured(config)
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Configured(_))
    }

    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the missing variables.
    pub fn require(&self) -> Result<&IdentityConfig, Error> {
        match self {
            Self::Configured(config) => Ok(config),
            Self::Unconfigured { missing } => Err(Error::Configuration(format!(
                "identity provider is not configured (missing {})",
                missing.join(", ")
            ))),
        }
    }
}

/// Client-side session configuration.
///
/// Use [`from_env()`](ClientConfig::from_env) for convention-based setup,
/// or [`new()`](ClientConfig::new) with `with_*` methods for full control.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) api_url: Url,
    pub(crate) timeout: Duration,
    pub(crate) login_path: String,
    pub(crate) admin_home_path: String,
    pub(crate) token_mode: TokenMode,
    pub(crate) identity: IdentitySettings,
}

impl ClientConfig {
    #[must_use]
    pub fn new(api_url: Url, identity: IdentitySettings) -> Self {
        Self {
            api_url,
            identity,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            login_path: DEFAULT_LOGIN_PATH.into(),
            admin_home_path: DEFAULT_ADMIN_HOME_PATH.into(),
            token_mode: TokenMode::default(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Optional env vars
    /// - `API_URL`: backend base URL (default `http://localhost:3001`)
    /// - `API_TIMEOUT_SECS`: outbound request timeout (default `30`)
    /// - `LOGIN_PATH`: login entry page (default `/admin/login`)
    /// - `ADMIN_HOME_PATH`: landing page after login (default `/admin`)
    /// - `AUTH_TOKEN_MODE`: `identity` (default) or `backend`
    ///
    /// Identity variables are read by [`IdentitySettings::from_env`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a value is present but malformed.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(env_lookup)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let api_url: Url = lookup("API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.into())
            .parse()
            .map_err(|e| Error::Configuration(format!("API_URL: {e}")))?;

        let mut config = Self::new(api_url, IdentitySettings::from_lookup(&lookup));

        if let Some(secs) = lookup("API_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|e| Error::Configuration(format!("API_TIMEOUT_SECS: {e}")))?;
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(path) = lookup("LOGIN_PATH") {
            config = config.with_login_path(path);
        }
        if let Some(path) = lookup("ADMIN_HOME_PATH") {
            config = config.with_admin_home_path(path);
        }
        if let Some(mode) = lookup("AUTH_TOKEN_MODE") {
            config = config.with_token_mode(mode.parse()?);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    #[must_use]
    pub fn with_admin_home_path(mut self, path: impl Into<String>) -> Self {
        self.admin_home_path = path.into();
        self
    }

    #[must_use]
    pub fn with_token_mode(mut self, mode: TokenMode) -> Self {
        self.token_mode = mode;
        self
    }

    #[must_use]
    pub fn with_identity(mut self, identity: IdentitySettings) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn admin_home_path(&self) -> &str {
        &self.admin_home_path
    }

    #[must_use]
    pub fn token_mode(&self) -> TokenMode {
        self.token_mode
    }

    #[must_use]
    pub fn identity(&self) -> &IdentitySettings {
        &self.identity
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
