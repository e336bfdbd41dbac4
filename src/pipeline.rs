//! Authenticated request pipeline.
//!
//! Every authenticated call carries the freshest token the identity client
//! has. A `401` on a call that carried a token triggers exactly one forced
//! refresh and one replay; anything else is classified and returned.

use std::sync::{Arc, PoisonError, RwLock};

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use url::Url;

use crate::config::{ClientConfig, TokenMode};
use crate::error::Error;
use crate::identity::{IdentityClient, IdentityProvider};
use crate::navigation::NavigationIntent;
use crate::store::TokenStore;

/// An outbound API call, relative to the configured base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<JsonValue>,
    authenticated: bool,
    invalidate: bool,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            authenticated: true,
            invalidate: true,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if `body` cannot be serialized.
    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, Error> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Send without a bearer token and without the refresh/redirect handling.
    /// A `401` comes back as a plain [`Error::BackendRejected`].
    #[must_use]
    pub fn without_auth(mut self) -> Self {
        self.authenticated = false;
        self
    }

    /// Keep the identity session and cached credential when a `401` cannot be
    /// recovered; the call fails with [`Error::AuthorizationExpired`] instead
    /// of [`Error::SessionInvalid`].
    #[must_use]
    pub fn without_invalidation(mut self) -> Self {
        self.invalidate = false;
        self
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// `{success: true, data, message?}` or `{success: false, error}`.
#[derive(Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    details: Option<JsonValue>,
}

impl ErrorBody {
    fn into_error(self, status: StatusCode) -> Error {
        Error::BackendRejected {
            status: self.status_code.unwrap_or(status.as_u16()),
            name: self.name,
            message: self.message,
            details: self.details,
        }
    }
}

/// HTTP pipeline shared by everything that talks to the backend.
pub struct RequestPipeline<P> {
    http: reqwest::Client,
    api_url: Url,
    token_mode: TokenMode,
    login_path: String,
    identity: Arc<IdentityClient<P>>,
    store: TokenStore,
    location: RwLock<String>,
}

impl<P: IdentityProvider> RequestPipeline<P> {
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the HTTP client cannot be built.
    pub fn new(
        config: &ClientConfig,
        identity: Arc<IdentityClient<P>>,
        store: TokenStore,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_url: config.api_url().clone(),
            token_mode: config.token_mode(),
            login_path: config.login_path().to_owned(),
            identity,
            store,
            location: RwLock::new("/".into()),
        })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Record the page the UI is currently showing. Used to avoid
    /// redirecting to the login page from the login page itself.
    pub fn set_location(&self, path: impl Into<String>) {
        *self.location.write().unwrap_or_else(PoisonError::into_inner) = path.into();
    }

    #[must_use]
    pub fn location(&self) -> String {
        self.location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<IdentityClient<P>> {
        &self.identity
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        self.execute(ApiRequest::get(path)).await
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        self.execute(ApiRequest::post(path).with_json(body)?).await
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        self.execute(ApiRequest::put(path).with_json(body)?).await
    }

    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        self.execute(ApiRequest::delete(path)).await
    }

    /// Send `request` and decode the `data` of the response envelope.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionInvalid`] when a `401` could not be recovered by one
    ///   token refresh; the cached credential has been cleared.
    /// - [`Error::AuthorizationExpired`] instead, for requests built with
    ///   [`ApiRequest::without_invalidation`].
    /// - [`Error::BackendRejected`] for any other non-success response.
    /// - [`Error::Network`] for connectivity failures and timeouts.
    /// - [`Error::Decode`] for a body that is not an API envelope.
    pub async fn execute<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, Error> {
        if !request.authenticated {
            let response = self.dispatch(&request, None).await?;
            return Self::decode(&request.path, response).await;
        }

        let token = self.current_token().await?;
        let response = self.dispatch(&request, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::decode(&request.path, response).await;
        }

        tracing::warn!(path = %request.path, "Authorization expired");

        if token.is_none() {
            return Err(self.reject(&request, "no active identity session").await);
        }
        if self.token_mode == TokenMode::StoredBackendToken {
            return Err(self.reject(&request, "stored backend token rejected").await);
        }

        let refreshed = match self.identity.get_token(true).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                return Err(self.reject(&request, "identity signed out during refresh").await);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed");
                return Err(self.reject(&request, "token refresh failed").await);
            }
        };

        tracing::debug!(path = %request.path, "Replaying request with refreshed token");
        let retried = self.dispatch(&request, Some(refreshed.as_str())).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(self
                .reject(&request, "authorization rejected after token refresh")
                .await);
        }
        Self::decode(&request.path, retried).await
    }

    async fn current_token(&self) -> Result<Option<String>, Error> {
        match self.token_mode {
            TokenMode::Identity => Ok(self
                .identity
                .get_token(false)
                .await?
                .map(|t| t.as_str().to_owned())),
            TokenMode::StoredBackendToken => Ok(self.store.backend_token()),
        }
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<reqwest::Response, Error> {
        let url = format!(
            "{}{}",
            self.api_url.as_str().trim_end_matches('/'),
            request.path
        );
        let mut builder = self.http.request(request.method.clone(), url);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(|e| {
            let err = Error::from(e);
            tracing::error!(path = %request.path, error = %err, "Could not reach the server");
            err
        })
    }

    async fn reject(&self, request: &ApiRequest, reason: &'static str) -> Error {
        if request.invalidate {
            return self.invalidate_session(reason).await;
        }
        tracing::debug!(path = %request.path, reason, "Authorization not recovered, session kept");
        Error::AuthorizationExpired
    }

    /// Clear the cached credential, sign the identity out, and decide
    /// whether the UI should go to the login page.
    async fn invalidate_session(&self, reason: &'static str) -> Error {
        tracing::warn!(reason, "Session invalid, clearing local credential");
        if let Err(e) = self.store.clear_credential() {
            tracing::warn!(error = %e, "Failed to clear cached credential");
        }
        if let Err(e) = self.identity.sign_out().await {
            tracing::warn!(error = %e, "Sign-out after invalid session failed");
        }
        let intent = NavigationIntent::to_login(&self.location(), &self.login_path);
        Error::SessionInvalid { intent }
    }

    async fn decode<T: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, Error> {
        let status = response.status();
        let body = response.text().await?;
        let envelope = serde_json::from_str::<Envelope>(&body).ok();

        if status.is_success() {
            let envelope = envelope.ok_or_else(|| {
                Error::Decode(format!("{path}: response is not an API envelope"))
            })?;
            if let Some(message) = &envelope.message {
                tracing::debug!(path, api_message = %message, "API message");
            }
            if envelope.success {
                return serde_json::from_value(envelope.data.unwrap_or(JsonValue::Null))
                    .map_err(Into::into);
            }
            let err = match envelope.error {
                Some(body) => body.into_error(status),
                None => Error::Decode(format!("{path}: unsuccessful envelope without error")),
            };
            return Err(err);
        }

        let err = match envelope.and_then(|e| e.error) {
            Some(body) => body.into_error(status),
            None => Error::BackendRejected {
                status: status.as_u16(),
                name: "HttpError".into(),
                message: if body.trim().is_empty() {
                    status.canonical_reason().unwrap_or("Request failed").to_owned()
                } else {
                    body
                },
                details: None,
            },
        };

        match status.as_u16() {
            403 => tracing::warn!(path, "Forbidden: missing permission for this action"),
            500.. => tracing::error!(path, status = status.as_u16(), error = %err, "Server error"),
            _ => tracing::debug!(path, status = status.as_u16(), error = %err, "Request rejected"),
        }
        Err(err)
    }
}
