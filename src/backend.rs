use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::identity::IdentityProvider;
use crate::pipeline::{ApiRequest, RequestPipeline};
use crate::token::Token;
use crate::types::{ApplicationUser, SubjectId};

const LOGIN_PATH: &str = "/api/v1/auth/login";
const REGISTER_PATH: &str = "/api/v1/auth/register";
const VERIFY_PATH: &str = "/api/v1/auth/verify";
const PROFILE_PATH: &str = "/api/v1/auth/me";

/// Result of exchanging an identity token for a backend session.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct LoginResponse {
    pub user: ApplicationUser,
    /// Backend-issued session token.
    pub token: Token,
}

/// Backend user record created during registration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRecord {
    pub email: String,
    pub name: String,
    pub identity_uid: SubjectId,
    pub id_token: Token,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdTokenBody<'a> {
    id_token: &'a str,
}

#[derive(Deserialize)]
struct UserBody {
    user: ApplicationUser,
}

/// Backend auth endpoints.
///
/// Never caches: persisting what comes back is the caller's job.
pub struct BackendSessionClient<P> {
    pipeline: Arc<RequestPipeline<P>>,
}

impl<P> Clone for BackendSessionClient<P> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<P: IdentityProvider> BackendSessionClient<P> {
    #[must_use]
    pub fn new(pipeline: Arc<RequestPipeline<P>>) -> Self {
        Self { pipeline }
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<RequestPipeline<P>> {
        &self.pipeline
    }

    /// Exchange an identity token for a backend session (`POST /api/v1/auth/login`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendRejected`] or [`Error::Network`].
    pub async fn exchange(&self, token: &Token) -> Result<LoginResponse, Error> {
        let request = ApiRequest::post(LOGIN_PATH)
            .with_json(&IdTokenBody {
                id_token: token.as_str(),
            })?
            .without_auth();
        self.pipeline.execute(request).await
    }

    /// Re-validate an identity token without opening a new backend session
    /// (`POST /api/v1/auth/verify`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendRejected`] or [`Error::Network`].
    pub async fn verify(&self, token: &Token) -> Result<ApplicationUser, Error> {
        let request = ApiRequest::post(VERIFY_PATH)
            .with_json(&IdTokenBody {
                id_token: token.as_str(),
            })?
            .without_auth();
        let body: UserBody = self.pipeline.execute(request).await?;
        Ok(body.user)
    }

    /// Create the backend record for a fresh identity (`POST /api/v1/auth/register`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendRejected`] (with field details on `400`) or
    /// [`Error::Network`].
    pub async fn register(&self, record: &RegisterRecord) -> Result<ApplicationUser, Error> {
        let request = ApiRequest::post(REGISTER_PATH)
            .with_json(record)?
            .without_auth();
        let body: UserBody = self.pipeline.execute(request).await?;
        Ok(body.user)
    }

    /// Profile of the authenticated user (`GET /api/v1/auth/me`), sent with
    /// the pipeline's token handling.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionInvalid`] when authorization cannot be
    /// recovered, otherwise [`Error::BackendRejected`] or [`Error::Network`].
    pub async fn fetch_profile(&self) -> Result<ApplicationUser, Error> {
        let body: UserBody = self.pipeline.get(PROFILE_PATH).await?;
        Ok(body.user)
    }

    /// Like [`fetch_profile`](Self::fetch_profile), but a `401` that one
    /// token refresh cannot fix comes back as [`Error::AuthorizationExpired`]
    /// and leaves the identity session and the cache untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthorizationExpired`], [`Error::BackendRejected`] or
    /// [`Error::Network`].
    pub async fn fetch_profile_keep_session(&self) -> Result<ApplicationUser, Error> {
        let request = ApiRequest::get(PROFILE_PATH).without_invalidation();
        let body: UserBody = self.pipeline.execute(request).await?;
        Ok(body.user)
    }
}
