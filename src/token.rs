use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::{Duration, OffsetDateTime};

use crate::error::Error;

/// Bearer token issued by the identity provider or the backend.
///
/// Opaque to this crate except for the unverified `exp` claim, which is read
/// only to decide when a cached token should be re-fetched. Signature
/// verification is the backend's job. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Expiry from the `exp` claim, if the token is a JWT carrying one.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let exp = extract_exp_claim(&self.0).ok()?;
        OffsetDateTime::from_unix_timestamp(exp).ok()
    }

    /// `true` when the token expires within `skew` of `now`.
    ///
    /// Tokens without a readable `exp` never count as expiring.
    #[must_use]
    pub fn is_expiring(&self, now: OffsetDateTime, skew: Duration) -> bool {
        self.expires_at().is_some_and(|exp| exp - skew <= now)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

/// Reads the `exp` claim from a JWT payload without verifying the signature.
pub(crate) fn extract_exp_claim(token: &str) -> Result<i64, Error> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(Error::Decode("token is not a JWT".into()));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|_| Error::Decode("invalid token payload".into()))?;

    let claims: JsonValue = serde_json::from_slice(&payload)
        .map_err(|_| Error::Decode("invalid token payload".into()))?;

    claims
        .get("exp")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| Error::Decode("missing claim: exp".into()))
}
