use serde_json::Value as JsonValue;

use crate::navigation::NavigationIntent;

/// Sign-in and sign-up failures reported by the identity provider.
///
/// The `Display` text is shown to the user as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CredentialError {
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("User not found")]
    UserNotFound,
    #[error("Incorrect password")]
    WrongPassword,
    #[error("Invalid email")]
    InvalidEmail,
    #[error("User is disabled")]
    UserDisabled,
    #[error("Too many attempts. Try again later")]
    RateLimited,
    #[error("This email is already registered")]
    EmailInUse,
    #[error("Password must be at least 6 characters")]
    WeakPassword,
}

impl CredentialError {
    /// Maps a provider error code (`auth/user-not-found`, `user-not-found`, ...)
    /// to a credential error.
    #[must_use]
    pub fn from_provider_code(code: &str) -> Option<Self> {
        let code = code.trim().trim_start_matches("auth/");
        let err = match code {
            "invalid-credential" | "invalid-login-credentials" => Self::InvalidCredentials,
            "user-not-found" => Self::UserNotFound,
            "wrong-password" => Self::WrongPassword,
            "invalid-email" => Self::InvalidEmail,
            "user-disabled" => Self::UserDisabled,
            "too-many-requests" => Self::RateLimited,
            "email-already-in-use" => Self::EmailInUse,
            "weak-password" => Self::WeakPassword,
            _ => return None,
        };
        Some(err)
    }
}

/// One field-level validation failure from a `400` backend response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// A request carrying a token was answered with `401`.
    #[error("Authorization expired")]
    AuthorizationExpired,

    /// The session could not be recovered; local credentials were cleared.
    #[error("Session is no longer valid")]
    SessionInvalid { intent: NavigationIntent },

    #[error("Backend rejected the request ({status} {name}): {message}")]
    BackendRejected {
        status: u16,
        name: String,
        message: String,
        details: Option<JsonValue>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Identity provider error: {0}")]
    Identity(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl Error {
    /// HTTP status of a backend rejection.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::BackendRejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::AuthorizationExpired | Self::SessionInvalid { .. })
            || self.status() == Some(401)
    }

    /// Navigation the UI layer should perform after this failure, if any.
    #[must_use]
    pub fn navigation(&self) -> Option<&NavigationIntent> {
        match self {
            Self::SessionInvalid { intent } => Some(intent),
            _ => None,
        }
    }

    /// Validation details of a `400` rejection, one entry per field.
    ///
    /// Accepts both `[{"field": .., "message": ..}]` and
    /// `{"field": "message" | ["message", ..]}` detail shapes.
    #[must_use]
    pub fn field_errors(&self) -> Vec<FieldError> {
        let Self::BackendRejected {
            status: 400,
            details: Some(details),
            ..
        } = self
        else {
            return Vec::new();
        };

        match details {
            JsonValue::Array(items) => items
                .iter()
                .filter_map(|item| {
                    let field = item
                        .get("field")
                        .or_else(|| item.get("path"))
                        .and_then(JsonValue::as_str)?;
                    let message = item.get("message").and_then(JsonValue::as_str)?;
                    Some(FieldError {
                        field: field.to_owned(),
                        message: message.to_owned(),
                    })
                })
                .collect(),
            JsonValue::Object(map) => map
                .iter()
                .flat_map(|(field, value)| {
                    let messages: Vec<String> = match value {
                        JsonValue::String(s) => vec![s.clone()],
                        JsonValue::Array(list) => list
                            .iter()
                            .filter_map(|m| m.as_str().map(str::to_owned))
                            .collect(),
                        _ => Vec::new(),
                    };
                    messages.into_iter().map(move |message| FieldError {
                        field: field.clone(),
                        message,
                    })
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Message suitable for binding into `SessionState::error`.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Credential(e) => e.to_string(),
            Self::BackendRejected { message, .. } if !message.is_empty() => message.clone(),
            Self::Network(_) => "Could not connect to the server".to_owned(),
            Self::SessionInvalid { .. } | Self::AuthorizationExpired => {
                "Your session has expired. Please sign in again".to_owned()
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else if e.is_timeout() {
            Self::Network(format!("request timed out: {e}"))
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
