#![doc = include_str!("../README.md")]

pub mod admin;
pub mod backend;
pub mod config;
pub mod error;
pub mod guard;
pub mod identity;
pub mod navigation;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod token;
pub mod types;

// Re-exports for convenient access
pub use admin::{AdminLogin, LoginPrefill};
pub use backend::{BackendSessionClient, LoginResponse, RegisterRecord};
pub use config::{ClientConfig, IdentityConfig, IdentitySettings, TokenMode};
pub use error::{CredentialError, Error, FieldError};
pub use guard::{GuardDecision, RouteGuard};
pub use identity::{IdentityClient, IdentityProvider, SessionChanged, Subscription};
pub use navigation::NavigationIntent;
pub use pipeline::{ApiRequest, RequestPipeline};
pub use session::{SessionController, SessionPhase, SessionState};
pub use store::{CachedCredential, FileStore, KeyValueStore, MemoryStore, TokenStore};
pub use token::Token;
pub use types::{ApplicationUser, IdentitySession, RegisterData, SubjectId};
