//! Durable local storage for the cached credential.
//!
//! The cache is advisory: nothing read from here is trusted without a live
//! identity session behind it. Read failures are logged and treated as a
//! cache miss.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Error;
use crate::types::ApplicationUser;

/// Legacy backend-issued session token.
pub const AUTH_TOKEN_KEY: &str = "authToken";
/// Serialized [`ApplicationUser`].
pub const USER_KEY: &str = "user";
/// Opt-in plaintext email used to prefill the login form.
pub const REMEMBERED_EMAIL_KEY: &str = "remembered_email";

/// Consumer-provided key/value persistence.
///
/// Operations are synchronous: the store is local (a file, browser-style
/// storage, a keychain entry) and never crosses the network.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, Error>;

    fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    fn remove(&self, key: &str) -> Result<(), Error>;
}

/// Process-local store. Does not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, Error> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.entries()?.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.entries()?.remove(key);
        Ok(())
    }
}

/// JSON-file store that survives restarts.
///
/// Every write rewrites the whole file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// A corrupt file is logged and treated as empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists but cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Credential file is corrupt, starting empty");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(Error::Storage(format!("{}: {e}", path.display())));
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, apply: impl FnOnce(&mut HashMap<String, String>)) -> Result<(), Error> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Storage("file store lock poisoned".into()))?;
        apply(&mut entries);

        let raw = serde_json::to_string_pretty(&*entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| Error::Storage(format!("{}: {e}", self.path.display())))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::Storage("file store lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.update(|entries| {
            entries.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

/// Everything the local cache knows at one point in time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CachedCredential {
    pub user: Option<ApplicationUser>,
    pub backend_token: Option<String>,
    pub remembered_email: Option<String>,
}

/// Typed access to the cached credential over a [`KeyValueStore`].
///
/// Cheap to clone; clones share the same underlying store.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    #[must_use]
    pub fn new(store: impl KeyValueStore) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    #[must_use]
    pub fn credential(&self) -> CachedCredential {
        CachedCredential {
            user: self.cached_user(),
            backend_token: self.backend_token(),
            remembered_email: self.remembered_email(),
        }
    }

    /// Cached user, if present and parseable.
    #[must_use]
    pub fn cached_user(&self) -> Option<ApplicationUser> {
        let raw = self.read(USER_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!(error = %e, "Cached user record is unreadable, ignoring it");
                None
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the underlying store fails.
    pub fn save_user(&self, user: &ApplicationUser) -> Result<(), Error> {
        let raw = serde_json::to_string(user)?;
        self.inner.set(USER_KEY, &raw)
    }

    #[must_use]
    pub fn backend_token(&self) -> Option<String> {
        self.read(AUTH_TOKEN_KEY)
    }

    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the underlying store fails.
    pub fn save_backend_token(&self, token: &str) -> Result<(), Error> {
        self.inner.set(AUTH_TOKEN_KEY, token)
    }

    /// Drop the cached user and backend token. The remembered email stays.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the underlying store fails.
    pub fn clear_credential(&self) -> Result<(), Error> {
        self.inner.remove(AUTH_TOKEN_KEY)?;
        self.inner.remove(USER_KEY)
    }

    #[must_use]
    pub fn remembered_email(&self) -> Option<String> {
        self.read(REMEMBERED_EMAIL_KEY)
    }

    /// Store `Some(email)` or forget it with `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the underlying store fails.
    pub fn remember_email(&self, email: Option<&str>) -> Result<(), Error> {
        match email {
            Some(email) => self.inner.set(REMEMBERED_EMAIL_KEY, email),
            None => self.inner.remove(REMEMBERED_EMAIL_KEY),
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.inner.get(key) {
            Ok(value) => value.filter(|v| !v.trim().is_empty()),
            Err(e) => {
                tracing::warn!(key, error = %e, "Local store read failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}
