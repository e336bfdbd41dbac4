//! Identity-provider access.
//!
//! [`IdentityProvider`] is the seam to the hosted identity service. It is
//! wrapped by [`IdentityClient`], which owns the process-wide identity
//! session, fans sign-in/out transitions out to subscribers, and keeps a
//! single cached token that every consumer shares.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::token::Token;
use crate::types::{IdentitySession, SubjectId};

/// Cached tokens this close to expiry are re-fetched before use.
const TOKEN_EXPIRY_SKEW: Duration = Duration::seconds(60);

/// Consumer-provided binding to the hosted identity service.
///
/// Implementations translate provider failures into
/// [`CredentialError`](crate::error::CredentialError) where one applies
/// (see [`CredentialError::from_provider_code`](crate::error::CredentialError::from_provider_code))
/// and into [`Error::Network`] for connectivity problems.
pub trait IdentityProvider: Send + Sync + 'static {
    fn sign_in(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<IdentitySession, Error>> + Send;

    /// Create an account and sign into it.
    fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> impl Future<Output = Result<IdentitySession, Error>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Permanently delete the account (used to roll back a failed registration).
    fn delete_identity(&self, uid: &SubjectId) -> impl Future<Output = Result<(), Error>> + Send;

    /// Fetch a token for the signed-in account. `force_refresh` bypasses any
    /// provider-side cache.
    fn fetch_token(
        &self,
        uid: &SubjectId,
        force_refresh: bool,
    ) -> impl Future<Output = Result<Token, Error>> + Send;

    /// Session the provider restored from its own persistence, if any.
    fn restore(&self) -> impl Future<Output = Result<Option<IdentitySession>, Error>> + Send;
}

/// One sign-in/out transition. `session: None` means signed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChanged {
    pub session: Option<IdentitySession>,
}

/// Ordered stream of [`SessionChanged`] events. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SessionChanged>,
}

impl Subscription {
    /// Next transition, or `None` once the client is gone.
    pub async fn next(&mut self) -> Option<SessionChanged> {
        self.rx.recv().await
    }

    /// Next already-delivered transition, without waiting.
    pub fn try_next(&mut self) -> Option<SessionChanged> {
        self.rx.try_recv().ok()
    }
}

struct ClientState {
    initialized: bool,
    session: Option<IdentitySession>,
    /// Bumped on every session transition; tokens from an older epoch are discarded.
    epoch: u64,
    token: Option<Token>,
    forced_refreshes: u64,
    subscribers: Vec<mpsc::UnboundedSender<SessionChanged>>,
}

/// Process-wide identity session over an [`IdentityProvider`].
///
/// Shared as `Arc<IdentityClient<P>>` by the request pipeline and the
/// session controller so both see the same current token.
pub struct IdentityClient<P> {
    provider: P,
    state: Mutex<ClientState>,
    /// Serializes provider token fetches; concurrent forced refreshes share one call.
    fetch_gate: tokio::sync::Mutex<()>,
}

impl<P: IdentityProvider> IdentityClient<P> {
    #[must_use]
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            state: Mutex::new(ClientState {
                initialized: false,
                session: None,
                epoch: 0,
                token: None,
                forced_refreshes: 0,
                subscribers: Vec::new(),
            }),
            fetch_gate: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Determine the initial state from the provider and notify subscribers.
    ///
    /// Subscribers receive nothing until this has run. A restore failure is
    /// treated as signed out. Calling it again is a no-op.
    pub async fn initialize(&self) {
        if self.lock().initialized {
            return;
        }
        let restored = match self.provider.restore().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "Identity restore failed, starting signed out");
                None
            }
        };
        if self.lock().initialized {
            return;
        }
        tracing::debug!(uid = ?restored.as_ref().map(|s| s.uid.as_str()), "Identity state determined");
        self.transition(restored);
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// # Errors
    ///
    /// Returns the provider's [`CredentialError`](crate::error::CredentialError)
    /// or [`Error::Network`].
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, Error> {
        let session = self
            .provider
            .sign_in(email, password)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Identity sign-in failed"))?;
        tracing::info!(uid = %session.uid, "Identity signed in");
        self.transition(Some(session.clone()));
        Ok(session)
    }

    /// # Errors
    ///
    /// Returns the provider's [`CredentialError`](crate::error::CredentialError)
    /// or [`Error::Network`].
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<IdentitySession, Error> {
        let session = self
            .provider
            .sign_up(email, password, display_name)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Identity sign-up failed"))?;
        tracing::info!(uid = %session.uid, "Identity created");
        self.transition(Some(session.clone()));
        Ok(session)
    }

    /// Sign out. The local session is dropped even if the provider call fails.
    /// Signing out while signed out does nothing.
    ///
    /// # Errors
    ///
    /// Returns the provider's error after the local session has been dropped.
    pub async fn sign_out(&self) -> Result<(), Error> {
        if self.current_session().is_none() {
            return Ok(());
        }
        let result = self.provider.sign_out().await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Provider sign-out failed, dropping local identity anyway");
        }
        self.transition(None);
        tracing::info!("Identity signed out");
        result
    }

    /// Delete the signed-in identity at the provider.
    ///
    /// # Errors
    ///
    /// Returns the provider's error; the session is kept in that case.
    pub async fn delete_current(&self) -> Result<(), Error> {
        let Some(session) = self.current_session() else {
            return Ok(());
        };
        self.provider.delete_identity(&session.uid).await?;
        tracing::info!(uid = %session.uid, "Identity deleted");
        self.transition(None);
        Ok(())
    }

    /// Drop the session without calling the provider (provider-side invalidation).
    pub fn invalidate(&self) {
        if self.current_session().is_some() {
            tracing::warn!("Identity session invalidated");
        }
        self.transition(None);
    }

    #[must_use]
    pub fn current_session(&self) -> Option<IdentitySession> {
        self.lock().session.clone()
    }

    /// Subscribe to transitions.
    ///
    /// Once the client is initialized the subscription first yields the
    /// current state, then every later transition in order.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if state.initialized {
            let _ = tx.send(SessionChanged {
                session: state.session.clone(),
            });
        }
        state.subscribers.push(tx);
        Subscription { rx }
    }

    /// Token for the current session, `None` when signed out.
    ///
    /// Without `force_refresh` a cached token is reused until it nears
    /// expiry. Concurrent forced refreshes collapse into a single provider
    /// call whose token all callers receive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] or the provider's error. A
    /// [`CredentialError`](crate::error::CredentialError) means the identity
    /// is gone at the provider; the local session is dropped as well.
    pub async fn get_token(&self, force_refresh: bool) -> Result<Option<Token>, Error> {
        loop {
            let (session, epoch, cached, forced_seen) = {
                let state = self.lock();
                let Some(session) = state.session.clone() else {
                    return Ok(None);
                };
                (session, state.epoch, state.token.clone(), state.forced_refreshes)
            };

            if !force_refresh {
                if let Some(token) = cached.filter(|t| !Self::is_stale(t)) {
                    return Ok(Some(token));
                }
            }

            let _gate = self.fetch_gate.lock().await;

            {
                let state = self.lock();
                if state.epoch != epoch {
                    continue;
                }
                let shared = state.token.clone();
                if force_refresh && state.forced_refreshes != forced_seen {
                    if let Some(token) = shared {
                        tracing::debug!(uid = %session.uid, "Reusing concurrent token refresh");
                        return Ok(Some(token));
                    }
                } else if !force_refresh {
                    if let Some(token) = shared.filter(|t| !Self::is_stale(t)) {
                        return Ok(Some(token));
                    }
                }
            }

            let token = match self.provider.fetch_token(&session.uid, force_refresh).await {
                Ok(token) => token,
                Err(e @ Error::Credential(_)) => {
                    tracing::warn!(uid = %session.uid, error = %e, "Identity rejected during token fetch");
                    self.transition_if_epoch(epoch, None);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(uid = %session.uid, force_refresh, error = %e, "Token fetch failed");
                    return Err(e);
                }
            };

            {
                let mut state = self.lock();
                if state.epoch != epoch {
                    continue;
                }
                state.token = Some(token.clone());
                if force_refresh {
                    state.forced_refreshes += 1;
                }
            }
            if force_refresh {
                tracing::info!(uid = %session.uid, "Identity token force-refreshed");
            }
            return Ok(Some(token));
        }
    }

    fn is_stale(token: &Token) -> bool {
        token.is_expiring(OffsetDateTime::now_utc(), TOKEN_EXPIRY_SKEW)
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition_if_epoch(&self, epoch: u64, session: Option<IdentitySession>) {
        if self.lock().epoch == epoch {
            self.transition(session);
        }
    }

    /// Apply a transition and notify subscribers while still holding the
    /// state lock, so every subscriber sees transitions in the same order.
    fn transition(&self, session: Option<IdentitySession>) {
        let mut state = self.lock();
        let changed = state.session != session;
        if state.initialized && !changed {
            return;
        }
        state.initialized = true;
        if changed {
            state.epoch += 1;
            state.token = None;
        }
        state.session = session.clone();

        let event = SessionChanged { session };
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::CredentialError;

    #[derive(Default)]
    struct StubProvider {
        fetches: AtomicU32,
    }

    impl IdentityProvider for StubProvider {
        async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, Error> {
            if password == "secret" {
                Ok(IdentitySession::new("u1", email))
            } else {
                Err(CredentialError::WrongPassword.into())
            }
        }

        async fn sign_up(
            &self,
            email: &str,
            _password: &str,
            display_name: Option<&str>,
        ) -> Result<IdentitySession, Error> {
            let session = IdentitySession::new("u2", email);
            Ok(match display_name {
                Some(name) => session.with_display_name(name),
                None => session,
            })
        }

        async fn sign_out(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn delete_identity(&self, _uid: &SubjectId) -> Result<(), Error> {
            Ok(())
        }

        async fn fetch_token(&self, uid: &SubjectId, _force: bool) -> Result<Token, Error> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Token::new(format!("tok:{uid}:{n}")))
        }

        async fn restore(&self) -> Result<Option<IdentitySession>, Error> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn subscription_waits_for_initialization() {
        let client = IdentityClient::new(StubProvider::default());
        let mut sub = client.subscribe();
        assert!(sub.try_next().is_none());

        client.initialize().await;
        assert_eq!(sub.next().await, Some(SessionChanged { session: None }));
    }

    #[tokio::test]
    async fn late_subscriber_gets_current_state_then_transitions() {
        let client = IdentityClient::new(StubProvider::default());
        client.initialize().await;
        client.sign_in("a@example.com", "secret").await.unwrap();

        let mut sub = client.subscribe();
        let first = sub.next().await.unwrap();
        assert_eq!(first.session.unwrap().uid, SubjectId::from("u1"));

        client.sign_out().await.unwrap();
        assert_eq!(sub.next().await, Some(SessionChanged { session: None }));
    }

    #[tokio::test]
    async fn failed_sign_in_emits_nothing() {
        let client = IdentityClient::new(StubProvider::default());
        client.initialize().await;
        let mut sub = client.subscribe();
        let _ = sub.next().await;

        let err = client.sign_in("a@example.com", "nope").await.unwrap_err();
        assert!(matches!(err, Error::Credential(CredentialError::WrongPassword)));
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn sign_out_when_signed_out_is_silent() {
        let client = IdentityClient::new(StubProvider::default());
        client.initialize().await;
        let mut sub = client.subscribe();
        let _ = sub.next().await;

        client.sign_out().await.unwrap();
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn cached_token_is_reused_until_forced() {
        let client = IdentityClient::new(StubProvider::default());
        client.initialize().await;
        assert!(client.get_token(false).await.unwrap().is_none());

        client.sign_in("a@example.com", "secret").await.unwrap();
        let first = client.get_token(false).await.unwrap().unwrap();
        let again = client.get_token(false).await.unwrap().unwrap();
        assert_eq!(first, again);

        let forced = client.get_token(true).await.unwrap().unwrap();
        assert_ne!(first, forced);
        assert_eq!(client.provider().fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn token_is_dropped_on_sign_out() {
        let client = Arc::new(IdentityClient::new(StubProvider::default()));
        client.initialize().await;
        client.sign_in("a@example.com", "secret").await.unwrap();
        client.get_token(false).await.unwrap();

        client.invalidate();
        assert!(client.current_session().is_none());
        assert!(client.get_token(false).await.unwrap().is_none());
    }
}
