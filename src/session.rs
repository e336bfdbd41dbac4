//! Session controller: the single owner of [`SessionState`].
//!
//! The controller consumes identity transitions one at a time and
//! reconciles each against the local cache and the backend. `login`,
//! `register` and `logout` share the same lock as reconciliation, so at most
//! one of them is in flight and identity events are applied strictly in the
//! order the provider emitted them.
//!
//! Boot policy for a present identity, first match wins:
//! 1. a cached user for the same subject is adopted without a network call;
//! 2. the backend profile (`/auth/me`), without signing out on a `401`;
//! 3. backend verification of the identity token;
//! 4. otherwise the identity is signed out and the cache cleared.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{BackendSessionClient, RegisterRecord};
use crate::config::{ClientConfig, IdentitySettings};
use crate::error::Error;
use crate::identity::{IdentityClient, IdentityProvider, Subscription};
use crate::store::TokenStore;
use crate::types::{ApplicationUser, IdentitySession, RegisterData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the identity provider to report its initial state.
    Booting,
    Idle,
    /// A login, register or logout is in flight.
    Busy,
}

/// Reconciled session view handed to the rest of the application.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct SessionState {
    pub phase: SessionPhase,
    pub loading: bool,
    pub user: Option<ApplicationUser>,
    pub identity: Option<IdentitySession>,
    pub error: Option<String>,
}

impl SessionState {
    fn booting() -> Self {
        Self {
            phase: SessionPhase::Booting,
            loading: true,
            user: None,
            identity: None,
            error: None,
        }
    }

    pub(crate) fn signed_out() -> Self {
        Self {
            phase: SessionPhase::Idle,
            loading: false,
            ..Self::booting()
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
        self.loading = phase != SessionPhase::Idle;
    }
}

/// Outcome of checking one identity against the cache and the backend.
enum Reconciled {
    Cached(ApplicationUser),
    /// Confirmed by the backend; cached once the identity is known to be current.
    Fetched(ApplicationUser),
    SignedOut,
}

pub struct SessionController<P> {
    identity: Arc<IdentityClient<P>>,
    backend: BackendSessionClient<P>,
    store: TokenStore,
    settings: IdentitySettings,
    state: watch::Sender<SessionState>,
    op_lock: tokio::sync::Mutex<()>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<P: IdentityProvider> SessionController<P> {
    /// Build the controller, subscribe to identity transitions and kick off
    /// initial state determination.
    ///
    /// Without identity configuration the controller comes up idle, signed
    /// out, with `error` set; every login or register then fails with
    /// [`Error::Configuration`].
    pub async fn start(
        config: &ClientConfig,
        identity: Arc<IdentityClient<P>>,
        backend: BackendSessionClient<P>,
        store: TokenStore,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::booting());
        let controller = Arc::new(Self {
            identity,
            backend,
            store,
            settings: config.identity().clone(),
            state,
            op_lock: tokio::sync::Mutex::new(()),
            consumer: Mutex::new(None),
        });

        if let Err(e) = controller.settings.require() {
            tracing::error!(error = %e, "Session controller started without identity configuration");
            let message = e.user_message();
            controller.state.send_modify(|s| {
                s.set_phase(SessionPhase::Idle);
                s.error = Some(message);
            });
            return controller;
        }

        let subscription = controller.identity.subscribe();
        let handle = tokio::spawn(Self::consume(Arc::downgrade(&controller), subscription));
        *controller
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        controller.identity.initialize().await;
        controller
    }

    async fn consume(controller: Weak<Self>, mut subscription: Subscription) {
        while let Some(event) = subscription.next().await {
            let Some(controller) = controller.upgrade() else {
                break;
            };
            controller.apply_identity_change(event.session).await;
        }
    }

    /// Stop consuming identity transitions.
    pub fn dispose(&self) {
        if let Some(handle) = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    #[must_use]
    pub fn current_session(&self) -> SessionState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.state.borrow().phase
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn clear_error(&self) {
        self.state.send_if_modified(|s| s.error.take().is_some());
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Wait until the initial identity state has been reconciled.
    pub async fn ready(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| s.phase != SessionPhase::Booting).await {
            Ok(state) => state.clone(),
            Err(_) => self.current_session(),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<IdentityClient<P>> {
        &self.identity
    }

    /// Sign in and open a backend session.
    ///
    /// Runs to completion even if the returned future is dropped.
    ///
    /// # Errors
    ///
    /// The error is also recorded in [`SessionState::error`]; the previous
    /// user is kept.
    pub async fn login(
        self: &Arc<Self>,
        email: &str,
        password: &str,
    ) -> Result<ApplicationUser, Error> {
        let this = Arc::clone(self);
        let (email, password) = (email.to_owned(), password.to_owned());
        detach(async move {
            this.run_op("login", this.login_inner(&email, &password))
                .await
        })
        .await
    }

    /// Create the identity and the backend record, then log in.
    ///
    /// If the backend record cannot be created the new identity is deleted
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// The error is also recorded in [`SessionState::error`].
    pub async fn register(self: &Arc<Self>, data: RegisterData) -> Result<ApplicationUser, Error> {
        let this = Arc::clone(self);
        detach(async move { this.run_op("register", this.register_inner(&data)).await }).await
    }

    /// Sign out and forget the cached credential. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns the provider's sign-out error; local state is cleared regardless.
    pub async fn logout(self: &Arc<Self>) -> Result<(), Error> {
        let this = Arc::clone(self);
        detach(async move { this.run_op("logout", this.logout_inner()).await }).await
    }

    async fn run_op<T>(
        &self,
        op: &'static str,
        work: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        let _guard = self.op_lock.lock().await;

        let mut resume = SessionPhase::Idle;
        self.state.send_modify(|s| {
            if s.phase == SessionPhase::Booting {
                resume = SessionPhase::Booting;
            }
            s.set_phase(SessionPhase::Busy);
            s.error = None;
        });

        let result = work.await;

        if let Err(e) = &result {
            tracing::warn!(op, error = %e, "Session operation failed");
        }
        let message = result.as_ref().err().map(Error::user_message);
        self.state.send_modify(|s| {
            s.set_phase(resume);
            s.error = message;
        });
        result
    }

    async fn login_inner(&self, email: &str, password: &str) -> Result<ApplicationUser, Error> {
        self.settings.require()?;

        let identity = self.identity.sign_in(email, password).await?;
        let token = self
            .identity
            .get_token(false)
            .await?
            .ok_or(Error::AuthorizationExpired)?;
        let response = self.backend.exchange(&token).await?;

        if response.user.uid != identity.uid {
            return Err(Error::Identity(format!(
                "backend user {} does not match identity {}",
                response.user.uid, identity.uid
            )));
        }

        self.persist_user(&response.user);
        if let Err(e) = self.store.save_backend_token(response.token.as_str()) {
            tracing::warn!(error = %e, "Failed to cache backend token");
        }

        tracing::info!(uid = %identity.uid, "Login successful");
        let user = response.user;
        let snapshot = user.clone();
        self.state.send_modify(|s| {
            s.user = Some(snapshot);
            s.identity = Some(identity);
        });
        Ok(user)
    }

    async fn register_inner(&self, data: &RegisterData) -> Result<ApplicationUser, Error> {
        self.settings.require()?;

        let identity = self
            .identity
            .sign_up(&data.email, &data.password, Some(&data.name))
            .await?;

        if let Err(e) = self.create_backend_record(&identity, data).await {
            tracing::warn!(uid = %identity.uid, error = %e, "Backend registration failed, rolling back identity");
            if let Err(rollback) = self.identity.delete_current().await {
                tracing::error!(uid = %identity.uid, error = %rollback, "Identity rollback failed");
                let _ = self.identity.sign_out().await;
            }
            return Err(e);
        }

        tracing::info!(uid = %identity.uid, "Registration successful, logging in");
        self.login_inner(&data.email, &data.password).await
    }

    async fn create_backend_record(
        &self,
        identity: &IdentitySession,
        data: &RegisterData,
    ) -> Result<ApplicationUser, Error> {
        let token = self
            .identity
            .get_token(false)
            .await?
            .ok_or(Error::AuthorizationExpired)?;
        let record = RegisterRecord {
            email: data.email.clone(),
            name: data.name.clone(),
            identity_uid: identity.uid.clone(),
            id_token: token,
        };
        self.backend.register(&record).await
    }

    async fn logout_inner(&self) -> Result<(), Error> {
        let result = self.identity.sign_out().await;
        self.clear_cache();
        self.state.send_modify(|s| {
            s.user = None;
            s.identity = None;
        });
        tracing::info!("Logged out");
        result
    }

    async fn apply_identity_change(&self, session: Option<IdentitySession>) {
        let _guard = self.op_lock.lock().await;

        // A later transition is already queued behind this one.
        if self.identity.current_session() != session {
            tracing::debug!("Identity event superseded, waiting for the next one");
            return;
        }

        let reconciled = match &session {
            Some(identity) => self.reconcile(identity).await,
            None => Reconciled::SignedOut,
        };

        if self.identity.current_session() != session {
            tracing::debug!("Identity changed during reconciliation");
            return;
        }

        let user = match reconciled {
            Reconciled::Cached(user) => Some(user),
            Reconciled::Fetched(user) => {
                self.persist_user(&user);
                Some(user)
            }
            Reconciled::SignedOut => None,
        };
        match &user {
            Some(user) => tracing::info!(uid = %user.uid, "Session reconciled"),
            None => tracing::info!("No active session"),
        }
        let identity = user.as_ref().and(session);
        self.state.send_modify(|s| {
            s.user = user;
            s.identity = identity;
            s.set_phase(SessionPhase::Idle);
        });
    }

    async fn reconcile(&self, identity: &IdentitySession) -> Reconciled {
        if let Some(cached) = self.store.cached_user() {
            if cached.uid == identity.uid {
                tracing::debug!(uid = %cached.uid, "Adopting cached user");
                return Reconciled::Cached(cached);
            }
            tracing::warn!(
                cached_uid = %cached.uid,
                uid = %identity.uid,
                "Cached user belongs to another identity, discarding"
            );
            self.clear_cache();
        }

        match self.backend.fetch_profile_keep_session().await {
            Ok(user) if user.uid == identity.uid => return Reconciled::Fetched(user),
            Ok(user) => {
                tracing::warn!(profile_uid = %user.uid, uid = %identity.uid, "Profile does not match identity");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Profile fetch failed, trying token verification");
            }
        }

        match self.identity.get_token(false).await {
            Ok(Some(token)) => match self.backend.verify(&token).await {
                Ok(user) if user.uid == identity.uid => return Reconciled::Fetched(user),
                Ok(user) => {
                    tracing::warn!(verified_uid = %user.uid, uid = %identity.uid, "Verified user does not match identity");
                }
                Err(e) => tracing::warn!(error = %e, "Token verification failed"),
            },
            Ok(None) => tracing::debug!("Identity signed out during reconciliation"),
            Err(e) => tracing::warn!(error = %e, "Token fetch for verification failed"),
        }

        if self.identity.current_session().as_ref() != Some(identity) {
            return Reconciled::SignedOut;
        }
        tracing::warn!(uid = %identity.uid, "Could not reconcile identity with backend, signing out");
        if let Err(e) = self.identity.sign_out().await {
            tracing::warn!(error = %e, "Forced sign-out failed");
        }
        self.clear_cache();
        Reconciled::SignedOut
    }

    fn persist_user(&self, user: &ApplicationUser) {
        if let Err(e) = self.store.save_user(user) {
            tracing::warn!(error = %e, "Failed to cache user");
        }
    }

    fn clear_cache(&self) {
        if let Err(e) = self.store.clear_credential() {
            tracing::warn!(error = %e, "Failed to clear cached credential");
        }
    }
}

impl<P> Drop for SessionController<P> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .consumer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Run `task` on the runtime so that dropping the caller's future does not
/// abort the state mutation half-way.
async fn detach<T: Send + 'static>(
    task: impl Future<Output = Result<T, Error>> + Send + 'static,
) -> Result<T, Error> {
    match tokio::spawn(task).await {
        Ok(result) => result,
        Err(e) => Err(Error::Identity(format!("session task failed: {e}"))),
    }
}
