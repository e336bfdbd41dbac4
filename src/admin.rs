//! Admin login page flow.

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::identity::IdentityProvider;
use crate::navigation::NavigationIntent;
use crate::session::{SessionController, SessionState};
use crate::store::TokenStore;

/// Initial values for the login form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginPrefill {
    pub email: Option<String>,
    /// Pre-check "remember me" when an email was remembered last time.
    pub remember_me: bool,
}

pub struct AdminLogin<P> {
    controller: Arc<SessionController<P>>,
    store: TokenStore,
    home_path: String,
}

impl<P: IdentityProvider> AdminLogin<P> {
    #[must_use]
    pub fn new(config: &ClientConfig, controller: Arc<SessionController<P>>, store: TokenStore) -> Self {
        Self {
            controller,
            store,
            home_path: config.admin_home_path().to_owned(),
        }
    }

    #[must_use]
    pub fn prefill(&self) -> LoginPrefill {
        let email = self.store.remembered_email();
        LoginPrefill {
            remember_me: email.is_some(),
            email,
        }
    }

    /// Submit the form. Empty fields are ignored and keep the page.
    ///
    /// On success the email is remembered (or forgotten) according to
    /// `remember_me` and the caller is sent to the admin home page.
    ///
    /// # Errors
    ///
    /// Returns the login error; it is also visible through the
    /// controller's session state.
    pub async fn submit(
        &self,
        email: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<NavigationIntent, Error> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Ok(NavigationIntent::Stay);
        }

        self.controller.clear_error();
        self.controller.login(email, password).await?;

        if let Err(e) = self.store.remember_email(remember_me.then_some(email)) {
            tracing::warn!(error = %e, "Failed to update remembered email");
        }
        Ok(NavigationIntent::RedirectTo(self.home_path.clone()))
    }

    /// Signed-in visitors skip the login page.
    #[must_use]
    pub fn redirect_if_authenticated(&self, state: &SessionState) -> NavigationIntent {
        if !state.loading && state.user.is_some() {
            NavigationIntent::RedirectTo(self.home_path.clone())
        } else {
            NavigationIntent::Stay
        }
    }
}
