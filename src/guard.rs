use crate::config::ClientConfig;
use crate::identity::IdentityProvider;
use crate::navigation::NavigationIntent;
use crate::session::{SessionController, SessionState};
use crate::types::ApplicationUser;

/// Outcome of checking a protected page against the session.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    /// Session still loading; render a placeholder.
    Pending,
    Redirect(NavigationIntent),
    Allow(ApplicationUser),
}

/// Gate for pages that need a signed-in user.
#[derive(Debug, Clone)]
pub struct RouteGuard {
    login_path: String,
}

impl RouteGuard {
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            login_path: config.login_path().to_owned(),
        }
    }

    #[must_use]
    pub fn decide(&self, state: &SessionState) -> GuardDecision {
        if state.loading {
            return GuardDecision::Pending;
        }
        match &state.user {
            Some(user) => GuardDecision::Allow(user.clone()),
            None => {
                tracing::debug!(login_path = %self.login_path, "Protected page without a user");
                GuardDecision::Redirect(NavigationIntent::RedirectTo(self.login_path.clone()))
            }
        }
    }

    /// Wait for boot to finish, then decide. Never returns
    /// [`GuardDecision::Pending`] unless an operation is still in flight.
    pub async fn check<P: IdentityProvider>(&self, controller: &SessionController<P>) -> GuardDecision {
        let state = controller.ready().await;
        self.decide(&state)
    }
}
