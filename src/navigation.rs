/// Where the UI layer should go next.
///
/// The core never navigates by itself; it returns one of these and the
/// caller interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationIntent {
    Stay,
    RedirectTo(String),
}

impl NavigationIntent {
    /// Redirect to `login_path` unless `current_path` is already an auth entry page.
    #[must_use]
    pub fn to_login(current_path: &str, login_path: &str) -> Self {
        if is_auth_entry(current_path) {
            Self::Stay
        } else {
            Self::RedirectTo(login_path.to_owned())
        }
    }

    #[must_use]
    pub fn redirect_path(&self) -> Option<&str> {
        match self {
            Self::Stay => None,
            Self::RedirectTo(path) => Some(path),
        }
    }
}

/// `true` for login and registration pages (`/login`, `/admin/login`, `/register`, ...).
#[must_use]
pub fn is_auth_entry(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/')
        .any(|segment| segment == "login" || segment == "register")
}
