#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Json, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value as JsonValue, json};
use url::Url;

use consent_portal_auth::{
    ApplicationUser, BackendSessionClient, ClientConfig, CredentialError, Error, IdentityClient,
    IdentityConfig, IdentityProvider, IdentitySession, IdentitySettings, RequestPipeline,
    SessionController, SubjectId, Token, TokenMode, TokenStore,
};

pub const EMAIL: &str = "user@example.com";
pub const PASSWORD: &str = "secret123";
pub const UID: &str = "u1";
pub const BACKEND_TOKEN: &str = "t1";

// ---------------------------------------------------------------------------
// Identity provider fake
// ---------------------------------------------------------------------------

struct Account {
    uid: String,
    password: String,
    display_name: Option<String>,
}

#[derive(Default)]
struct ProviderState {
    accounts: HashMap<String, Account>,
    restored: Option<IdentitySession>,
    next_uid: u32,
}

/// In-memory identity provider issuing `tok:{uid}:{n}` tokens.
#[derive(Default)]
pub struct FakeIdentityProvider {
    state: Mutex<ProviderState>,
    fetches: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub fail_refresh: AtomicBool,
    pub disabled: AtomicBool,
    refresh_delay_ms: AtomicU64,
}

impl FakeIdentityProvider {
    pub fn with_account(self, email: &str, password: &str, uid: &str) -> Self {
        self.state.lock().unwrap().accounts.insert(
            email.to_owned(),
            Account {
                uid: uid.to_owned(),
                password: password.to_owned(),
                display_name: None,
            },
        );
        self
    }

    /// Session the provider "remembers" from a previous run.
    pub fn with_restored(self, uid: &str, email: &str) -> Self {
        self.state.lock().unwrap().restored = Some(IdentitySession::new(uid, email));
        self
    }

    pub fn with_refresh_delay(self, delay: Duration) -> Self {
        self.refresh_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn account_exists(&self, email: &str) -> bool {
        self.state.lock().unwrap().accounts.contains_key(email)
    }

    pub fn refreshes(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

impl IdentityProvider for FakeIdentityProvider {
    async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, Error> {
        let state = self.state.lock().unwrap();
        let account = state
            .accounts
            .get(email)
            .ok_or(CredentialError::UserNotFound)?;
        if account.password != password {
            return Err(CredentialError::WrongPassword.into());
        }
        let session = IdentitySession::new(account.uid.as_str(), email);
        Ok(match &account.display_name {
            Some(name) => session.with_display_name(name.as_str()),
            None => session,
        })
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<IdentitySession, Error> {
        if !email.contains('@') {
            return Err(CredentialError::InvalidEmail.into());
        }
        if password.len() < 6 {
            return Err(CredentialError::WeakPassword.into());
        }
        let mut state = self.state.lock().unwrap();
        if state.accounts.contains_key(email) {
            return Err(CredentialError::EmailInUse.into());
        }
        state.next_uid += 1;
        let uid = format!("new-{}", state.next_uid);
        state.accounts.insert(
            email.to_owned(),
            Account {
                uid: uid.clone(),
                password: password.to_owned(),
                display_name: display_name.map(str::to_owned),
            },
        );
        let session = IdentitySession::new(uid, email);
        Ok(match display_name {
            Some(name) => session.with_display_name(name),
            None => session,
        })
    }

    async fn sign_out(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn delete_identity(&self, uid: &SubjectId) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .accounts
            .retain(|_, account| account.uid != uid.as_str());
        Ok(())
    }

    async fn fetch_token(&self, uid: &SubjectId, force_refresh: bool) -> Result<Token, Error> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(CredentialError::UserDisabled.into());
        }
        if force_refresh {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.refresh_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail_refresh.load(Ordering::SeqCst) {
                return Err(Error::Network("identity service unreachable".into()));
            }
        }
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Token::new(format!("tok:{uid}:{n}")))
    }

    async fn restore(&self) -> Result<Option<IdentitySession>, Error> {
        Ok(self.state.lock().unwrap().restored.clone())
    }
}

// ---------------------------------------------------------------------------
// Stub backend
// ---------------------------------------------------------------------------

/// Shared state of the stub backend. Flags flip failure modes per test.
#[derive(Default)]
pub struct BackendState {
    users: Mutex<HashMap<String, JsonValue>>,
    revoked: Mutex<HashSet<String>>,
    hits: Mutex<HashMap<&'static str, u32>>,
    pub reject_all: AtomicBool,
    pub fail_register: AtomicBool,
    pub fail_profile: AtomicBool,
    pub fail_verify: AtomicBool,
    profile_delay_ms: AtomicU64,
}

pub type SharedBackend = Arc<BackendState>;

impl BackendState {
    pub fn with_user(self, uid: &str, email: &str) -> Self {
        self.users.lock().unwrap().insert(
            uid.to_owned(),
            json!({ "uid": uid, "email": email, "name": "Test User", "role": "user" }),
        );
        self
    }

    pub fn with_profile_delay(self, delay: Duration) -> Self {
        self.profile_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn has_user(&self, uid: &str) -> bool {
        self.users.lock().unwrap().contains_key(uid)
    }

    pub fn revoke(&self, token: &str) {
        self.revoked.lock().unwrap().insert(token.to_owned());
    }

    pub fn hits(&self, route: &'static str) -> u32 {
        self.hits.lock().unwrap().get(route).copied().unwrap_or(0)
    }

    fn hit(&self, route: &'static str) {
        *self.hits.lock().unwrap().entry(route).or_default() += 1;
    }

    fn user(&self, uid: &str) -> Option<JsonValue> {
        self.users.lock().unwrap().get(uid).cloned()
    }

    /// Subject behind a bearer token. `Ok(None)` for the backend-issued token.
    fn authorize(&self, headers: &HeaderMap) -> Result<Option<String>, Response> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| unauthorized("Missing token"))?;

        if self.reject_all.load(Ordering::SeqCst) || self.revoked.lock().unwrap().contains(token)
        {
            return Err(unauthorized("Invalid or expired token"));
        }
        if token == BACKEND_TOKEN {
            return Ok(None);
        }
        uid_of(token)
            .map(|uid| Some(uid.to_owned()))
            .ok_or_else(|| unauthorized("Malformed token"))
    }
}

fn uid_of(token: &str) -> Option<&str> {
    let mut parts = token.split(':');
    match (parts.next(), parts.next()) {
        (Some("tok"), Some(uid)) => Some(uid),
        _ => None,
    }
}

fn ok(data: JsonValue) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn failure(status: StatusCode, name: &str, message: &str, details: Option<JsonValue>) -> Response {
    let mut error = json!({ "name": name, "message": message, "statusCode": status.as_u16() });
    if let Some(details) = details {
        error["details"] = details;
    }
    (status, Json(json!({ "success": false, "error": error }))).into_response()
}

fn unauthorized(message: &str) -> Response {
    failure(StatusCode::UNAUTHORIZED, "UnauthorizedError", message, None)
}

async fn login(State(state): State<SharedBackend>, Json(body): Json<JsonValue>) -> Response {
    state.hit("login");
    let token = body["idToken"].as_str().unwrap_or_default();
    match uid_of(token).and_then(|uid| state.user(uid)) {
        Some(user) => ok(json!({ "user": user, "token": BACKEND_TOKEN })),
        None => unauthorized("Unknown identity"),
    }
}

async fn register(State(state): State<SharedBackend>, Json(body): Json<JsonValue>) -> Response {
    state.hit("register");
    if state.fail_register.load(Ordering::SeqCst) {
        return failure(
            StatusCode::BAD_REQUEST,
            "ValidationError",
            "Validation failed",
            Some(json!([{ "field": "name", "message": "Name is too short" }])),
        );
    }
    let uid = body["identityUid"].as_str().unwrap_or_default().to_owned();
    if uid_of(body["idToken"].as_str().unwrap_or_default()) != Some(uid.as_str()) {
        return unauthorized("Token does not match identity");
    }
    let user = json!({
        "uid": uid,
        "email": body["email"],
        "name": body["name"],
        "role": "user",
    });
    state.users.lock().unwrap().insert(uid, user.clone());
    (StatusCode::CREATED, Json(json!({ "success": true, "data": { "user": user } })))
        .into_response()
}

async fn verify(State(state): State<SharedBackend>, Json(body): Json<JsonValue>) -> Response {
    state.hit("verify");
    if state.fail_verify.load(Ordering::SeqCst) {
        return unauthorized("Token verification failed");
    }
    let token = body["idToken"].as_str().unwrap_or_default();
    match uid_of(token).and_then(|uid| state.user(uid)) {
        Some(user) => ok(json!({ "user": user })),
        None => unauthorized("Unknown identity"),
    }
}

async fn me(State(state): State<SharedBackend>, headers: HeaderMap) -> Response {
    state.hit("me");
    let delay = state.profile_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if state.fail_profile.load(Ordering::SeqCst) {
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            "Profile store unavailable",
            None,
        );
    }
    let uid = match state.authorize(&headers) {
        Ok(Some(uid)) => uid,
        Ok(None) => return failure(StatusCode::NOT_FOUND, "NotFoundError", "No profile", None),
        Err(response) => return response,
    };
    match state.user(&uid) {
        Some(user) => ok(json!({ "user": user })),
        None => failure(StatusCode::NOT_FOUND, "NotFoundError", "User not found", None),
    }
}

async fn things(State(state): State<SharedBackend>, headers: HeaderMap) -> Response {
    state.hit("things");
    match state.authorize(&headers) {
        Ok(_) => ok(json!(["alpha", "beta"])),
        Err(response) => response,
    }
}

async fn forbidden(State(state): State<SharedBackend>) -> Response {
    state.hit("forbidden");
    failure(
        StatusCode::FORBIDDEN,
        "ForbiddenError",
        "Insufficient permissions",
        None,
    )
}

async fn boom(State(state): State<SharedBackend>) -> Response {
    state.hit("boom");
    (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
}

/// Serve the stub backend on an ephemeral port.
pub async fn spawn_backend(state: SharedBackend) -> Url {
    let app = Router::new()
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/register", post(register))
        .route("/api/v1/auth/verify", post(verify))
        .route("/api/v1/auth/me", get(me))
        .route("/api/v1/things", get(things))
        .route("/api/v1/forbidden", get(forbidden))
        .route("/api/v1/boom", get(boom))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{addr}")).unwrap()
}

/// URL of a port nothing listens on.
pub async fn dead_url() -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{addr}")).unwrap()
}

/// URL of a server that accepts connections and never answers, plus the
/// number of connections it has accepted.
pub async fn silent_url() -> (Url, Arc<AtomicU32>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });
    (Url::parse(&format!("http://{addr}")).unwrap(), accepted)
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn test_config(api_url: Url) -> ClientConfig {
    ClientConfig::new(
        api_url,
        IdentitySettings::Configured(IdentityConfig::new(
            "test-key",
            "portal.example.com",
            "portal",
        )),
    )
    .with_timeout(Duration::from_secs(5))
}

pub struct Harness {
    pub config: ClientConfig,
    pub identity: Arc<IdentityClient<FakeIdentityProvider>>,
    pub store: TokenStore,
    pub pipeline: Arc<RequestPipeline<FakeIdentityProvider>>,
    pub backend: BackendSessionClient<FakeIdentityProvider>,
}

impl Harness {
    pub fn new(config: ClientConfig, provider: FakeIdentityProvider, store: TokenStore) -> Self {
        let identity = Arc::new(IdentityClient::new(provider));
        let pipeline =
            Arc::new(RequestPipeline::new(&config, identity.clone(), store.clone()).unwrap());
        let backend = BackendSessionClient::new(pipeline.clone());
        Self {
            config,
            identity,
            store,
            pipeline,
            backend,
        }
    }

    pub fn provider(&self) -> &FakeIdentityProvider {
        self.identity.provider()
    }

    pub async fn start_session(&self) -> Arc<SessionController<FakeIdentityProvider>> {
        SessionController::start(
            &self.config,
            self.identity.clone(),
            self.backend.clone(),
            self.store.clone(),
        )
        .await
    }
}

/// Backend with the default user, provider with the matching account.
pub async fn standard(mode: TokenMode) -> (Harness, SharedBackend) {
    let server = Arc::new(BackendState::default().with_user(UID, EMAIL));
    let url = spawn_backend(server.clone()).await;
    let provider = FakeIdentityProvider::default().with_account(EMAIL, PASSWORD, UID);
    let harness = Harness::new(
        test_config(url).with_token_mode(mode),
        provider,
        TokenStore::in_memory(),
    );
    (harness, server)
}

pub fn default_user() -> ApplicationUser {
    ApplicationUser::new(UID, EMAIL)
        .with_name("Test User")
        .with_role("user")
}
