// Allow dead code: each test binary uses a different subset of the helpers
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use shopsession_core::auth::{CredentialStore, MemoryBackend, RefreshCoordinator};
use shopsession_core::session::{SessionEvent, SessionEvents};
use shopsession_core::{AuthenticatedClient, CredentialPair, SessionManager, SessionState};

/// What `POST token/refresh/` answers.
#[derive(Debug, Clone)]
pub enum RefreshPlan {
    /// 200 with a new access credential, optionally rotating the refresh credential.
    Issue {
        access: String,
        refresh: Option<String>,
    },
    Reject(u16),
    /// 200 with a body that is not a token response.
    Garbage,
    /// Never answer within any reasonable test timeout.
    Hang,
}

/// In-process stand-in for the shop API.
pub struct MockApi {
    pub refresh_calls: AtomicU32,
    pub protected_calls: AtomicU32,
    pub identity_calls: AtomicU32,
    pub reject_all: AtomicBool,
    pub staff: AtomicBool,
    valid_access: Mutex<String>,
    plan: Mutex<RefreshPlan>,
    refresh_delay: Mutex<Duration>,
    refresh_tokens_seen: Mutex<Vec<String>>,
    content_types_seen: Mutex<Vec<Option<String>>>,
}

impl MockApi {
    pub fn new(valid_access: &str, plan: RefreshPlan) -> Arc<Self> {
        Arc::new(Self {
            refresh_calls: AtomicU32::new(0),
            protected_calls: AtomicU32::new(0),
            identity_calls: AtomicU32::new(0),
            reject_all: AtomicBool::new(false),
            staff: AtomicBool::new(false),
            valid_access: Mutex::new(valid_access.to_string()),
            plan: Mutex::new(plan),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_tokens_seen: Mutex::new(Vec::new()),
            content_types_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn protected_calls(&self) -> u32 {
        self.protected_calls.load(Ordering::SeqCst)
    }

    pub fn set_plan(&self, plan: RefreshPlan) {
        *self.plan.lock().expect("plan lock") = plan;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().expect("delay lock") = delay;
    }

    pub fn set_valid_access(&self, access: &str) {
        *self.valid_access.lock().expect("access lock") = access.to_string();
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens_seen.lock().expect("seen lock").clone()
    }

    pub fn content_types_seen(&self) -> Vec<Option<String>> {
        self.content_types_seen.lock().expect("seen lock").clone()
    }

    fn accepts(&self, headers: &HeaderMap) -> Option<String> {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))?
            .to_string();
        let valid = self.valid_access.lock().expect("access lock").clone();
        (bearer == valid && !self.reject_all.load(Ordering::SeqCst)).then_some(bearer)
    }
}

async fn login(State(api): State<Arc<MockApi>>, Json(body): Json<Value>) -> Response {
    if body["password"] == "secret" {
        let access = api.valid_access.lock().expect("access lock").clone();
        Json(json!({"access": access, "refresh": "refresh-1"})).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "No active account found with the given credentials"})),
        )
            .into_response()
    }
}

async fn refresh(State(api): State<Arc<MockApi>>, Json(body): Json<Value>) -> Response {
    api.refresh_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(token) = body["refresh"].as_str() {
        api.refresh_tokens_seen
            .lock()
            .expect("seen lock")
            .push(token.to_string());
    }

    let delay = *api.refresh_delay.lock().expect("delay lock");
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let plan = api.plan.lock().expect("plan lock").clone();
    match plan {
        RefreshPlan::Issue { access, refresh } => {
            api.set_valid_access(&access);
            let mut body = json!({"access": access});
            if let Some(refresh) = refresh {
                body["refresh"] = Value::String(refresh);
            }
            Json(body).into_response()
        }
        RefreshPlan::Reject(status) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST),
            Json(json!({"detail": "Token is invalid or expired", "code": "token_not_valid"})),
        )
            .into_response(),
        RefreshPlan::Garbage => (StatusCode::OK, "<html>maintenance</html>").into_response(),
        RefreshPlan::Hang => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

async fn user(State(api): State<Arc<MockApi>>, headers: HeaderMap) -> Response {
    api.identity_calls.fetch_add(1, Ordering::SeqCst);
    match api.accepts(&headers) {
        Some(_) => Json(json!({
            "id": 42,
            "username": "gg",
            "email": "gg@example.com",
            "is_staff": api.staff.load(Ordering::SeqCst),
            "is_superuser": false,
        }))
        .into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn orders(State(api): State<Arc<MockApi>>, headers: HeaderMap) -> Response {
    api.protected_calls.fetch_add(1, Ordering::SeqCst);
    api.content_types_seen.lock().expect("seen lock").push(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    match api.accepts(&headers) {
        Some(token) => Json(json!({"token": token, "orders": []})).into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Given token not valid for any token type"})),
        )
            .into_response(),
    }
}

async fn broken() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "down for maintenance").into_response()
}

/// Serve `api` on an ephemeral port. Returns the `/api/` base URL.
pub async fn serve(api: Arc<MockApi>) -> String {
    let app = Router::new()
        .route("/api/token/", post(login))
        .route("/api/token/refresh/", post(refresh))
        .route("/api/user/", get(user))
        .route("/api/orders/", any(orders))
        .route("/api/broken/", any(broken))
        .with_state(api);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://{addr}/api/")
}

pub fn pair(access: &str, refresh: &str) -> CredentialPair {
    CredentialPair::from_raw(Some(access.to_string()), Some(refresh.to_string()))
}

/// The session components wired together without the manager's background tasks.
pub struct Parts {
    pub store: CredentialStore,
    pub coordinator: RefreshCoordinator,
    pub client: AuthenticatedClient,
    pub events: SessionEvents,
    pub expired: Arc<AtomicU32>,
}

pub fn parts(base_url: &str, initial: Option<CredentialPair>, refresh_timeout: Option<Duration>) -> Parts {
    let backend = match initial {
        Some(pair) => MemoryBackend::with_pair(pair),
        None => MemoryBackend::new(),
    };
    let store = CredentialStore::open(Box::new(backend)).expect("open store");
    let expired = Arc::new(AtomicU32::new(0));
    let hook_count = Arc::clone(&expired);
    let events = SessionEvents::new(Some(Arc::new(move |_reason: &str| {
        hook_count.fetch_add(1, Ordering::SeqCst);
    })));
    let http = reqwest::Client::new();
    let coordinator = RefreshCoordinator::new(
        http.clone(),
        format!("{base_url}token/refresh/"),
        store.clone(),
        events.clone(),
        refresh_timeout,
    );
    let client = AuthenticatedClient::new(
        http,
        base_url,
        store.clone(),
        coordinator.clone(),
        events.clone(),
    );
    Parts {
        store,
        coordinator,
        client,
        events,
        expired,
    }
}

pub fn access_of(store: &CredentialStore) -> Option<String> {
    store.access().map(|t| t.as_str().to_string())
}

pub fn refresh_of(store: &CredentialStore) -> Option<String> {
    store.refresh().map(|t| t.as_str().to_string())
}

/// Wait until the manager publishes a state matching `predicate`.
pub async fn wait_for_state(
    manager: &SessionManager,
    predicate: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    let mut rx = manager.watch_state();
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for session state")
        .expect("state publisher stopped");
    let cloned = state.clone();
    drop(state);
    cloned
}

/// Drain already-delivered events without waiting.
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
