//! In-memory stand-in for the game admin API.
//!
//! Serves `POST /api` with `_type`-tagged request bodies and answers in the
//! `{item | items, metadata, users, read_only}` envelope. Items are kept in a
//! `BTreeMap` keyed by `disp_id`, so listing order is stable.
//!
//! Test hooks: per-kind call counters, ids that make a request fail with 500,
//! artificial latency, a required session cookie and a read-only mode.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DISP_ID: &str = "disp_id";
pub const INTERNAL_ID: &str = "_id";
/// Name of the cookie carrying the session when one is required.
pub const SESSION_COOKIE: &str = "session";

/// A stored item: a JSON object with at least `disp_id` and `_id`.
pub type Fields = Map<String, Value>;

/// Calls the server understands. Defined independently from the client's
/// request type so that the integration tests catch drift.
#[derive(Debug, Deserialize)]
#[serde(tag = "_type")]
enum Call {
    GetItem {
        disp_id: String,
    },
    GetBulkItems {
        disp_ids: Vec<String>,
    },
    GetItems {
        page: u32,
        page_size: u32,
    },
    SetItem {
        item: Fields,
        #[serde(default)]
        make_item_files: bool,
    },
    SetAssetStatus {
        item_id: String,
        status: String,
    },
}

#[derive(Debug)]
struct Inner {
    items: RwLock<BTreeMap<String, Fields>>,
    calls: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    latency: Duration,
    session: Option<String>,
    read_only: bool,
}

/// Shared server state. Cloning is cheap; clones see the same store.
#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl Default for AppState {
    fn default() -> Self {
        MockApi::new().build()
    }
}

/// Builder for an [`AppState`].
#[derive(Debug, Default)]
pub struct MockApi {
    items: BTreeMap<String, Fields>,
    latency: Duration,
    session: Option<String>,
    read_only: bool,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store. Values that are not objects with a `disp_id` are
    /// skipped; missing `_id`s are assigned.
    pub fn with_items(mut self, items: impl IntoIterator<Item = Value>) -> Self {
        for value in items {
            match value {
                Value::Object(fields) => match disp_id_of(&fields) {
                    Some(disp_id) => {
                        let disp_id = disp_id.to_string();
                        self.items.insert(disp_id, with_internal_id(fields, None));
                    }
                    None => warn!("seed item without disp_id skipped"),
                },
                other => warn!(%other, "seed item is not an object"),
            }
        }
        self
    }

    /// Sleep this long before answering every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer 401 unless the `session` cookie carries `token`.
    pub fn require_session(mut self, token: &str) -> Self {
        self.session = Some(token.to_string());
        self
    }

    /// Report `read_only` and refuse writes with 403.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn build(self) -> AppState {
        AppState {
            inner: Arc::new(Inner {
                items: RwLock::new(self.items),
                calls: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                latency: self.latency,
                session: self.session,
                read_only: self.read_only,
            }),
        }
    }
}

impl AppState {
    /// Number of calls received with the given `_type`.
    pub fn calls(&self, kind: &str) -> usize {
        let calls = self.inner.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.get(kind).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        let calls = self.inner.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.values().sum()
    }

    /// Make every call touching `disp_id` fail with 500.
    pub fn fail_on(&self, disp_id: &str) {
        self.failing().insert(disp_id.to_string());
    }

    pub fn heal(&self, disp_id: &str) {
        self.failing().remove(disp_id);
    }

    pub async fn item(&self, disp_id: &str) -> Option<Value> {
        let items = self.inner.items.read().await;
        items.get(disp_id).cloned().map(Value::Object)
    }

    pub async fn len(&self) -> usize {
        self.inner.items.read().await.len()
    }

    fn failing(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.inner.failing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, kind: &str) {
        let mut calls = self.inner.calls.lock().unwrap_or_else(PoisonError::into_inner);
        *calls.entry(kind.to_string()).or_default() += 1;
    }

    fn fails<'a>(&self, mut ids: impl Iterator<Item = &'a str>) -> bool {
        let failing = self.failing();
        ids.any(|id| failing.contains(id))
    }

    fn envelope(&self, key: &str, payload: Value) -> Json<Value> {
        let mut body = json!({
            "metadata": {"server": "mock"},
            "users": {},
            "read_only": self.inner.read_only,
        });
        body[key] = payload;
        Json(body)
    }
}

pub fn app() -> Router {
    app_with_state(AppState::default())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/api", post(rpc))
        .route("/thumbnails/{file}", get(thumbnail))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    serve(listener, AppState::default()).await
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

type Reply = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn reject(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"error": message.into()})))
}

fn disp_id_of(fields: &Fields) -> Option<&str> {
    fields
        .get(DISP_ID)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

fn with_internal_id(mut fields: Fields, existing: Option<&Value>) -> Fields {
    if !fields.contains_key(INTERNAL_ID) {
        let id = existing
            .cloned()
            .unwrap_or_else(|| Value::String(Uuid::new_v4().to_string()));
        fields.insert(INTERNAL_ID.to_string(), id);
    }
    fields
}

fn has_session(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(name, value)| name == SESSION_COOKIE && value == token)
}

async fn rpc(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    let kind = body
        .get("_type")
        .and_then(Value::as_str)
        .unwrap_or("<missing>")
        .to_string();
    state.count(&kind);
    debug!(%kind, "rpc");

    if !state.inner.latency.is_zero() {
        tokio::time::sleep(state.inner.latency).await;
    }
    if let Some(token) = &state.inner.session {
        if !has_session(&headers, token) {
            return Err(reject(StatusCode::UNAUTHORIZED, "no session"));
        }
    }

    let call: Call = serde_json::from_value(body)
        .map_err(|e| reject(StatusCode::BAD_REQUEST, format!("bad request `{kind}`: {e}")))?;
    match call {
        Call::GetItem { disp_id } => get_item(&state, disp_id).await,
        Call::GetBulkItems { disp_ids } => get_bulk_items(&state, disp_ids).await,
        Call::GetItems { page, page_size } => get_items(&state, page, page_size).await,
        Call::SetItem {
            item,
            make_item_files,
        } => set_item(&state, item, make_item_files).await,
        Call::SetAssetStatus { item_id, status } => set_asset_status(&state, item_id, status).await,
    }
}

async fn get_item(state: &AppState, disp_id: String) -> Reply {
    if state.fails(std::iter::once(disp_id.as_str())) {
        return Err(reject(StatusCode::INTERNAL_SERVER_ERROR, "injected failure"));
    }
    let items = state.inner.items.read().await;
    match items.get(&disp_id) {
        Some(item) => Ok(state.envelope("item", Value::Object(item.clone()))),
        None => Err(reject(StatusCode::NOT_FOUND, format!("no item `{disp_id}`"))),
    }
}

async fn get_bulk_items(state: &AppState, disp_ids: Vec<String>) -> Reply {
    if state.fails(disp_ids.iter().map(String::as_str)) {
        return Err(reject(StatusCode::INTERNAL_SERVER_ERROR, "injected failure"));
    }
    let items = state.inner.items.read().await;
    let found: Vec<Value> = disp_ids
        .iter()
        .filter_map(|id| items.get(id))
        .cloned()
        .map(Value::Object)
        .collect();
    Ok(state.envelope("items", Value::Array(found)))
}

async fn get_items(state: &AppState, page: u32, page_size: u32) -> Reply {
    if page == 0 || page_size == 0 {
        return Err(reject(StatusCode::BAD_REQUEST, "page and page_size start at 1"));
    }
    let items = state.inner.items.read().await;
    let skip = (page as usize - 1) * page_size as usize;
    let slice: Vec<Value> = items
        .values()
        .skip(skip)
        .take(page_size as usize)
        .cloned()
        .map(Value::Object)
        .collect();
    Ok(state.envelope("items", Value::Array(slice)))
}

async fn set_item(state: &AppState, item: Fields, make_item_files: bool) -> Reply {
    if state.inner.read_only {
        return Err(reject(StatusCode::FORBIDDEN, "read only"));
    }
    let Some(disp_id) = disp_id_of(&item).map(str::to_string) else {
        return Err(reject(StatusCode::BAD_REQUEST, "item has no disp_id"));
    };
    if state.fails(std::iter::once(disp_id.as_str())) {
        return Err(reject(StatusCode::INTERNAL_SERVER_ERROR, "injected failure"));
    }
    let mut items = state.inner.items.write().await;
    let existing = items.get(&disp_id).and_then(|old| old.get(INTERNAL_ID));
    let stored = with_internal_id(item, existing);
    items.insert(disp_id.clone(), stored.clone());
    info!(%disp_id, make_item_files, "item replaced");
    Ok(state.envelope("item", Value::Object(stored)))
}

async fn set_asset_status(state: &AppState, item_id: String, status: String) -> Reply {
    if state.inner.read_only {
        return Err(reject(StatusCode::FORBIDDEN, "read only"));
    }
    let mut items = state.inner.items.write().await;
    let item = items
        .values_mut()
        .find(|item| item.get(INTERNAL_ID).and_then(Value::as_str) == Some(item_id.as_str()))
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, format!("no item with _id `{item_id}`")))?;
    item.insert("status".to_string(), Value::String(status.clone()));
    info!(%item_id, %status, "asset status set");
    Ok(state.envelope("item", Value::Object(item.clone())))
}

/// Placeholder PNG bytes served for every known item.
const THUMBNAIL: &[u8] = b"\x89PNG\r\n\x1a\n";

async fn thumbnail(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    let Some(disp_id) = file.strip_suffix(".png") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if state.inner.items.read().await.contains_key(disp_id) {
        ([(header::CONTENT_TYPE, "image/png")], THUMBNAIL).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}
