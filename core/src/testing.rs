//! In-memory transport doubles for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::ApiResult;
use crate::http::{HttpRequest, HttpResponse};
use crate::transport::Transport;

type Handler = dyn Fn(&Value) -> ApiResult<HttpResponse> + Send + Sync;
type Delay = dyn Fn(&Value) -> Duration + Send + Sync;

/// A transport answering every request with a closure over the parsed body.
pub struct FnTransport {
    handler: Box<Handler>,
    delay: Box<Delay>,
    calls: AtomicUsize,
    bodies: Mutex<Vec<Value>>,
}

impl FnTransport {
    pub fn new(handler: impl Fn(&Value) -> ApiResult<HttpResponse> + Send + Sync + 'static) -> Arc<Self> {
        Self::delayed_by(|_| Duration::ZERO, handler)
    }

    pub fn delayed(
        delay: Duration,
        handler: impl Fn(&Value) -> ApiResult<HttpResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::delayed_by(move |_| delay, handler)
    }

    /// Sleep for `delay(body)` before answering each request.
    pub fn delayed_by(
        delay: impl Fn(&Value) -> Duration + Send + Sync + 'static,
        handler: impl Fn(&Value) -> ApiResult<HttpResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            delay: Box::new(delay),
            calls: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Request bodies with the given `_type`, in send order.
    pub fn bodies_of(&self, kind: &str) -> Vec<Value> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b["_type"] == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for FnTransport {
    async fn execute(&self, request: &HttpRequest, _timeout: Duration) -> ApiResult<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body: Value = serde_json::from_str(&request.body).unwrap();
        self.bodies.lock().unwrap().push(body.clone());
        let delay = (self.delay)(&body);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(&body)
    }
}

pub fn respond(status: u16, body: Value) -> ApiResult<HttpResponse> {
    Ok(HttpResponse {
        status,
        headers: Vec::new(),
        body: body.to_string(),
    })
}

/// A small in-memory item store answering every request kind.
pub fn store_handler(
    items: Vec<Value>,
) -> impl Fn(&Value) -> ApiResult<HttpResponse> + Send + Sync + 'static {
    let store: Arc<Mutex<Vec<Map<String, Value>>>> = Arc::new(Mutex::new(
        items
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect(),
    ));
    move |body| {
        let mut items = store.lock().unwrap();
        match body["_type"].as_str().unwrap() {
            "GetItem" => match items.iter().find(|i| i["disp_id"] == body["disp_id"]) {
                Some(item) => respond(200, json!({"item": item, "metadata": {}, "users": {}, "read_only": false})),
                None => respond(404, json!({"error": "not found"})),
            },
            "GetBulkItems" => {
                let wanted = body["disp_ids"].as_array().unwrap();
                let found: Vec<_> = items
                    .iter()
                    .filter(|i| wanted.contains(&i["disp_id"]))
                    .cloned()
                    .collect();
                respond(200, json!({"items": found}))
            }
            "GetItems" => {
                let page = body["page"].as_u64().unwrap() as usize;
                let size = body["page_size"].as_u64().unwrap() as usize;
                let slice: Vec<_> = items.iter().skip((page - 1) * size).take(size).cloned().collect();
                respond(200, json!({"items": slice}))
            }
            "SetItem" => {
                let item = body["item"].as_object().cloned().unwrap();
                items.retain(|i| i["disp_id"] != item["disp_id"]);
                items.push(item.clone());
                respond(200, json!({"item": item}))
            }
            "SetAssetStatus" => match items.iter_mut().find(|i| i["_id"] == body["item_id"]) {
                Some(item) => {
                    item.insert("status".into(), body["status"].clone());
                    respond(200, json!({"item": item}))
                }
                None => respond(404, json!({"error": "not found"})),
            },
            other => respond(400, json!({"error": format!("unknown _type {other}")})),
        }
    }
}
