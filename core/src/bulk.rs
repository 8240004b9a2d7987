//! Batched multi-item reads.
//!
//! # Design
//! Requested ids are de-duplicated, ids already in the item cache are served
//! from it, and ids another caller is fetching are awaited rather than sent
//! again. The rest are leased in the item cache, so concurrent readers of
//! those ids wait for this call, and split into batches of at most
//! `max_batch_size`.
//! Up to `max_concurrency` batches are in flight at once. Each batch succeeds
//! or fails on its own: a failed batch marks only its own ids as failed.
//! Results are reassembled in request order regardless of the order batches
//! complete in.
//!
//! Cancellation stops new batches from being dispatched. Batches already in
//! flight run to completion and their results are kept; ids that were never
//! dispatched come back as `ApiError::Cancelled`.

use std::collections::{HashMap, HashSet};

use futures::{future, stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{Claim, Lease};
use crate::client::ItemClient;
use crate::config::BulkConfig;
use crate::error::{ApiError, ApiResult};
use crate::types::Item;

/// Outcome of a bulk read, one slot per requested id, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
    slots: Vec<Result<Item, ApiError>>,
    cancelled: bool,
}

impl BulkResult {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Result<Item, ApiError>> {
        self.slots.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Result<Item, ApiError>> {
        self.slots.iter()
    }

    /// Whether the operation was cancelled before every batch was sent.
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Number of slots that did not produce an item, `NotFound` included.
    pub fn failed(&self) -> usize {
        self.slots.iter().filter(|s| s.is_err()).count()
    }

    pub fn found(&self) -> impl Iterator<Item = &Item> {
        self.slots.iter().filter_map(|s| s.as_ref().ok())
    }

    pub fn into_results(self) -> Vec<Result<Item, ApiError>> {
        self.slots
    }

    /// All items, or `PartialBulkFailure` if any slot failed.
    pub fn into_items(self) -> ApiResult<Vec<Item>> {
        let failed = self.failed();
        if failed > 0 {
            return Err(ApiError::PartialBulkFailure {
                failed,
                total: self.slots.len(),
            });
        }
        Ok(self.slots.into_iter().flatten().collect())
    }
}

/// Batched reader over an `ItemClient`.
#[derive(Debug, Clone)]
pub struct BulkFetcher<'a> {
    client: &'a ItemClient,
    max_batch_size: usize,
    max_concurrency: usize,
    cancel: Option<CancellationToken>,
}

impl<'a> BulkFetcher<'a> {
    pub(crate) fn new(client: &'a ItemClient, config: &BulkConfig) -> Self {
        Self {
            client,
            max_batch_size: config.max_batch_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
            cancel: None,
        }
    }

    pub fn with_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Fetch `disp_ids`, one result slot per id in the same order.
    ///
    /// Returns `Err` only when every slot failed with something other than
    /// `NotFound`; otherwise failures are reported per slot.
    pub async fn fetch<S: AsRef<str>>(&self, disp_ids: &[S]) -> ApiResult<BulkResult> {
        if disp_ids.is_empty() {
            return Ok(BulkResult::default());
        }
        let cache = self.client.item_cache();
        let mut resolved: HashMap<String, Result<Item, ApiError>> = HashMap::new();
        let mut seen = HashSet::new();
        let mut leases = Vec::new();
        let mut waiting = Vec::new();
        for id in disp_ids.iter().map(AsRef::as_ref) {
            if !seen.insert(id) {
                continue;
            }
            if id.is_empty() {
                resolved.insert(
                    String::new(),
                    Err(ApiError::InvalidRequest("empty disp_id".to_string())),
                );
                continue;
            }
            match cache.claim(id.to_string()) {
                Claim::Cached(item) => {
                    resolved.insert(id.to_string(), Ok(item));
                }
                Claim::Waiting(pending) => waiting.push((id.to_string(), pending)),
                Claim::Fetch(lease) => leases.push(lease),
            }
        }
        debug!(
            requested = disp_ids.len(),
            unique = seen.len(),
            to_fetch = leases.len(),
            in_flight = waiting.len(),
            "bulk fetch"
        );

        let mut batches: Vec<Vec<ItemLease<'_>>> = Vec::new();
        let mut leases = leases.into_iter().peekable();
        while leases.peek().is_some() {
            batches.push(leases.by_ref().take(self.max_batch_size).collect());
        }
        let completed: Vec<Vec<(String, Result<Item, ApiError>)>> = stream::iter(batches)
            .take_while(|_| future::ready(!self.is_cancelled()))
            .map(|batch| async move {
                let ids: Vec<String> = batch.iter().map(|lease| lease.key().clone()).collect();
                let result = self.client.fetch_bulk_batch(&ids).await;
                settle(batch, result)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
        resolved.extend(completed.into_iter().flatten());

        // Ids another caller was already fetching.
        for (id, pending) in waiting {
            if self.is_cancelled() {
                break;
            }
            let slot = match pending.wait().await {
                Some(result) => result,
                None => self.client.get_item(&id).await,
            };
            resolved.insert(id, slot);
        }

        let slots: Vec<Result<Item, ApiError>> = disp_ids
            .iter()
            .map(|id| {
                resolved
                    .get(id.as_ref())
                    .cloned()
                    .unwrap_or(Err(ApiError::Cancelled))
            })
            .collect();
        let cancelled = slots
            .iter()
            .any(|s| matches!(s, Err(ApiError::Cancelled)));

        if !cancelled {
            if let Some(err) = whole_call_failure(&slots) {
                return Err(err);
            }
        }
        Ok(BulkResult { slots, cancelled })
    }
}

type ItemLease<'a> = Lease<'a, String, Item>;

/// Turn one batch response into per-id results and hand each to the
/// callers waiting on that id.
fn settle(batch: Vec<ItemLease<'_>>, result: ApiResult<Vec<Item>>) -> Vec<(String, Result<Item, ApiError>)> {
    let mut by_id: HashMap<String, Item> = match result {
        Ok(items) => items
            .into_iter()
            .map(|item| (item.disp_id().to_string(), item))
            .collect(),
        Err(err) => {
            warn!(batch_len = batch.len(), error = %err, "bulk batch failed");
            return batch
                .into_iter()
                .map(|lease| {
                    let id = lease.key().clone();
                    lease.complete(Err(err.clone()));
                    (id, Err(err.clone()))
                })
                .collect();
        }
    };
    batch
        .into_iter()
        .map(|lease| {
            let id = lease.key().clone();
            let slot = by_id
                .remove(&id)
                .ok_or_else(|| ApiError::NotFound { disp_id: id.clone() });
            lease.complete(slot.clone());
            (id, slot)
        })
        .collect()
}

/// The error to raise when no slot produced an answer.
fn whole_call_failure(slots: &[Result<Item, ApiError>]) -> Option<ApiError> {
    let mut first = None;
    for slot in slots {
        match slot {
            Ok(_) => return None,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                first.get_or_insert_with(|| e.clone());
            }
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::environment::Environment;
    use crate::testing::{respond, store_handler, FnTransport};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn items(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| json!({"disp_id": format!("item_{i:03}"), "cost": i}))
            .collect()
    }

    fn client(transport: Arc<FnTransport>, batch: usize, concurrency: usize) -> ItemClient {
        let mut config = ClientConfig::default();
        config.bulk.max_batch_size = batch;
        config.bulk.max_concurrency = concurrency;
        config.retry.max_attempts = 1;
        let env = Environment::new("dev", "http://localhost:3000").unwrap();
        ItemClient::new(env, transport, config).unwrap()
    }

    fn ids(result: &BulkResult) -> Vec<String> {
        result
            .iter()
            .map(|slot| match slot {
                Ok(item) => item.disp_id().to_string(),
                Err(ApiError::NotFound { disp_id }) => format!("!{disp_id}"),
                Err(e) => format!("error: {e}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn missing_ids_are_not_found_in_place() {
        let transport = FnTransport::new(store_handler(vec![
            json!({"disp_id": "a"}),
            json!({"disp_id": "b"}),
        ]));
        let client = client(transport, 50, 4);
        let result = client.fetch_bulk(&["a", "b", "missing"]).await.unwrap();
        assert_eq!(ids(&result), vec!["a", "b", "!missing"]);
        assert_eq!(result.failed(), 1);
        assert!(matches!(
            result.into_items(),
            Err(ApiError::PartialBulkFailure { failed: 1, total: 3 })
        ));
    }

    #[tokio::test]
    async fn order_is_preserved_across_batches() {
        let transport = FnTransport::new(store_handler(items(40)));
        let client = client(transport.clone(), 7, 3);
        let wanted: Vec<String> = (0..40).rev().map(|i| format!("item_{i:03}")).collect();
        let result = client.fetch_bulk(&wanted).await.unwrap();
        assert_eq!(ids(&result), wanted);
        assert_eq!(transport.calls(), 6);
        for body in transport.bodies_of("GetBulkItems") {
            assert!(body["disp_ids"].as_array().unwrap().len() <= 7);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn order_survives_out_of_order_completion() {
        // Batches holding lower ids take longer, so they finish last.
        let transport = FnTransport::delayed_by(
            |body| {
                let first = body["disp_ids"][0].as_str().unwrap();
                let n: u64 = first["item_".len()..].parse().unwrap();
                Duration::from_millis(1_000 - n * 100)
            },
            store_handler(items(9)),
        );
        let client = client(transport, 3, 3);
        let wanted: Vec<String> = (0..9).map(|i| format!("item_{i:03}")).collect();
        let result = client.fetch_bulk(&wanted).await.unwrap();
        assert_eq!(ids(&result), wanted);
    }

    #[tokio::test]
    async fn failed_batch_only_affects_its_own_ids() {
        let store = store_handler(items(6));
        let transport = FnTransport::new(move |body| {
            if body["disp_ids"].as_array().unwrap().contains(&json!("item_002")) {
                respond(500, json!({"error": "boom"}))
            } else {
                store(body)
            }
        });
        let client = client(transport, 2, 2);
        let wanted: Vec<String> = (0..6).map(|i| format!("item_{i:03}")).collect();
        let result = client.fetch_bulk(&wanted).await.unwrap();
        let slots = result.into_results();
        assert!(slots[0].is_ok() && slots[1].is_ok());
        assert!(matches!(slots[2], Err(ApiError::Http { status: 500, .. })));
        assert!(matches!(slots[3], Err(ApiError::Http { status: 500, .. })));
        assert!(slots[4].is_ok() && slots[5].is_ok());
    }

    #[tokio::test]
    async fn whole_call_fails_when_every_batch_fails() {
        let transport = FnTransport::new(|_| respond(503, json!({})));
        let client = client(transport, 2, 2);
        let err = client.fetch_bulk(&["a", "b", "c"]).await.unwrap_err();
        assert!(matches!(err, ApiError::Http { status: 503, .. }));
    }

    #[tokio::test]
    async fn all_missing_is_not_an_operation_error() {
        let transport = FnTransport::new(store_handler(Vec::new()));
        let client = client(transport, 2, 2);
        let result = client.fetch_bulk(&["x", "y"]).await.unwrap();
        assert_eq!(ids(&result), vec!["!x", "!y"]);
    }

    #[tokio::test]
    async fn duplicates_and_cached_ids_are_not_refetched() {
        let transport = FnTransport::new(store_handler(items(3)));
        let client = client(transport.clone(), 50, 1);
        client.get_item("item_000").await.unwrap();

        let result = client
            .fetch_bulk(&["item_000", "item_001", "item_001", "item_002", "item_000"])
            .await
            .unwrap();
        assert_eq!(
            ids(&result),
            vec!["item_000", "item_001", "item_001", "item_002", "item_000"]
        );
        let bulk = transport.bodies_of("GetBulkItems");
        assert_eq!(bulk.len(), 1);
        assert_eq!(bulk[0]["disp_ids"], json!(["item_001", "item_002"]));

        // Bulk results fill the item cache.
        client.get_item("item_002").await.unwrap();
        assert_eq!(transport.bodies_of("GetItem").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_joins_a_single_read_in_flight() {
        let transport = FnTransport::delayed(Duration::from_millis(50), store_handler(items(2)));
        let client = client(transport.clone(), 50, 1);
        let (single, bulk) = tokio::join!(
            client.get_item("item_000"),
            client.fetch_bulk(&["item_000", "item_001"])
        );
        assert_eq!(single.unwrap().disp_id(), "item_000");
        assert_eq!(ids(&bulk.unwrap()), vec!["item_000", "item_001"]);
        assert_eq!(transport.bodies_of("GetItem").len(), 1);
        let bulk_calls = transport.bodies_of("GetBulkItems");
        assert_eq!(bulk_calls.len(), 1);
        assert_eq!(bulk_calls[0]["disp_ids"], json!(["item_001"]));
    }

    #[tokio::test(start_paused = true)]
    async fn single_read_joins_a_bulk_in_flight() {
        let transport = FnTransport::delayed(Duration::from_millis(50), store_handler(items(2)));
        let client = client(transport.clone(), 50, 1);
        let (bulk, single, missing) = tokio::join!(
            client.fetch_bulk(&["item_000", "item_001", "ghost"]),
            client.get_item("item_001"),
            client.get_item("ghost"),
        );
        assert_eq!(ids(&bulk.unwrap()), vec!["item_000", "item_001", "!ghost"]);
        assert_eq!(single.unwrap().disp_id(), "item_001");
        assert_eq!(missing.unwrap_err(), ApiError::NotFound { disp_id: "ghost".into() });
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_bulk_calls_fetch_each_id_once() {
        let transport = FnTransport::delayed(Duration::from_millis(50), store_handler(items(4)));
        let client = client(transport.clone(), 2, 2);
        let wanted: Vec<String> = (0..4).map(|i| format!("item_{i:03}")).collect();
        let (first, second) = tokio::join!(client.fetch_bulk(&wanted), client.fetch_bulk(&wanted));
        assert_eq!(ids(&first.unwrap()), wanted);
        assert_eq!(ids(&second.unwrap()), wanted);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn failed_batch_does_not_stay_cached() {
        let failing = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let store = store_handler(items(1));
        let flag = failing.clone();
        let transport = FnTransport::new(move |body| {
            if flag.load(std::sync::atomic::Ordering::SeqCst) {
                respond(500, json!({}))
            } else {
                store(body)
            }
        });
        let client = client(transport, 50, 1);
        assert!(client.fetch_bulk(&["item_000"]).await.is_err());
        failing.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(client.get_item("item_000").await.unwrap().disp_id(), "item_000");
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let transport = FnTransport::new(store_handler(Vec::new()));
        let client = client(transport.clone(), 50, 1);
        let result = client.fetch_bulk::<&str>(&[]).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let transport = FnTransport::new(store_handler(items(4)));
        let client = client(transport.clone(), 2, 1);
        let token = CancellationToken::new();
        token.cancel();
        let result = client
            .bulk()
            .with_cancellation(token)
            .fetch(&["item_000", "item_001", "item_002"])
            .await
            .unwrap();
        assert!(result.cancelled());
        assert!(result.iter().all(|s| matches!(s, Err(ApiError::Cancelled))));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_keeps_completed_batches() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let store = store_handler(items(6));
        let transport = FnTransport::new(move |body| {
            // Cancel as soon as the first batch is being served.
            trigger.cancel();
            store(body)
        });
        let client = client(transport.clone(), 2, 1);
        let wanted: Vec<String> = (0..6).map(|i| format!("item_{i:03}")).collect();
        let result = client
            .bulk()
            .with_cancellation(token)
            .fetch(&wanted)
            .await
            .unwrap();
        assert!(result.cancelled());
        assert_eq!(transport.calls(), 1);
        let slots = result.into_results();
        assert!(slots[0].is_ok() && slots[1].is_ok());
        assert!(slots[2..].iter().all(|s| matches!(s, Err(ApiError::Cancelled))));
    }
}
