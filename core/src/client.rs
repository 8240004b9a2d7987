//! Item client for one environment.
//!
//! # Design
//! `ItemClient` wires the pieces of a call together: `RequestEncoder` builds
//! the envelope, `TransportClient` sends it, `ResponseValidator` unwraps the
//! reply. Single-item and page reads go through a `QueryCache`; writes go
//! straight to the network and invalidate the cache afterwards.
//!
//! A client is bound to exactly one `Environment`, and so is its cache. Items
//! from two environments never share a cache entry.

use std::sync::Arc;

use reqwest::cookie::Jar;
use tracing::{debug, info, warn};

use crate::bulk::{BulkFetcher, BulkResult};
use crate::cache::QueryCache;
use crate::config::ClientConfig;
use crate::envelope::{Request, RequestEncoder};
use crate::environment::Environment;
use crate::error::{ApiError, ApiResult};
use crate::http::HttpResponse;
use crate::mutation::MutationCoordinator;
use crate::paginate::Paginator;
use crate::transport::{ReqwestTransport, Transport, TransportClient};
use crate::types::Item;
use crate::validate::{ResponseEnvelope, ResponseValidator};

/// Cache key of a listing page: `(page, page_size)`.
pub type PageKey = (u32, u32);

/// Client for the admin item API of one environment.
#[derive(Debug)]
pub struct ItemClient {
    encoder: RequestEncoder,
    transport: TransportClient,
    validator: ResponseValidator,
    items: QueryCache<String, Item>,
    pages: QueryCache<PageKey, Vec<Item>>,
    config: ClientConfig,
}

impl ItemClient {
    pub fn new(
        environment: Environment,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> ApiResult<Self> {
        config.validate()?;
        Ok(Self {
            encoder: RequestEncoder::new(environment),
            transport: TransportClient::new(transport, config.retry.clone(), config.timeout()),
            validator: ResponseValidator::new(),
            items: QueryCache::new(&config.cache),
            pages: QueryCache::new(&config.cache),
            config,
        })
    }

    /// A client sending requests over HTTP without a session.
    pub fn connect(environment: Environment, config: ClientConfig) -> ApiResult<Self> {
        Self::new(environment, Arc::new(ReqwestTransport::new()?), config)
    }

    /// A client forwarding cookies from the session manager's jar.
    pub fn with_session(
        environment: Environment,
        session: Arc<Jar>,
        config: ClientConfig,
    ) -> ApiResult<Self> {
        Self::new(
            environment,
            Arc::new(ReqwestTransport::with_session(session)?),
            config,
        )
    }

    /// Replace the response validator, e.g. to require more key fields.
    pub fn with_validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn environment(&self) -> &Environment {
        self.encoder.environment()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Encode and send one request, returning the 2xx response.
    pub async fn call(&self, request: &Request) -> ApiResult<HttpResponse> {
        let http = self.encoder.build(request)?;
        self.transport.send(&http).await
    }

    /// Fetch an item, served from the cache when present.
    pub async fn get_item(&self, disp_id: &str) -> ApiResult<Item> {
        self.items
            .get(disp_id.to_string(), || self.fetch_item(disp_id))
            .await
    }

    /// Fetch an item from the server, bypassing the cache.
    pub async fn fetch_item(&self, disp_id: &str) -> ApiResult<Item> {
        let not_found = || ApiError::NotFound {
            disp_id: disp_id.to_string(),
        };
        let response = match self.call(&Request::get_item(disp_id)).await {
            Err(ApiError::Http { status: 404, .. }) => return Err(not_found()),
            other => other?,
        };
        let item = self.validator.parse_item(&response)?.payload.ok_or_else(not_found)?;
        if item.disp_id() != disp_id {
            return Err(ApiError::InvalidResponseShape(format!(
                "asked for `{disp_id}`, got `{}`",
                item.disp_id()
            )));
        }
        Ok(item)
    }

    /// Fetch one listing page, served from the cache when present.
    pub async fn get_items_page(&self, page: u32, page_size: u32) -> ApiResult<Vec<Item>> {
        self.pages
            .get((page, page_size), || self.fetch_items_page(page, page_size))
            .await
    }

    /// Fetch one listing page from the server, bypassing the cache.
    pub async fn fetch_items_page(&self, page: u32, page_size: u32) -> ApiResult<Vec<Item>> {
        let response = self.call(&Request::get_items(page, page_size)).await?;
        Ok(self.validator.parse_items(&response)?.payload)
    }

    /// One `GetBulkItems` call. Ids the server does not know are absent from
    /// the result.
    pub(crate) async fn fetch_bulk_batch(&self, disp_ids: &[String]) -> ApiResult<Vec<Item>> {
        let response = self.call(&Request::get_bulk_items(disp_ids.iter().cloned())).await?;
        Ok(self.validator.parse_items(&response)?.payload)
    }

    /// Send a write and invalidate what it may have changed.
    ///
    /// Once the request has left the client the write may have been applied,
    /// whatever the outcome, so the cache is invalidated on every result
    /// except a local encoding failure. A malformed echo of an applied write
    /// is logged and treated as no echo.
    pub(crate) async fn write(&self, request: &Request) -> ApiResult<ResponseEnvelope<Option<Item>>> {
        let http = self.encoder.build(request)?;
        let written = match request {
            Request::SetItem { item, .. } => Some(item.disp_id().to_string()),
            _ => None,
        };
        let ack = self.transport.send(&http).await.map(|response| {
            self.validator.parse_item(&response).unwrap_or_else(|err| {
                warn!(kind = %request.kind(), error = %err, "write applied, echo ignored");
                ResponseEnvelope {
                    payload: None,
                    metadata: Default::default(),
                    users: Default::default(),
                    read_only: false,
                }
            })
        });

        let echoed = ack
            .as_ref()
            .ok()
            .and_then(|env| env.payload.as_ref())
            .map(|item| item.disp_id().to_string());
        match written.or(echoed) {
            Some(disp_id) => self.invalidate_item(&disp_id),
            None => self.clear_cache(),
        }
        match &ack {
            Ok(_) => info!(kind = %request.kind(), environment = self.environment().name(), "write acknowledged"),
            Err(err) => warn!(kind = %request.kind(), error = %err, "write failed, cache invalidated"),
        }
        ack
    }

    pub fn bulk(&self) -> BulkFetcher<'_> {
        BulkFetcher::new(self, &self.config.bulk)
    }

    pub fn paginator(&self, page_size: u32) -> Paginator<'_> {
        Paginator::new(self, page_size)
    }

    pub fn mutations(&self) -> MutationCoordinator<'_> {
        MutationCoordinator::new(self, self.config.make_item_files)
    }

    /// Fetch many items, aligned to `disp_ids`. See [`BulkFetcher::fetch`].
    pub async fn fetch_bulk<S: AsRef<str>>(&self, disp_ids: &[S]) -> ApiResult<BulkResult> {
        self.bulk().fetch(disp_ids).await
    }

    pub(crate) fn item_cache(&self) -> &QueryCache<String, Item> {
        &self.items
    }

    /// Forget the cached item and every cached page, which may contain it.
    pub fn invalidate_item(&self, disp_id: &str) {
        let item = self.items.invalidate(&disp_id.to_string());
        let pages = self.pages.invalidate_where(|_| true);
        debug!(disp_id, item, pages, "cache invalidated");
    }

    /// Forget every cached item whose `disp_id` matches.
    pub fn invalidate_items_where(&self, mut matches: impl FnMut(&str) -> bool) -> usize {
        let dropped = self.items.invalidate_where(|k| matches(k));
        self.pages.clear();
        dropped
    }

    pub fn clear_cache(&self) {
        self.items.clear();
        self.pages.clear();
        debug!("cache cleared");
    }
}
