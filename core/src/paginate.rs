//! Lazy page iteration over the item listing.
//!
//! Pages are numbered from 1 and fetched one at a time, only when asked for.
//! A page holding fewer items than `page_size` is the last one. After a
//! cancellation no further page is requested; a page already in flight is
//! allowed to finish and its result is discarded.

use futures::{stream, Stream, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ItemClient;
use crate::error::{ApiError, ApiResult};
use crate::types::Item;

/// Restartable cursor over the listing of one environment.
#[derive(Debug, Clone)]
pub struct Paginator<'a> {
    client: &'a ItemClient,
    page_size: u32,
    next_page: u32,
    done: bool,
    cancel: Option<CancellationToken>,
}

impl<'a> Paginator<'a> {
    pub(crate) fn new(client: &'a ItemClient, page_size: u32) -> Self {
        Self {
            client,
            page_size,
            next_page: 1,
            done: false,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of the page the next call to `next_page` will request.
    pub fn current_page(&self) -> u32 {
        self.next_page
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch the next page, or `None` once the listing is exhausted or the
    /// paginator was cancelled.
    pub async fn next_page(&mut self) -> ApiResult<Option<Vec<Item>>> {
        if self.done || self.is_cancelled() {
            return Ok(None);
        }
        let page = self.next_page;
        let items = self.client.get_items_page(page, self.page_size).await?;
        if self.is_cancelled() {
            debug!(page, "paginator cancelled, discarding page");
            self.done = true;
            return Ok(None);
        }
        self.next_page += 1;
        if items.len() < self.page_size as usize {
            self.done = true;
        }
        debug!(page, len = items.len(), last = self.done, "page fetched");
        Ok((!items.is_empty()).then_some(items))
    }

    /// Go back to page 1. Client, page size and cancellation token are kept.
    pub fn reset(&mut self) {
        self.next_page = 1;
        self.done = false;
    }

    /// Fetch every remaining page.
    pub async fn collect_all(&mut self) -> ApiResult<Vec<Item>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    /// The remaining items as a lazy stream; pages are requested as the
    /// stream is polled.
    pub fn into_stream(self) -> impl Stream<Item = ApiResult<Item>> + 'a {
        stream::try_unfold(self, |mut pager| async move {
            let page = pager.next_page().await?;
            Ok::<_, ApiError>(page.map(|items| {
                (stream::iter(items.into_iter().map(Ok::<_, ApiError>)), pager)
            }))
        })
        .try_flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::environment::Environment;
    use crate::testing::{store_handler, FnTransport};
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Arc;

    fn client(n: usize) -> (ItemClient, Arc<FnTransport>) {
        let items = (0..n).map(|i| json!({"disp_id": format!("item_{i:03}")})).collect();
        let transport = FnTransport::new(store_handler(items));
        let env = Environment::new("dev", "http://localhost:3000").unwrap();
        let client = ItemClient::new(env, transport.clone(), ClientConfig::default()).unwrap();
        (client, transport)
    }

    #[tokio::test]
    async fn pages_end_on_short_page() {
        let (client, transport) = client(120);
        let mut pager = client.paginator(50);
        let mut sizes = Vec::new();
        while let Some(page) = pager.next_page().await.unwrap() {
            sizes.push(page.len());
        }
        assert_eq!(sizes, vec![50, 50, 20]);
        assert!(pager.is_done());
        assert_eq!(pager.next_page().await.unwrap(), None);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn exact_multiple_ends_on_empty_page() {
        let (client, transport) = client(100);
        let all = client.paginator(50).collect_all().await.unwrap();
        assert_eq!(all.len(), 100);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn reset_restarts_at_page_one() {
        let (client, _) = client(120);
        let mut pager = client.paginator(50);
        let first = pager.next_page().await.unwrap().unwrap();
        pager.collect_all().await.unwrap();
        pager.reset();
        assert_eq!(pager.current_page(), 1);
        assert_eq!(pager.next_page().await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn stream_is_lazy() {
        let (client, transport) = client(120);
        let first_ten: Vec<Item> = client
            .paginator(50)
            .into_stream()
            .take(10)
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(first_ten.len(), 10);
        assert_eq!(first_ten[0].disp_id(), "item_000");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn stream_yields_everything_in_order() {
        let (client, _) = client(73);
        let all: Vec<Item> = client.paginator(20).into_stream().try_collect().await.unwrap();
        assert_eq!(all.len(), 73);
        assert_eq!(all[72].disp_id(), "item_072");
    }

    #[tokio::test]
    async fn cancelled_paginator_stops_requesting() {
        let (client, transport) = client(120);
        let token = CancellationToken::new();
        let mut pager = client.paginator(50).with_cancellation(token.clone());
        assert!(pager.next_page().await.unwrap().is_some());
        token.cancel();
        assert_eq!(pager.next_page().await.unwrap(), None);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn page_in_flight_at_cancellation_is_discarded() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let items = (0..120).map(|i| json!({"disp_id": format!("item_{i:03}")})).collect();
        let store = store_handler(items);
        let transport = FnTransport::new(move |body| {
            // Cancel while the page request is being served.
            trigger.cancel();
            store(body)
        });
        let env = Environment::new("dev", "http://localhost:3000").unwrap();
        let client = ItemClient::new(env, transport.clone(), ClientConfig::default()).unwrap();

        let mut pager = client.paginator(50).with_cancellation(token);
        assert_eq!(pager.next_page().await.unwrap(), None);
        assert!(pager.is_done());
        assert_eq!(pager.current_page(), 1);
        assert_eq!(pager.next_page().await.unwrap(), None);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn empty_listing_yields_nothing() {
        let (client, _) = client(0);
        let mut pager = client.paginator(10);
        assert_eq!(pager.next_page().await.unwrap(), None);
        assert!(pager.is_done());
    }
}
