//! Client core for the game admin item API.
//!
//! # Overview
//! The admin API is a single JSON endpoint per environment. Every request is
//! a `POST` to `{base}/api` whose body names the operation in a `_type` field
//! (`GetItem`, `GetBulkItems`, `GetItems`, `SetItem`, `SetAssetStatus`).
//! Responses come back as `{item | items, metadata, users, read_only}`.
//!
//! # Design
//! - `EnvironmentResolver` maps `dev` / `liveops` / `production` to an
//!   `Environment`, which owns the base URL and the headers the server
//!   checks (origin and referer must match the environment).
//! - `RequestEncoder` turns a typed `Request` into a plain-data
//!   `HttpRequest`; `Transport` executes it; `ResponseValidator` turns the
//!   `HttpResponse` back into items. Building and parsing stay free of I/O so
//!   they can be tested without a server.
//! - `TransportClient` adds timeouts and retries. Only reads are retried.
//! - `ItemClient` ties it together for one environment and caches reads in a
//!   `QueryCache` that never runs two fetches for the same key at once.
//! - `BulkFetcher` and `Paginator` cover multi-item reads;
//!   `MutationCoordinator` covers writes, which replace the whole item.
//! - Items are schemaless JSON objects keyed by `disp_id`. Only the key
//!   fields are interpreted here.

pub mod bulk;
pub mod cache;
pub mod client;
pub mod config;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod http;
pub mod mutation;
pub mod paginate;
pub mod transport;
pub mod types;
pub mod validate;

#[cfg(test)]
mod testing;

pub use bulk::{BulkFetcher, BulkResult};
pub use cache::QueryCache;
pub use client::ItemClient;
pub use config::{BulkConfig, CachePolicy, ClientConfig, RetryPolicy};
pub use envelope::{Request, RequestEncoder, RequestKind};
pub use environment::{Environment, EnvironmentConfig, EnvironmentResolver};
pub use error::{ApiError, ApiResult};
pub use http::{HttpRequest, HttpResponse, RequestClass};
pub use mutation::{ItemDraft, MutationCoordinator};
pub use paginate::Paginator;
pub use transport::{ReqwestTransport, RequestState, Transport, TransportClient};
pub use types::{AssetStatus, Item};
pub use validate::{ExpectedShape, Payload, ResponseEnvelope, ResponseValidator};
