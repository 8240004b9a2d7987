//! Request envelopes and their encoding.
//!
//! # Design
//! Every call to the admin API is a POST whose JSON body is tagged with a
//! `_type` discriminator. `Request` is the closed set of supported operations;
//! adding a kind means adding a variant, and the compiler then points at every
//! `match` that must handle it. `RequestKind` is the matching registry of wire
//! names, used when an operation is named at runtime.
//!
//! Encoding is pure. All checks (known kind, parameter shape, non-empty keys)
//! happen here, before anything is handed to the transport.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::Environment;
use crate::error::{ApiError, ApiResult};
use crate::http::{HttpRequest, RequestClass};
use crate::types::{json_type_name, AssetStatus, Item};

/// Name of the discriminator field in every request body.
pub const TYPE_TAG: &str = "_type";

/// A tagged request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type")]
pub enum Request {
    /// Fetch one item by `disp_id`.
    GetItem { disp_id: String },
    /// Fetch many items in one call. Unknown ids are simply absent from the
    /// response.
    GetBulkItems { disp_ids: Vec<String> },
    /// Fetch one page of the item listing. Pages start at 1.
    GetItems { page: u32, page_size: u32 },
    /// Replace an item with `item`. Not a patch: fields missing from `item`
    /// are deleted server-side.
    SetItem { item: Item, make_item_files: bool },
    /// Change a single enumerated field of the item with internal id `item_id`.
    SetAssetStatus { item_id: String, status: AssetStatus },
}

impl Request {
    pub fn get_item(disp_id: impl Into<String>) -> Self {
        Request::GetItem {
            disp_id: disp_id.into(),
        }
    }

    pub fn get_bulk_items<I, S>(disp_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Request::GetBulkItems {
            disp_ids: disp_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn get_items(page: u32, page_size: u32) -> Self {
        Request::GetItems { page, page_size }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::GetItem { .. } => RequestKind::GetItem,
            Request::GetBulkItems { .. } => RequestKind::GetBulkItems,
            Request::GetItems { .. } => RequestKind::GetItems,
            Request::SetItem { .. } => RequestKind::SetItem,
            Request::SetAssetStatus { .. } => RequestKind::SetAssetStatus,
        }
    }

    /// Reject parameter values the server would answer with a bare 400.
    pub fn validate(&self) -> ApiResult<()> {
        let invalid = |msg: &str| -> ApiResult<()> {
            Err(ApiError::InvalidRequest(format!("{}: {msg}", self.kind())))
        };
        match self {
            Request::GetItem { disp_id } if disp_id.is_empty() => invalid("empty disp_id"),
            Request::GetBulkItems { disp_ids } if disp_ids.is_empty() => invalid("no disp_ids"),
            Request::GetBulkItems { disp_ids } if disp_ids.iter().any(String::is_empty) => {
                invalid("empty disp_id in list")
            }
            Request::GetItems { page, .. } if *page == 0 => invalid("pages start at 1"),
            Request::GetItems { page_size, .. } if *page_size == 0 => invalid("page_size is 0"),
            Request::SetAssetStatus { item_id, .. } if item_id.is_empty() => invalid("empty item_id"),
            _ => Ok(()),
        }
    }
}

/// Registry of operation kinds the client can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    GetItem,
    GetBulkItems,
    GetItems,
    SetItem,
    SetAssetStatus,
}

impl RequestKind {
    pub const ALL: [RequestKind; 5] = [
        RequestKind::GetItem,
        RequestKind::GetBulkItems,
        RequestKind::GetItems,
        RequestKind::SetItem,
        RequestKind::SetAssetStatus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::GetItem => "GetItem",
            RequestKind::GetBulkItems => "GetBulkItems",
            RequestKind::GetItems => "GetItems",
            RequestKind::SetItem => "SetItem",
            RequestKind::SetAssetStatus => "SetAssetStatus",
        }
    }

    pub fn class(self) -> RequestClass {
        match self {
            RequestKind::GetItem | RequestKind::GetBulkItems | RequestKind::GetItems => {
                RequestClass::Read
            }
            RequestKind::SetItem | RequestKind::SetAssetStatus => RequestClass::Write,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ApiError::UnsupportedRequestKind { kind: s.to_string() })
    }
}

/// Builds `HttpRequest` values for one environment.
#[derive(Debug, Clone)]
pub struct RequestEncoder {
    environment: Environment,
    send_credentials: bool,
}

impl RequestEncoder {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            send_credentials: true,
        }
    }

    /// Disable forwarding of the ambient session credentials.
    pub fn without_credentials(mut self) -> Self {
        self.send_credentials = false;
        self
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Turn a runtime-named operation into a typed request.
    ///
    /// `params` must be a JSON object holding the kind's fields. Fails with
    /// `UnsupportedRequestKind` for names outside the registry.
    pub fn encode(kind: &str, params: Value) -> ApiResult<Request> {
        let kind: RequestKind = kind.parse()?;
        let mut fields = match params {
            Value::Object(fields) => fields,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(ApiError::InvalidRequest(format!(
                    "{kind}: parameters must be an object, got {}",
                    json_type_name(&other)
                )))
            }
        };
        fields.insert(TYPE_TAG.to_string(), Value::String(kind.as_str().to_string()));
        let request: Request = serde_json::from_value(Value::Object(fields))
            .map_err(|e| ApiError::InvalidRequest(format!("{kind}: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    pub fn build(&self, request: &Request) -> ApiResult<HttpRequest> {
        request.validate()?;
        let kind = request.kind();
        let body = serde_json::to_string(request)?;
        Ok(HttpRequest {
            url: self.environment.api_url(),
            headers: self.environment.headers(),
            body,
            class: kind.class(),
            kind: kind.as_str(),
            send_credentials: self.send_credentials,
        })
    }
}
