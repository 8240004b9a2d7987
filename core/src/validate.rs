//! Response parsing and structural validation.
//!
//! # Design
//! A response envelope is `{<payload-key>: item | items, metadata, users,
//! read_only}`. The validator checks the envelope shape and that every item
//! carries its declared key fields. It does not check the rest of an item:
//! the server owns that schema and extends it over time.

use serde_json::{Map, Value};

use crate::error::{ApiError, ApiResult};
use crate::http::HttpResponse;
use crate::types::{json_type_name, Item, DISP_ID};

/// Envelope key holding a single item.
pub const ITEM_KEY: &str = "item";
/// Envelope key holding a list of items.
pub const ITEMS_KEY: &str = "items";

/// The payload a request expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedShape {
    /// `item` must be present and be an item.
    Item,
    /// `item` may be absent or null.
    OptionalItem,
    /// `items` must be a list of items.
    Items,
}

/// Validated payload of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Item(Item),
    Items(Vec<Item>),
    Empty,
}

/// A validated response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope<T> {
    pub payload: T,
    pub metadata: Map<String, Value>,
    pub users: Map<String, Value>,
    pub read_only: bool,
}

impl<T> ResponseEnvelope<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> ResponseEnvelope<U> {
        ResponseEnvelope {
            payload: f(self.payload),
            metadata: self.metadata,
            users: self.users,
            read_only: self.read_only,
        }
    }
}

/// Parses and validates response envelopes.
#[derive(Debug, Clone)]
pub struct ResponseValidator {
    key_fields: Vec<String>,
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self {
            key_fields: vec![DISP_ID.to_string()],
        }
    }
}

impl ResponseValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require additional key fields on every returned item.
    pub fn with_key_field(mut self, field: &str) -> Self {
        if !self.key_fields.iter().any(|f| f == field) {
            self.key_fields.push(field.to_string());
        }
        self
    }

    pub fn validate(
        &self,
        response: &HttpResponse,
        shape: ExpectedShape,
    ) -> ApiResult<ResponseEnvelope<Payload>> {
        check_status(response)?;
        let mut root = match serde_json::from_str::<Value>(&response.body) {
            Ok(Value::Object(root)) => root,
            Ok(other) => {
                return Err(ApiError::InvalidResponseShape(format!(
                    "envelope must be an object, got {}",
                    json_type_name(&other)
                )))
            }
            Err(e) => return Err(ApiError::InvalidResponseShape(format!("body is not JSON: {e}"))),
        };

        let payload = match shape {
            ExpectedShape::Item => match root.remove(ITEM_KEY) {
                Some(Value::Null) | None => {
                    return Err(ApiError::InvalidResponseShape(format!("missing `{ITEM_KEY}`")))
                }
                Some(value) => Payload::Item(self.item(value)?),
            },
            ExpectedShape::OptionalItem => match root.remove(ITEM_KEY) {
                Some(Value::Null) | None => Payload::Empty,
                Some(value) => Payload::Item(self.item(value)?),
            },
            ExpectedShape::Items => match root.remove(ITEMS_KEY) {
                Some(Value::Array(values)) => Payload::Items(
                    values
                        .into_iter()
                        .map(|v| self.item(v))
                        .collect::<ApiResult<Vec<_>>>()?,
                ),
                Some(other) => {
                    return Err(ApiError::InvalidResponseShape(format!(
                        "`{ITEMS_KEY}` must be an array, got {}",
                        json_type_name(&other)
                    )))
                }
                None => {
                    return Err(ApiError::InvalidResponseShape(format!("missing `{ITEMS_KEY}`")))
                }
            },
        };

        Ok(ResponseEnvelope {
            payload,
            metadata: take_object(&mut root, "metadata")?,
            users: take_object(&mut root, "users")?,
            read_only: match root.remove("read_only") {
                None | Some(Value::Null) => false,
                Some(Value::Bool(b)) => b,
                Some(other) => {
                    return Err(ApiError::InvalidResponseShape(format!(
                        "`read_only` must be a boolean, got {}",
                        json_type_name(&other)
                    )))
                }
            },
        })
    }

    pub fn parse_item(&self, response: &HttpResponse) -> ApiResult<ResponseEnvelope<Option<Item>>> {
        Ok(self
            .validate(response, ExpectedShape::OptionalItem)?
            .map(|payload| match payload {
                Payload::Item(item) => Some(item),
                _ => None,
            }))
    }

    pub fn parse_items(&self, response: &HttpResponse) -> ApiResult<ResponseEnvelope<Vec<Item>>> {
        Ok(self
            .validate(response, ExpectedShape::Items)?
            .map(|payload| match payload {
                Payload::Items(items) => items,
                _ => Vec::new(),
            }))
    }

    fn item(&self, value: Value) -> ApiResult<Item> {
        if let Value::Object(fields) = &value {
            for key in &self.key_fields {
                let present = match fields.get(key) {
                    Some(Value::String(s)) => !s.is_empty(),
                    Some(Value::Null) | None => false,
                    Some(_) => true,
                };
                if !present {
                    return Err(ApiError::InvalidResponseShape(format!(
                        "item is missing key field `{key}`"
                    )));
                }
            }
        }
        Item::from_value(value)
    }
}

/// Map non-success status codes to the matching `ApiError`.
pub fn check_status(response: &HttpResponse) -> ApiResult<()> {
    match response.status {
        s if (200..300).contains(&s) => Ok(()),
        401 | 403 => Err(ApiError::Auth {
            status: response.status,
        }),
        status => Err(ApiError::Http {
            status,
            body: response.body.clone(),
        }),
    }
}

fn take_object(root: &mut Map<String, Value>, key: &str) -> ApiResult<Map<String, Value>> {
    match root.remove(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(ApiError::InvalidResponseShape(format!(
            "`{key}` must be an object, got {}",
            json_type_name(&other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(body: Value) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    #[test]
    fn parses_full_envelope() {
        let resp = ok(json!({
            "item": {"disp_id": "a", "cost": 1},
            "metadata": {"version": 4},
            "users": {"u1": {"name": "x"}},
            "read_only": true,
        }));
        let env = ResponseValidator::new().parse_item(&resp).unwrap();
        assert_eq!(env.payload.unwrap().disp_id(), "a");
        assert_eq!(env.metadata["version"], 4);
        assert!(env.users.contains_key("u1"));
        assert!(env.read_only);
    }

    #[test]
    fn missing_optional_envelope_fields_default() {
        let env = ResponseValidator::new()
            .parse_items(&ok(json!({"items": []})))
            .unwrap();
        assert!(env.payload.is_empty());
        assert!(env.metadata.is_empty());
        assert!(!env.read_only);
    }

    #[test]
    fn null_item_is_empty_payload() {
        let env = ResponseValidator::new()
            .parse_item(&ok(json!({"item": null})))
            .unwrap();
        assert!(env.payload.is_none());
    }

    #[test]
    fn required_item_must_be_present() {
        let err = ResponseValidator::new()
            .validate(&ok(json!({"metadata": {}})), ExpectedShape::Item)
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponseShape(_)));
    }

    #[test]
    fn item_without_key_is_rejected() {
        let err = ResponseValidator::new()
            .parse_items(&ok(json!({"items": [{"disp_id": "a"}, {"name": "b"}]})))
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponseShape(_)));
    }

    #[test]
    fn extra_key_fields_are_enforced() {
        let validator = ResponseValidator::new().with_key_field("_id");
        let err = validator
            .parse_item(&ok(json!({"item": {"disp_id": "a", "_id": ""}})))
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponseShape(_)));
    }

    #[test]
    fn items_must_be_an_array() {
        let err = ResponseValidator::new()
            .parse_items(&ok(json!({"items": {"disp_id": "a"}})))
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponseShape(_)));
    }

    #[test]
    fn non_json_body_is_rejected() {
        let resp = HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: "<html>".to_string(),
        };
        let err = ResponseValidator::new().parse_item(&resp).unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponseShape(_)));
    }

    #[test]
    fn auth_statuses_are_distinct() {
        for status in [401, 403] {
            let resp = HttpResponse {
                status,
                headers: Vec::new(),
                body: String::new(),
            };
            assert_eq!(check_status(&resp).unwrap_err(), ApiError::Auth { status });
        }
    }

    #[test]
    fn other_statuses_are_http_errors() {
        let resp = HttpResponse {
            status: 500,
            headers: Vec::new(),
            body: "internal error".to_string(),
        };
        let err = check_status(&resp).unwrap_err();
        assert!(matches!(err, ApiError::Http { status: 500, .. }));
    }
}
