//! Item writes.
//!
//! # Design
//! `SetItem` replaces the whole stored object: any field missing from the
//! written item is deleted server-side. `update` therefore always starts from
//! a fresh, uncached read, lets the caller edit a draft of it, and refuses to
//! send a candidate that lost a field the caller did not explicitly remove.
//! That check runs locally, before any write is sent.
//!
//! Writes are never retried. After a successful write the item and every
//! cached page are invalidated.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::client::ItemClient;
use crate::envelope::Request;
use crate::error::{ApiError, ApiResult};
use crate::types::{AssetStatus, Item, DISP_ID, INTERNAL_ID};

/// Editable copy of an item.
///
/// Fields removed with [`ItemDraft::remove`] are recorded as intentional.
/// Anything else that disappears from the draft, e.g. through
/// [`ItemDraft::fields_mut`], is treated as accidental and fails the write.
#[derive(Debug, Clone)]
pub struct ItemDraft {
    fields: Map<String, Value>,
    removed: BTreeSet<String>,
}

impl ItemDraft {
    pub fn new(item: Item) -> Self {
        Self {
            fields: item.into_fields(),
            removed: BTreeSet::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.removed.remove(field);
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Remove a field on purpose. The write will delete it server-side.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.removed.insert(field.to_string());
        self.fields.remove(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Raw access to the fields. Removals made here are not recorded.
    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    /// Check the draft against `original` and turn it into a full object.
    pub fn finish(self, original: &Item) -> ApiResult<Item> {
        check_complete(original, &self.fields, &self.removed)?;
        let candidate = Item::from_fields(self.fields)
            .map_err(|e| ApiError::InvalidRequest(format!("candidate item: {e}")))?;
        if candidate.disp_id() != original.disp_id() {
            return Err(ApiError::InvalidRequest(format!(
                "`{DISP_ID}` cannot change in an update ({} -> {})",
                original.disp_id(),
                candidate.disp_id()
            )));
        }
        Ok(candidate)
    }
}

/// Fail with `IncompleteObject` if `candidate` lacks a field of `original`
/// that is not listed in `removed`. Key fields may never be removed.
pub fn check_complete(
    original: &Item,
    candidate: &Map<String, Value>,
    removed: &BTreeSet<String>,
) -> ApiResult<()> {
    let missing: Vec<String> = original
        .fields()
        .keys()
        .filter(|key| !candidate.contains_key(key.as_str()))
        .filter(|key| {
            let is_key_field = key.as_str() == DISP_ID || key.as_str() == INTERNAL_ID;
            is_key_field || !removed.contains(key.as_str())
        })
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ApiError::IncompleteObject { missing })
    }
}

/// Performs writes through an `ItemClient`.
#[derive(Debug, Clone)]
pub struct MutationCoordinator<'a> {
    client: &'a ItemClient,
    make_item_files: bool,
}

impl<'a> MutationCoordinator<'a> {
    pub(crate) fn new(client: &'a ItemClient, make_item_files: bool) -> Self {
        Self {
            client,
            make_item_files,
        }
    }

    pub fn make_item_files(mut self, enabled: bool) -> Self {
        self.make_item_files = enabled;
        self
    }

    /// Read-modify-write of one item.
    ///
    /// Reads the current item bypassing the cache, applies `edit` to a draft,
    /// checks the draft kept every field, and writes it as a full replace.
    /// Returns the server's echo, or the written candidate if there was none.
    pub async fn update<F>(&self, disp_id: &str, edit: F) -> ApiResult<Item>
    where
        F: FnOnce(&mut ItemDraft),
    {
        let original = self.client.fetch_item(disp_id).await?;
        let mut draft = ItemDraft::new(original.clone());
        edit(&mut draft);
        let candidate = match draft.finish(&original) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(disp_id, error = %err, "update rejected before write");
                return Err(err);
            }
        };
        if candidate == original {
            debug!(disp_id, "update is a no-op, writing anyway");
        }
        self.write_item(candidate).await
    }

    /// Write `item` as a full replace without reading first.
    ///
    /// The caller is responsible for `item` being complete.
    pub async fn write_item(&self, item: Item) -> ApiResult<Item> {
        let request = Request::SetItem {
            item: item.clone(),
            make_item_files: self.make_item_files,
        };
        let ack = self.client.write(&request).await?;
        Ok(ack.payload.unwrap_or(item))
    }

    /// Change the asset status of the item with internal id `item_id`.
    ///
    /// A single-field server-side mutation, so no read-modify-write.
    pub async fn set_asset_status(&self, item_id: &str, status: AssetStatus) -> ApiResult<Option<Item>> {
        let request = Request::SetAssetStatus {
            item_id: item_id.to_string(),
            status,
        };
        Ok(self.client.write(&request).await?.payload)
    }
}
