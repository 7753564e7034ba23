// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The persisted lock row and its bidirectional mapping to the store's wire
//! representation.

use std::time::Duration;

use serde_json::{Map, Value};

/// Default name of the primary-key attribute (spec §4.4 `partitionKeyName`).
pub const DEFAULT_PARTITION_KEY_NAME: &str = "key";
const FIELD_OWNER_NAME: &str = "ownerName";
const FIELD_RVN: &str = "recordVersionNumber";
const FIELD_LEASE_DURATION_MS: &str = "leaseDurationMs";
const FIELD_DATA: &str = "data";
const FIELD_IS_RELEASED: &str = "isReleased";

/// One row of the lock table, as described in spec §3.1.
///
/// `extra` carries any attribute this client doesn't recognize, so that a
/// peer running a newer version of the protocol doesn't lose data when this
/// client rewrites the row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockItem {
    /// Lock name; the table's primary key.
    pub key: String,
    /// Identity of the current holder.
    pub owner_name: String,
    /// Opaque token identifying the current state of the record.
    pub record_version_number: String,
    /// Wall-clock lifetime after which another client may steal the lock.
    pub lease_duration: Duration,
    /// User payload; never interpreted by this crate.
    pub data: Vec<u8>,
    /// `true` marks a voluntarily released tombstone.
    pub is_released: bool,
    /// Fields present on the wire that this version of the codec does not
    /// recognize; round-tripped untouched.
    pub extra: Map<String, Value>,
}

/// Error decoding a [`LockItem`] from its wire representation.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A required field was missing.
    #[error("missing required field `{0}`")]
    MissingField(String),
    /// A field was present but of the wrong JSON type.
    #[error("field `{0}` had an unexpected type")]
    WrongType(String),
}

impl LockItem {
    /// Builds a fresh item for a new acquisition.
    pub fn new(
        key: impl Into<String>,
        owner_name: impl Into<String>,
        record_version_number: impl Into<String>,
        lease_duration: Duration,
        data: Vec<u8>,
    ) -> Self {
        Self {
            key: key.into(),
            owner_name: owner_name.into(),
            record_version_number: record_version_number.into(),
            lease_duration,
            data,
            is_released: false,
            extra: Map::new(),
        }
    }

    /// Encodes this item into the store's document representation.
    ///
    /// `key_attribute` is the primary-key attribute name configured on the
    /// owning client (spec §4.4 `partitionKeyName`).
    #[must_use]
    pub fn encode(&self, key_attribute: &str) -> Map<String, Value> {
        let mut map = self.extra.clone();
        map.insert(key_attribute.to_string(), Value::String(self.key.clone()));
        map.insert(
            FIELD_OWNER_NAME.to_string(),
            Value::String(self.owner_name.clone()),
        );
        map.insert(
            FIELD_RVN.to_string(),
            Value::String(self.record_version_number.clone()),
        );
        map.insert(
            FIELD_LEASE_DURATION_MS.to_string(),
            Value::from(u64::try_from(self.lease_duration.as_millis()).unwrap_or(u64::MAX)),
        );
        map.insert(
            FIELD_DATA.to_string(),
            Value::String(data_encoding::BASE64.encode(&self.data)),
        );
        map.insert(FIELD_IS_RELEASED.to_string(), Value::Bool(self.is_released));
        map
    }

    /// Decodes an item from the store's document representation.
    ///
    /// `key_attribute` must match whatever name [`LockItem::encode`] was
    /// called with when the row was written.
    ///
    /// # Errors
    /// Returns [`CodecError`] if a required field is missing or malformed.
    pub fn decode(mut map: Map<String, Value>, key_attribute: &str) -> Result<Self, CodecError> {
        let key = take_string(&mut map, key_attribute)?;
        let owner_name = take_string(&mut map, FIELD_OWNER_NAME)?;
        let record_version_number = take_string(&mut map, FIELD_RVN)?;
        let lease_duration_ms = map
            .remove(FIELD_LEASE_DURATION_MS)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CodecError::WrongType(FIELD_LEASE_DURATION_MS.to_string()))?;
        let data_b64 = take_string(&mut map, FIELD_DATA)?;
        let data = data_encoding::BASE64
            .decode(data_b64.as_bytes())
            .map_err(|_| CodecError::WrongType(FIELD_DATA.to_string()))?;
        let is_released = map
            .remove(FIELD_IS_RELEASED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(Self {
            key,
            owner_name,
            record_version_number,
            lease_duration: Duration::from_millis(lease_duration_ms),
            data,
            is_released,
            extra: map,
        })
    }
}

fn take_string(map: &mut Map<String, Value>, field: &str) -> Result<String, CodecError> {
    match map.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(CodecError::WrongType(field.to_string())),
        None => Err(CodecError::MissingField(field.to_string())),
    }
}
