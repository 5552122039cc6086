//! Collection element model.

use crate::error::{CollectionError, CollectionResult};
use realtree_core::{DatabaseValue, InternalKeys, Snapshot};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// An element of an ordered remote collection.
///
/// Elements are identified by their key; `Ord` decides their position.
pub trait CollectionElement: Ord + Clone + Send + Sync + 'static {
    /// Key of the element under the collection location.
    fn key(&self) -> &str;

    /// Decodes an element from the snapshot of its location.
    fn decode(snapshot: &Snapshot) -> CollectionResult<Self>;

    /// Value written at the element location.
    fn encode(&self) -> DatabaseValue;
}

/// Prototype of a collection element as stored remotely.
///
/// Stored as a map with the priority under `__i`, an optional link key
/// under `__lnk` and the element value under `__val`, which itself holds
/// a user payload (`__pl`) and a raw value (`__raw`).
///
/// Items compare by priority (missing priority counts as zero), then key.
#[derive(Debug, Clone)]
pub struct CollectionItem {
    key: String,
    priority: Option<i64>,
    link_id: Option<String>,
    payload: Option<DatabaseValue>,
    raw: Option<DatabaseValue>,
}

impl CollectionItem {
    /// Creates an item with no priority or value.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            priority: None,
            link_id: None,
            payload: None,
            raw: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the link key.
    #[must_use]
    pub fn with_link(mut self, link_id: impl Into<String>) -> Self {
        self.link_id = Some(link_id.into());
        self
    }

    /// Sets the user payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<DatabaseValue>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Sets the raw value.
    #[must_use]
    pub fn with_raw(mut self, raw: impl Into<DatabaseValue>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    /// Priority, zero when unset.
    pub fn priority(&self) -> i64 {
        self.priority.unwrap_or(0)
    }

    /// Link key.
    pub fn link_id(&self) -> Option<&str> {
        self.link_id.as_deref()
    }

    /// User payload.
    pub fn payload(&self) -> Option<&DatabaseValue> {
        self.payload.as_ref()
    }

    /// Raw value.
    pub fn raw(&self) -> Option<&DatabaseValue> {
        self.raw.as_ref()
    }

    fn is_prototype(map: &BTreeMap<String, DatabaseValue>) -> bool {
        [InternalKeys::INDEX, InternalKeys::LINK, InternalKeys::VALUE]
            .iter()
            .any(|key| map.contains_key(*key))
    }
}

impl PartialEq for CollectionItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CollectionItem {}

impl PartialOrd for CollectionItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CollectionItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl CollectionElement for CollectionItem {
    fn key(&self) -> &str {
        &self.key
    }

    fn decode(snapshot: &Snapshot) -> CollectionResult<Self> {
        let key = snapshot.key();
        let mut item = CollectionItem::new(key);
        let map = match &snapshot.value {
            None => return Err(CollectionError::decoding(key, "no value stored")),
            Some(DatabaseValue::Map(map)) if Self::is_prototype(map) => map,
            Some(value @ DatabaseValue::Map(_)) => {
                item.payload = Some(value.clone());
                return Ok(item);
            }
            Some(value) => {
                item.raw = Some(value.clone());
                return Ok(item);
            }
        };

        if let Some(priority) = map.get(InternalKeys::INDEX) {
            item.priority = Some(priority.as_i64().ok_or_else(|| {
                CollectionError::decoding(key, "priority is not an integer")
            })?);
        }
        if let Some(link) = map.get(InternalKeys::LINK) {
            let link = link
                .as_text()
                .ok_or_else(|| CollectionError::decoding(key, "link key is not text"))?;
            item.link_id = Some(link.to_string());
        }
        match map.get(InternalKeys::VALUE) {
            Some(DatabaseValue::Map(value)) => {
                item.payload = value.get(InternalKeys::PAYLOAD).cloned();
                item.raw = value.get(InternalKeys::RAW).cloned();
            }
            Some(other) => item.raw = Some(other.clone()),
            None => {}
        }
        Ok(item)
    }

    fn encode(&self) -> DatabaseValue {
        let mut map = BTreeMap::new();
        map.insert(
            InternalKeys::INDEX.to_string(),
            DatabaseValue::Int(self.priority()),
        );
        if let Some(link) = &self.link_id {
            map.insert(InternalKeys::LINK.to_string(), link.clone().into());
        }
        let mut value = BTreeMap::new();
        if let Some(payload) = &self.payload {
            value.insert(InternalKeys::PAYLOAD.to_string(), payload.clone());
        }
        if let Some(raw) = &self.raw {
            value.insert(InternalKeys::RAW.to_string(), raw.clone());
        }
        if !value.is_empty() {
            map.insert(InternalKeys::VALUE.to_string(), DatabaseValue::Map(value));
        }
        DatabaseValue::Map(map)
    }
}
