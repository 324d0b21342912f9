//! Immutable snapshot of every entity collection for one principal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::collection::Collection;
use crate::id::PrincipalId;

/// Payload as returned by the snapshot collaborator, before normalization.
///
/// Expected to be a JSON object keyed by collection wire name, but any shape
/// is accepted: whatever is missing or malformed normalizes to empty.
pub type RawSnapshot = Value;

/// A consolidated, immutable view of all entity collections.
///
/// Invariant: every [`Collection::ALL`] entry is present. A snapshot is never
/// edited after construction; a sync replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    collections: BTreeMap<Collection, Vec<Value>>,
    principal: Option<PrincipalId>,
    fetched_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// A snapshot with every recognized collection present and empty.
    pub fn empty() -> Self {
        Self {
            collections: Collection::ALL.iter().map(|c| (*c, Vec::new())).collect(),
            principal: None,
            fetched_at: None,
        }
    }

    /// Build a snapshot from a collaborator payload.
    ///
    /// Each recognized collection whose value is not a JSON array becomes an
    /// empty sequence. Unrecognized keys are dropped.
    pub fn normalize(raw: &RawSnapshot) -> Self {
        let Some(object) = raw.as_object() else {
            tracing::warn!("snapshot payload is not an object; every collection coerced to empty");
            return Self::empty();
        };

        let mut collections = BTreeMap::new();
        for collection in Collection::ALL {
            let records = match object.get(collection.as_str()) {
                Some(Value::Array(items)) => items.clone(),
                None | Some(Value::Null) => {
                    tracing::debug!(collection = %collection, "collection missing from payload");
                    Vec::new()
                }
                Some(other) => {
                    tracing::warn!(
                        collection = %collection,
                        kind = json_kind(other),
                        "collection is not a sequence; coerced to empty"
                    );
                    Vec::new()
                }
            };
            collections.insert(*collection, records);
        }

        for key in object.keys() {
            if key.parse::<Collection>().is_err() {
                tracing::debug!(key = %key, "ignoring unrecognized collection");
            }
        }

        Self {
            collections,
            principal: None,
            fetched_at: None,
        }
    }

    /// Stamp the snapshot with who it was fetched for and when.
    pub fn with_origin(mut self, principal: PrincipalId, fetched_at: DateTime<Utc>) -> Self {
        self.principal = Some(principal);
        self.fetched_at = Some(fetched_at);
        self
    }

    pub fn principal(&self) -> Option<PrincipalId> {
        self.principal
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    /// Records of one collection, in backend order.
    pub fn get(&self, collection: Collection) -> &[Value] {
        self.collections
            .get(&collection)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Deserialize one collection into a caller-owned record type.
    pub fn records_as<T: DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> Result<Vec<T>, serde_json::Error> {
        self.get(collection)
            .iter()
            .cloned()
            .map(serde_json::from_value)
            .collect()
    }

    /// Record count per collection.
    pub fn counts(&self) -> BTreeMap<Collection, usize> {
        self.collections.iter().map(|(c, r)| (*c, r.len())).collect()
    }

    pub fn total_records(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_records() == 0
    }

    /// True when both snapshots hold identical records, ignoring origin.
    pub fn same_records(&self, other: &Snapshot) -> bool {
        self.collections == other.collections
    }

    /// Render back into the collaborator payload shape.
    pub fn to_raw(&self) -> RawSnapshot {
        let object: Map<String, Value> = self
            .collections
            .iter()
            .map(|(c, records)| (c.as_str().to_string(), Value::Array(records.clone())))
            .collect();
        Value::Object(object)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
