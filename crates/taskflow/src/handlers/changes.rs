use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Set on a node while a copy into it is still running.
pub const COPYING_FLAG: &str = "copying";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Channel,
    ContentNode,
}

/// A partial update to one resource, in the shape the live-update layer
/// consumes: `{"table": ..., "key": ..., "mods": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "table")]
    pub resource_kind: ResourceKind,
    #[serde(rename = "key")]
    pub resource_id: String,
    #[serde(rename = "mods")]
    pub field_updates: Map<String, Value>,
}

impl ChangeEvent {
    pub fn update(
        resource_kind: ResourceKind,
        resource_id: impl Into<String>,
        field_updates: Value,
    ) -> Self {
        Self {
            resource_kind,
            resource_id: resource_id.into(),
            field_updates: match field_updates {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }
}
