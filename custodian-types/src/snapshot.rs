//! Opaque device state reports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A serializable snapshot produced by the state collector.
///
/// The engine never inspects the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot(Value);

impl StateSnapshot {
    /// Wraps an arbitrary JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Serializes any value into a snapshot.
    pub fn from_serializable<T: Serialize>(value: &T) -> crate::Result<Self> {
        Ok(Self(serde_json::to_value(value)?))
    }

    /// An empty object.
    pub fn empty() -> Self {
        Self(Value::Object(Default::default()))
    }

    /// Borrows the JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consumes the snapshot.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}
