//! Records that flow out of the index.

use serde::ser::Error as _;
use serde::{Serialize, Serializer};

/// A document as stored in the index: its row id and original JSON text.
///
/// Serializing re-parses the stored text, so a corrupt row fails here,
/// while the response is streaming, rather than when it is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: i64,
    pub body: String,
}

impl Serialize for StoredDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value: serde_json::Value = serde_json::from_str(&self.body)
            .map_err(|e| S::Error::custom(format!("document {}: {}", self.id, e)))?;
        value.serialize(serializer)
    }
}
