//! Serializer contract for event payloads, headers and snapshot payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AnnalError, Result};

/// Byte-level serialization used by persistence adapters.
///
/// Round-trip fidelity (`deserialize(serialize(x)) == x`) is a tested
/// property; adapters may pick any format that honors it.
pub trait Serializer: Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON serializer, the shipped default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| AnnalError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| AnnalError::Serialization(e.to_string()))
    }
}
