//! Pluggable serialization for cached payloads

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::runtime::error::RuntimeError;

/// Wire format for cached values. `Json` is human-readable and debuggable.
/// `Binary` carries the rendered payload as a length-prefixed bincode frame:
/// bincode cannot decode self-describing payloads (`deserialize_any`), so
/// the frame holds pre-rendered JSON bytes and the saving is the cheap
/// framing, not a re-encoding. Both codecs round-trip losslessly for any
/// serializable value; entries must be decoded with the codec that encoded
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Json,
    Binary,
}

impl Codec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, RuntimeError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::Binary => Ok(bincode::serialize(&serde_json::to_vec(value)?)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, RuntimeError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::Binary => {
                let inner: Vec<u8> = bincode::deserialize(bytes)?;
                Ok(serde_json::from_slice(&inner)?)
            }
        }
    }
}
