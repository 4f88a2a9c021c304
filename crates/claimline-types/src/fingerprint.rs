use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from fingerprint computation and parsing.
#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("canonical serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid fingerprint length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex in fingerprint: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// BLAKE3 digest of an item's canonical serialization.
///
/// Serialized as a lowercase hex string so that persisted items and audit
/// logs stay human-readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash raw bytes.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Fingerprint a payload. Object keys are sorted before hashing, so two
    /// payloads that differ only in key order share a fingerprint.
    pub fn of_payload(payload: &Value) -> Result<Self, FingerprintError> {
        let bytes = serde_json::to_vec(&canonicalize(payload))?;
        Ok(Self::hash(&bytes))
    }

    /// Fingerprint any serializable value through its JSON form.
    pub fn of_serializable<T: Serialize>(value: &T) -> Result<Self, FingerprintError> {
        let value = serde_json::to_value(value)?;
        Self::of_payload(&value)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, FingerprintError> {
        if s.len() != 64 {
            return Err(FingerprintError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// First eight bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_hex()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({}...)", self.short())
    }
}

/// Which side of a stage a ledger slot covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// Payload as it entered the stage.
    Input,
    /// Payload as the stage's transformation produced it.
    Output,
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Checkpoint::Input => write!(f, "input"),
            Checkpoint::Output => write!(f, "output"),
        }
    }
}

/// One link of an item's audit trail: the output fingerprint committed
/// when the stage at `stage_index` succeeded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub stage_index: usize,
    pub hash: Fingerprint,
}
