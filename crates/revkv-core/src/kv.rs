// ABOUTME: Defines KeyValue and Event, the units of state and change in the revision log.
// ABOUTME: An Event is one logged row: a create, update, or delete of a single key.

use serde::{Deserialize, Serialize};

/// The state of a single key at a single revision.
///
/// `mod_revision` is the log's logical clock: a global, strictly
/// increasing integer assigned by the dialect at insert time, shared
/// by all keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub create_revision: i64,
    pub mod_revision: i64,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    /// TTL in seconds; 0 means the key never expires.
    pub lease: i64,
}

/// One change in the log: the key's state after the change plus, for
/// updates and deletes, its state before it.
///
/// `prev_kv.mod_revision` doubles as the supersession link the
/// compactor follows and the poll loop's gap detector relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub create: bool,
    pub delete: bool,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    /// Revision of the row this event superseded, or 0 for a fresh key.
    pub fn prev_revision(&self) -> i64 {
        self.prev_kv.as_ref().map(|kv| kv.mod_revision).unwrap_or(0)
    }
}

// Values are arbitrary bytes; render them as base64 in JSON so the CLI
// can print events without mangling binary payloads.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(D::Error::custom)
    }
}
