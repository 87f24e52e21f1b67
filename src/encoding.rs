//! Binary encoding of typed keys and values.
//!
//! [`LogDb`](crate::LogDb) is byte-in/byte-out: it stores opaque byte strings
//! and knows nothing about their structure. Callers that want to store typed
//! data encode it with Bincode via the helpers here, typically through the
//! [`Value`] trait:
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Account { balance: u64 }
//! impl encoding::Value for Account {}
//!
//! db.write(b"alice", account.encode(), true)?;
//! let account = Account::decode(&db.read(b"alice")?.unwrap())?;
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Serializes a value using Bincode. Values must always be serializable, so
/// this does not return a Result.
pub fn serialize<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("value must be serializable")
}

/// Deserializes a value using Bincode.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Adds automatic Bincode encoding and decoding to types stored in a
/// [`LogDb`](crate::LogDb).
pub trait Value: Serialize + DeserializeOwned {
    /// Encodes the value to a byte vector.
    fn encode(&self) -> Vec<u8> {
        serialize(self)
    }

    /// Decodes a value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        deserialize(bytes)
    }
}
