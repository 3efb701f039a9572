//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written as maps keyed by field name (`to_vec_named`), so
//! peers can add optional fields without breaking older readers.
//!
//! # Example
//!
//! ```
//! use hybrid_transport::codec::MsgPackCodec;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct PlayerMoved {
//!     id: u32,
//!     x: f32,
//!     y: f32,
//! }
//!
//! let msg = PlayerMoved { id: 7, x: 1.5, y: -2.0 };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: PlayerMoved = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for structured payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes, structs as maps.
    ///
    /// # Errors
    ///
    /// Returns `MsgPackEncode` if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns `MsgPackDecode` if the bytes do not deserialize to `T`.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
