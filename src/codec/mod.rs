//! Payload codecs.
//!
//! The transport itself moves opaque byte payloads. [`MsgPackCodec`] is the
//! structured encoding used by `send_encoded` on both facades; receivers
//! decode with [`MsgPackCodec::decode`].
//!
//! # Example
//!
//! ```
//! use hybrid_transport::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
