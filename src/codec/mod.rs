//! Codec module - value serialization for byte-stream transports.
//!
//! In-process channels carry envelopes as structured values and never touch
//! a codec. Channels that cross a process boundary encode each value with
//! [`MsgPackCodec`] before framing it.
//!
//! # Example
//!
//! ```
//! use event_invoke::codec::MsgPackCodec;
//! use serde_json::{json, Value};
//!
//! let encoded = MsgPackCodec::encode(&json!({"seq": 0, "name": "max"})).unwrap();
//! let decoded: Value = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, json!({"seq": 0, "name": "max"}));
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
