//! # relay-protocol
//!
//! Wire formats for the stream relay.
//!
//! - **Upstream** - newline-delimited JSON records from the streaming search API
//! - **Downstream** - items pushed to clients as JSON text or MessagePack binary
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use relay_protocol::{codec, Encoding};
//!
//! let mut buf = BytesMut::from(&b"{\"text\":\"hello\"}\r\n"[..]);
//! let record = codec::decode_from(&mut buf).unwrap().unwrap();
//!
//! let encoded = Encoding::Json.encode(&record).unwrap();
//! assert_eq!(encoded.len(), 16);
//! ```

pub mod codec;
pub mod encoding;

pub use codec::{decode_from, decode_line, ProtocolError};
pub use encoding::{Encoded, Encoding};
