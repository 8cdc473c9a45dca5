//! Wire protocol layer for sockline.
//!
//! This crate knows nothing about sockets or runtimes. It defines:
//!
//! - [`Message`]: the tagged sum of every frame the protocol can carry
//! - [`MessageCodec`]: a [`tokio_util::codec`] codec that parses and
//!   serializes whole frames over any byte stream
//! - [`Endpoint`]: service designations (TCP host/port or a filesystem
//!   socket path)
//! - [`WireError`]: everything that can go wrong between the socket and a
//!   decoded frame
//!
//! # Wire Format
//!
//! Each frame is a 4-byte big-endian header word followed by a
//! variant-specific body:
//!
//! ```text
//! +---------------------+--------+------------------------+
//! | sync pattern (24 b) | code   | body (variant-shaped)  |
//! +---------------------+--------+------------------------+
//! ```
//!
//! The sync pattern is a fixed constant; a header that does not carry it
//! means the stream is desynchronized and the connection is beyond repair.
//! Strings and byte blobs inside bodies share the layout
//! `u32 length | bytes[length]`, all integers big-endian, no padding.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod message;

pub use codec::{MessageCodec, HEADER_LEN, MAX_FIELD_LEN, SYNC_PATTERN};
pub use endpoint::{Endpoint, InvalidService};
pub use error::WireError;
pub use message::{code, Format, Message};
