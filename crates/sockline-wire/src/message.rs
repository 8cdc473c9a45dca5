//! Tagged message variants and their body encodings.
//!
//! One variant per wire code. The header word (sync pattern + code) is
//! handled by [`crate::codec::MessageCodec`]; this module only knows how
//! each body is shaped:
//!
//! | Code | Variant        | Body after code          |
//! |------|----------------|--------------------------|
//! | 1    | `Execute`      | format · blob            |
//! | 2    | `Request`      | format · item            |
//! | 3    | `Poke`         | format · item · blob     |
//! | 4    | `AdviseStart`  | item                     |
//! | 5    | `AdviseRequest`| item                     |
//! | 6    | `Advise`       | format · item · blob     |
//! | 7    | `AdviseStop`   | item                     |
//! | 8    | `RequestReply` | format · item · blob     |
//! | 9    | `Fail`         | reason                   |
//! | 10   | `Connect`      | topic                    |
//! | 11   | `Disconnect`   | (empty)                  |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{put_blob, put_string, take_blob, take_string, Scan};
use crate::error::WireError;

/// Wire codes, one per [`Message`] variant.
///
/// The values are part of the wire format and must not change.
pub mod code {
    pub const EXECUTE: u8 = 1;
    pub const REQUEST: u8 = 2;
    pub const POKE: u8 = 3;
    pub const ADVISE_START: u8 = 4;
    pub const ADVISE_REQUEST: u8 = 5;
    pub const ADVISE: u8 = 6;
    pub const ADVISE_STOP: u8 = 7;
    pub const REQUEST_REPLY: u8 = 8;
    pub const FAIL: u8 = 9;
    pub const CONNECT: u8 = 10;
    pub const DISCONNECT: u8 = 11;
}

/// One-byte tag describing how the blob accompanying a message is to be
/// interpreted.
///
/// Only [`Format::INVALID`] and [`Format::PRIVATE`] are reserved by the
/// protocol; the well-known text values below are carried for
/// interoperability and every other value passes through opaquely.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Format(pub u8);

impl Format {
    /// No format: the zero value, never legitimately transmitted with data.
    pub const INVALID: Format = Format(0);
    /// Locale-encoded text.
    pub const TEXT: Format = Format(1);
    /// OEM codepage text.
    pub const OEM_TEXT: Format = Format(7);
    /// Wide-character text (native wide units on the producing system).
    pub const WIDE_TEXT: Format = Format(13);
    /// UTF-8 text.
    pub const UTF8_TEXT: Format = Format(17);
    /// Application-private payload; bytes are opaque to the protocol.
    pub const PRIVATE: Format = Format(20);

    /// Whether this tag denotes one of the textual encodings.
    #[must_use]
    pub const fn is_text(self) -> bool {
        matches!(
            self,
            Format::TEXT | Format::OEM_TEXT | Format::WIDE_TEXT | Format::UTF8_TEXT
        )
    }
}

impl std::fmt::Debug for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Format::INVALID => f.write_str("Format::INVALID"),
            Format::TEXT => f.write_str("Format::TEXT"),
            Format::OEM_TEXT => f.write_str("Format::OEM_TEXT"),
            Format::WIDE_TEXT => f.write_str("Format::WIDE_TEXT"),
            Format::UTF8_TEXT => f.write_str("Format::UTF8_TEXT"),
            Format::PRIVATE => f.write_str("Format::PRIVATE"),
            Format(other) => write!(f, "Format({other})"),
        }
    }
}

/// A single protocol frame, minus the header word.
///
/// Strings are UTF-8 on the wire with a `u32` length prefix and no
/// trailing NUL; blobs are raw bytes with a `u32` length prefix. Decoded
/// blobs are [`Bytes`] views into the receive buffer, so handing them to
/// application code costs no copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Command for the peer to carry out. Fire-and-forget.
    Execute { format: Format, data: Bytes },
    /// Ask the peer for the value of `item`; answered by `RequestReply`
    /// or `Fail` as the very next frame.
    Request { format: Format, item: String },
    /// Push a value at the peer without expecting an answer.
    Poke {
        format: Format,
        item: String,
        data: Bytes,
    },
    /// Subscribe to updates of `item`; echoed back on acceptance,
    /// answered with `Fail` on refusal.
    AdviseStart { item: String },
    /// Ask for the current value of an advised item. Defined on the wire
    /// but never produced by this implementation.
    AdviseRequest { item: String },
    /// One update for a subscribed item. Fire-and-forget.
    Advise {
        format: Format,
        item: String,
        data: Bytes,
    },
    /// Cancel the subscription on `item`; echoed back on acceptance.
    AdviseStop { item: String },
    /// Answer to a `Request`.
    RequestReply {
        format: Format,
        item: String,
        data: Bytes,
    },
    /// Operation refusal (as a synchronous reply) or, during the
    /// handshake, a rejected connection attempt.
    Fail { reason: String },
    /// Handshake: proposes (client) or confirms (server) the topic.
    Connect { topic: String },
    /// Orderly teardown. Empty body.
    Disconnect,
}

impl Message {
    /// The wire code of this variant.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Message::Execute { .. } => code::EXECUTE,
            Message::Request { .. } => code::REQUEST,
            Message::Poke { .. } => code::POKE,
            Message::AdviseStart { .. } => code::ADVISE_START,
            Message::AdviseRequest { .. } => code::ADVISE_REQUEST,
            Message::Advise { .. } => code::ADVISE,
            Message::AdviseStop { .. } => code::ADVISE_STOP,
            Message::RequestReply { .. } => code::REQUEST_REPLY,
            Message::Fail { .. } => code::FAIL,
            Message::Connect { .. } => code::CONNECT,
            Message::Disconnect => code::DISCONNECT,
        }
    }

    /// Walks the body shape for `code` over a partially-buffered body.
    ///
    /// Returns `Ok(Some(len))` once the whole body is present, `Ok(None)`
    /// when more bytes are needed, and an error for unknown codes or
    /// fields that can never become valid. Field lengths are validated
    /// here, before anything is allocated.
    pub(crate) fn scan_body(code: u8, body: &[u8]) -> Result<Option<usize>, WireError> {
        let mut s = Scan::new(body);
        let complete = match code {
            code::EXECUTE | code::REQUEST => s.fixed(1) && s.length_prefixed()?,
            code::POKE | code::ADVISE | code::REQUEST_REPLY => {
                s.fixed(1) && s.length_prefixed()? && s.length_prefixed()?
            }
            code::ADVISE_START | code::ADVISE_REQUEST | code::ADVISE_STOP | code::FAIL
            | code::CONNECT => s.length_prefixed()?,
            code::DISCONNECT => true,
            other => {
                return Err(WireError::desync(format!(
                    "unknown message code {other:#04x}"
                )))
            }
        };
        Ok(complete.then_some(s.consumed()))
    }

    /// Decodes a body previously validated by [`Message::scan_body`].
    ///
    /// `body` must hold exactly the body bytes; blob fields are split off
    /// without copying.
    pub(crate) fn decode_body(code: u8, body: &mut BytesMut) -> Result<Message, WireError> {
        let msg = match code {
            code::EXECUTE => Message::Execute {
                format: Format(body.get_u8()),
                data: take_blob(body),
            },
            code::REQUEST => Message::Request {
                format: Format(body.get_u8()),
                item: take_string(body)?,
            },
            code::POKE => Message::Poke {
                format: Format(body.get_u8()),
                item: take_string(body)?,
                data: take_blob(body),
            },
            code::ADVISE_START => Message::AdviseStart {
                item: take_string(body)?,
            },
            code::ADVISE_REQUEST => Message::AdviseRequest {
                item: take_string(body)?,
            },
            code::ADVISE => Message::Advise {
                format: Format(body.get_u8()),
                item: take_string(body)?,
                data: take_blob(body),
            },
            code::ADVISE_STOP => Message::AdviseStop {
                item: take_string(body)?,
            },
            code::REQUEST_REPLY => Message::RequestReply {
                format: Format(body.get_u8()),
                item: take_string(body)?,
                data: take_blob(body),
            },
            code::FAIL => Message::Fail {
                reason: take_string(body)?,
            },
            code::CONNECT => Message::Connect {
                topic: take_string(body)?,
            },
            code::DISCONNECT => Message::Disconnect,
            other => {
                return Err(WireError::desync(format!(
                    "unknown message code {other:#04x}"
                )))
            }
        };
        Ok(msg)
    }

    /// Appends the body of this message to `dst`.
    pub(crate) fn encode_body(&self, dst: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Message::Execute { format, data } => {
                dst.put_u8(format.0);
                put_blob(dst, data)?;
            }
            Message::Request { format, item } => {
                dst.put_u8(format.0);
                put_string(dst, item)?;
            }
            Message::Poke { format, item, data }
            | Message::Advise { format, item, data }
            | Message::RequestReply { format, item, data } => {
                dst.put_u8(format.0);
                put_string(dst, item)?;
                put_blob(dst, data)?;
            }
            Message::AdviseStart { item }
            | Message::AdviseRequest { item }
            | Message::AdviseStop { item } => {
                put_string(dst, item)?;
            }
            Message::Fail { reason } => {
                put_string(dst, reason)?;
            }
            Message::Connect { topic } => {
                put_string(dst, topic)?;
            }
            Message::Disconnect => {}
        }
        Ok(())
    }
}
