//! Typed field primitives and the whole-frame codec.
//!
//! The codec is used with [`tokio_util::codec::FramedRead`] /
//! [`FramedWrite`](tokio_util::codec::FramedWrite) to provide frame-based
//! I/O over any async byte stream.
//!
//! Unlike a plain length-prefixed framing there is no single byte count up
//! front: the body length follows from the message code and the length
//! prefixes of the individual fields. Decoding therefore walks the body
//! shape incrementally and consumes nothing until a whole frame is
//! buffered, so exactly `4 + body_len` bytes are taken per frame and the
//! bytes of the next frame are never touched.
//!
//! On the write side one `encode` call lays down one whole frame; sending
//! a message through `FramedWrite` composes the header and every field
//! into a single buffer and flushes it as one wire segment, which keeps
//! the small fields of a logical message coalesced into one transmit.
//!
//! # Invariants
//!
//! - Frames are serialized and parsed whole; there is no partial progress
//!   observable to callers.
//! - A header whose high 24 bits are not [`SYNC_PATTERN`] fails before
//!   any body byte is interpreted.
//! - Field lengths are validated against [`MAX_FIELD_LEN`] before
//!   allocation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::message::Message;

/// Length of the frame header word.
pub const HEADER_LEN: usize = 4;

/// The 24-bit constant carried in the high bits of every frame header.
///
/// Chosen to be distinct from runs of ASCII or zeros so that reading a
/// misaligned stream fails immediately. The value is shared by every
/// implementation of the protocol.
pub const SYNC_PATTERN: u32 = 0x0043_9d96;

/// Upper bound on any single length-prefixed field (16 MiB).
///
/// A length prefix above this is treated as corruption rather than an
/// allocation request.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Write-buffer reservation per frame, sized near one Ethernet MTU minus
/// TCP overhead so a typical logical message fits one segment.
const WRITE_RESERVE_HINT: usize = 1448;

/// Appends a `u32`-length-prefixed UTF-8 string.
pub(crate) fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), WireError> {
    let bytes = s.as_bytes();
    if bytes.len() > MAX_FIELD_LEN {
        return Err(WireError::FieldTooLarge {
            len: bytes.len(),
            max: MAX_FIELD_LEN,
        });
    }
    #[allow(clippy::cast_possible_truncation)] // bounded above
    dst.put_u32(bytes.len() as u32);
    dst.put_slice(bytes);
    Ok(())
}

/// Appends a `u32`-length-prefixed byte blob.
pub(crate) fn put_blob(dst: &mut BytesMut, data: &[u8]) -> Result<(), WireError> {
    if data.len() > MAX_FIELD_LEN {
        return Err(WireError::FieldTooLarge {
            len: data.len(),
            max: MAX_FIELD_LEN,
        });
    }
    #[allow(clippy::cast_possible_truncation)] // bounded above
    dst.put_u32(data.len() as u32);
    dst.put_slice(data);
    Ok(())
}

/// Splits a length-prefixed UTF-8 string off a validated body.
pub(crate) fn take_string(body: &mut BytesMut) -> Result<String, WireError> {
    let len = body.get_u32() as usize;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| WireError::desync("string field is not valid UTF-8"))
}

/// Splits a length-prefixed blob off a validated body without copying.
pub(crate) fn take_blob(body: &mut BytesMut) -> Bytes {
    let len = body.get_u32() as usize;
    body.split_to(len).freeze()
}

/// Incremental walker over a partially-buffered frame body.
///
/// Advances through fixed-width and length-prefixed fields, reporting
/// whether each was fully present, and tracks how many bytes the complete
/// body will occupy.
pub(crate) struct Scan<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scan<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes walked so far.
    pub(crate) fn consumed(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Skips a fixed-width field; `false` when not yet buffered.
    pub(crate) fn fixed(&mut self, n: usize) -> bool {
        if self.remaining() < n {
            return false;
        }
        self.pos += n;
        true
    }

    /// Skips a `u32`-length-prefixed field, validating the announced
    /// length; `Ok(false)` when not yet buffered.
    pub(crate) fn length_prefixed(&mut self) -> Result<bool, WireError> {
        if self.remaining() < 4 {
            return Ok(false);
        }
        let len = u32::from_be_bytes(
            self.buf[self.pos..self.pos + 4]
                .try_into()
                .expect("4-byte slice"),
        ) as usize;
        if len > MAX_FIELD_LEN {
            return Err(WireError::FieldTooLarge {
                len,
                max: MAX_FIELD_LEN,
            });
        }
        if self.remaining() < 4 + len {
            return Ok(false);
        }
        self.pos += 4 + len;
        Ok(true)
    }
}

/// Frame codec: one [`Message`] per frame, header word included.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // The sync pattern and code are checked before any body byte is
        // interpreted; a mismatch is a hard desync, not a retryable state.
        let header = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if header >> 8 != SYNC_PATTERN {
            return Err(WireError::desync(format!(
                "header word {header:#010x} does not carry the sync pattern"
            )));
        }
        let code = (header & 0xFF) as u8;

        let Some(body_len) = Message::scan_body(code, &src[HEADER_LEN..])? else {
            return Ok(None);
        };

        src.advance(HEADER_LEN);
        let mut body = src.split_to(body_len);
        let msg = Message::decode_body(code, &mut body)?;
        debug_assert!(body.is_empty(), "body fully consumed");
        Ok(Some(msg))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), WireError> {
        dst.reserve(WRITE_RESERVE_HINT);
        dst.put_u32((SYNC_PATTERN << 8) | u32::from(msg.code()));
        msg.encode_body(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{code, Format};

    fn encode(msg: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec::new()
            .encode(msg.clone(), &mut buf)
            .expect("encode");
        buf
    }

    fn decode_one(buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
        MessageCodec::new().decode(buf)
    }

    fn sample_messages(len: usize) -> Vec<Message> {
        let item: String = "i".repeat(len);
        let data = Bytes::from(vec![0xA5u8; len]);
        vec![
            Message::Execute {
                format: Format::TEXT,
                data: data.clone(),
            },
            Message::Request {
                format: Format::PRIVATE,
                item: item.clone(),
            },
            Message::Poke {
                format: Format::UTF8_TEXT,
                item: item.clone(),
                data: data.clone(),
            },
            Message::AdviseStart { item: item.clone() },
            Message::AdviseRequest { item: item.clone() },
            Message::Advise {
                format: Format::PRIVATE,
                item: item.clone(),
                data: data.clone(),
            },
            Message::AdviseStop { item: item.clone() },
            Message::RequestReply {
                format: Format::TEXT,
                item: item.clone(),
                data,
            },
            Message::Fail { reason: item },
            Message::Connect {
                topic: "IPC TEST".to_owned(),
            },
            Message::Disconnect,
        ]
    }

    #[test]
    fn roundtrip_all_variants_across_field_lengths() {
        for len in [0usize, 1, 1 << 8, 1 << 16, (1 << 16) + 1] {
            for msg in sample_messages(len) {
                let mut buf = encode(&msg);
                let decoded = decode_one(&mut buf)
                    .expect("decode")
                    .expect("complete frame");
                assert_eq!(decoded, msg, "field length {len}");
                assert!(buf.is_empty(), "no bytes left over for length {len}");
            }
        }
    }

    #[test]
    fn header_guard_rejects_any_other_sync_pattern() {
        // Flip each bit of the 24-bit pattern in turn; every variant must
        // fail before a body is parsed.
        for bit in 0..24 {
            let bad = SYNC_PATTERN ^ (1 << bit);
            let mut buf = BytesMut::new();
            buf.put_u32((bad << 8) | u32::from(code::DISCONNECT));
            let err = decode_one(&mut buf).expect_err("desync expected");
            assert!(matches!(err, WireError::Desync { .. }), "bit {bit}: {err}");
        }
    }

    #[test]
    fn unknown_code_is_a_desync() {
        for bad_code in [0u8, 12, 0x7F, 0xFF] {
            let mut buf = BytesMut::new();
            buf.put_u32((SYNC_PATTERN << 8) | u32::from(bad_code));
            let err = decode_one(&mut buf).expect_err("unknown code");
            assert!(matches!(err, WireError::Desync { .. }), "code {bad_code}");
        }
    }

    #[test]
    fn partial_frames_consume_nothing() {
        let msg = Message::Poke {
            format: Format::PRIVATE,
            item: "counter".to_owned(),
            data: Bytes::from_static(b"0123456789"),
        };
        let full = encode(&msg);

        // Feed the frame one byte at a time; the decoder must not consume
        // anything until the last byte arrives.
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let before = buf.len();
            let out = decode_one(&mut buf).expect("no error on partial input");
            if i + 1 < full.len() {
                assert!(out.is_none(), "frame complete too early at byte {i}");
                assert_eq!(buf.len(), before, "partial decode consumed bytes");
            } else {
                assert_eq!(out, Some(msg.clone()));
                assert!(buf.is_empty());
            }
        }
    }

    #[test]
    fn back_to_back_frames_are_split_exactly() {
        let first = Message::Execute {
            format: Format::TEXT,
            data: Bytes::from_static(b"Date\0"),
        };
        let second = Message::Disconnect;

        let mut buf = encode(&first);
        buf.extend_from_slice(&encode(&second));

        assert_eq!(decode_one(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_one(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_field_rejected_before_allocation() {
        let mut buf = BytesMut::new();
        buf.put_u32((SYNC_PATTERN << 8) | u32::from(code::CONNECT));
        buf.put_u32(u32::MAX); // absurd string length, no bytes behind it
        let err = decode_one(&mut buf).expect_err("oversized field");
        assert!(matches!(
            err,
            WireError::FieldTooLarge { len, .. } if len == u32::MAX as usize
        ));
    }

    #[test]
    fn oversized_field_rejected_on_encode() {
        let mut buf = BytesMut::new();
        let msg = Message::Execute {
            format: Format::PRIVATE,
            data: Bytes::from(vec![0u8; MAX_FIELD_LEN + 1]),
        };
        let err = MessageCodec::new()
            .encode(msg, &mut buf)
            .expect_err("oversized blob");
        assert!(matches!(err, WireError::FieldTooLarge { .. }));
    }

    #[test]
    fn invalid_utf8_in_string_field_is_a_desync() {
        let mut buf = BytesMut::new();
        buf.put_u32((SYNC_PATTERN << 8) | u32::from(code::CONNECT));
        buf.put_u32(2);
        buf.put_slice(&[0xC3, 0x28]); // malformed UTF-8 sequence
        let err = decode_one(&mut buf).expect_err("invalid utf-8");
        assert!(matches!(err, WireError::Desync { .. }));
    }

    #[test]
    fn empty_strings_and_blobs_are_valid() {
        let msg = Message::RequestReply {
            format: Format::INVALID,
            item: String::new(),
            data: Bytes::new(),
        };
        let mut buf = encode(&msg);
        // header + format + two empty length prefixes
        assert_eq!(buf.len(), HEADER_LEN + 1 + 4 + 4);
        assert_eq!(decode_one(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let buf = encode(&Message::Disconnect);
        assert_eq!(&buf[..], &[0x43, 0x9d, 0x96, code::DISCONNECT]);
    }
}
