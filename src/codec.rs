//! Incremental MessagePack framing.
//!
//! MessagePack values are self-delimiting, so a frame is simply one complete top-level value.
//! [`MessageDecoder`] pulls complete values off the front of a growing buffer and leaves any
//! incomplete trailing bytes in place for the next read.
//!
//! The decoder walks value headers as bytes arrive and remembers how far it got, so each byte of
//! an incomplete value is examined once. The full `rmpv` parse runs only when the walk reports a
//! complete value.
use std::io;

use bytes::{Buf, BytesMut};
use rmp::Marker;
use rmpv::Value;
use tokio_util::codec::Decoder;

use crate::{
    error::{ProtocolError, Result, RpcError},
    message::Message,
};

/// Position of the header walk through the value at the front of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scan {
    /// Bytes of the value that are known to be complete.
    offset: usize,
    /// Items still to be walked, including nested array and map entries.
    remaining: u64,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            offset: 0,
            remaining: 1,
        }
    }
}

/// Outcome of walking the buffered bytes.
enum Step {
    /// The value at the front of the buffer ends at this offset.
    Complete(usize),
    /// At least this many bytes must be buffered before the walk can progress.
    Incomplete(u64),
}

/// How the bytes after a marker are laid out.
enum Layout {
    /// A fixed number of bytes follows the marker.
    Fixed(u64),
    /// A big-endian length of `width` bytes, then that many bytes plus `extra`.
    Sized { width: usize, extra: u64 },
    /// A fixed number of nested items follows the marker.
    Items(u64),
    /// A big-endian count of `width` bytes, then `per` nested items per count.
    Counted { width: usize, per: u64 },
}

fn layout(marker: Marker) -> Result<Layout> {
    Ok(match marker {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            Layout::Fixed(0)
        }
        Marker::U8 | Marker::I8 => Layout::Fixed(1),
        Marker::U16 | Marker::I16 => Layout::Fixed(2),
        Marker::U32 | Marker::I32 | Marker::F32 => Layout::Fixed(4),
        Marker::U64 | Marker::I64 | Marker::F64 => Layout::Fixed(8),
        Marker::FixStr(len) => Layout::Fixed(u64::from(len)),
        // Ext payloads carry a type byte ahead of the data.
        Marker::FixExt1 => Layout::Fixed(2),
        Marker::FixExt2 => Layout::Fixed(3),
        Marker::FixExt4 => Layout::Fixed(5),
        Marker::FixExt8 => Layout::Fixed(9),
        Marker::FixExt16 => Layout::Fixed(17),
        Marker::Str8 | Marker::Bin8 => Layout::Sized { width: 1, extra: 0 },
        Marker::Str16 | Marker::Bin16 => Layout::Sized { width: 2, extra: 0 },
        Marker::Str32 | Marker::Bin32 => Layout::Sized { width: 4, extra: 0 },
        Marker::Ext8 => Layout::Sized { width: 1, extra: 1 },
        Marker::Ext16 => Layout::Sized { width: 2, extra: 1 },
        Marker::Ext32 => Layout::Sized { width: 4, extra: 1 },
        Marker::FixArray(len) => Layout::Items(u64::from(len)),
        Marker::FixMap(len) => Layout::Items(2 * u64::from(len)),
        Marker::Array16 => Layout::Counted { width: 2, per: 1 },
        Marker::Array32 => Layout::Counted { width: 4, per: 1 },
        Marker::Map16 => Layout::Counted { width: 2, per: 2 },
        Marker::Map32 => Layout::Counted { width: 4, per: 2 },
        Marker::Reserved => {
            return Err(RpcError::Deserialization(
                rmpv::decode::Error::InvalidMarkerRead(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "reserved marker 0xc1",
                )),
            ))
        }
    })
}

/// Reads a big-endian length of `width` bytes at `at`, if it has arrived.
fn read_length(src: &[u8], at: usize, width: usize) -> Option<u64> {
    let bytes = src.get(at..at.checked_add(width)?)?;
    Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Decodes complete top-level MessagePack values from a byte buffer.
#[derive(Debug, Clone)]
pub struct MessageDecoder {
    /// Upper bound on bytes held for a single value that is still incomplete.
    max_buffered_bytes: usize,
    scan: Scan,
    #[cfg(test)]
    parses: usize,
}

impl MessageDecoder {
    pub fn new(max_buffered_bytes: usize) -> Self {
        Self {
            max_buffered_bytes,
            scan: Scan::default(),
            #[cfg(test)]
            parses: 0,
        }
    }

    /// Walks value headers in `src`, resuming where the previous call stopped.
    fn walk(&mut self, src: &[u8]) -> Result<Step> {
        while self.scan.remaining > 0 {
            let at = self.scan.offset;
            let Some(&byte) = src.get(at) else {
                return Ok(Step::Incomplete(at as u64 + 1));
            };
            let (header, payload, items) = match layout(Marker::from_u8(byte))? {
                Layout::Fixed(payload) => (0, payload, 0),
                Layout::Items(items) => (0, 0, items),
                Layout::Sized { width, extra } => match read_length(src, at + 1, width) {
                    Some(len) => (width, len + extra, 0),
                    None => return Ok(Step::Incomplete((at + 1 + width) as u64)),
                },
                Layout::Counted { width, per } => match read_length(src, at + 1, width) {
                    Some(count) => (width, 0, count * per),
                    None => return Ok(Step::Incomplete((at + 1 + width) as u64)),
                },
            };
            let end = (at + 1 + header) as u64 + payload;
            if end > src.len() as u64 {
                return Ok(Step::Incomplete(end));
            }
            // `end` fits in the buffer, so it fits in usize.
            self.scan.offset = end as usize;
            self.scan.remaining = (self.scan.remaining - 1).saturating_add(items);
        }
        Ok(Step::Complete(self.scan.offset))
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_BUFFERED_BYTES)
    }
}

impl Decoder for MessageDecoder {
    type Item = Value;
    type Error = RpcError;

    /// Decodes one value from the front of `src`.
    ///
    /// Returns `Ok(None)` while `src` holds only a prefix of a value. Fails if the bytes are not
    /// valid MessagePack or the value needs more than `max_buffered_bytes`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>> {
        match self.walk(&src[..])? {
            Step::Incomplete(needed) if needed > self.max_buffered_bytes as u64 => {
                Err(RpcError::Protocol(ProtocolError::FrameTooLarge {
                    size: usize::try_from(needed).unwrap_or(usize::MAX),
                    limit: self.max_buffered_bytes,
                }))
            }
            Step::Incomplete(_) => Ok(None),
            Step::Complete(end) => {
                self.scan = Scan::default();
                #[cfg(test)]
                {
                    self.parses += 1;
                }
                let value = rmpv::decode::read_value(&mut &src[..end])?;
                src.advance(end);
                Ok(Some(value))
            }
        }
    }
}

/// Encodes a message into a standalone frame.
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    rmpv::encode::write_value(&mut buffer, &message.to_value())?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Notification, Request};

    fn notification(method: &str, params: Vec<Value>) -> Vec<u8> {
        encode_message(&Message::Notification(Notification {
            method: method.into(),
            params,
        }))
        .unwrap()
    }

    fn drain(decoder: &mut MessageDecoder, buf: &mut BytesMut) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(value) = decoder.decode(buf).unwrap() {
            out.push(value);
        }
        out
    }

    fn sample_stream() -> Vec<u8> {
        let mut wire = notification(
            "first-msg",
            vec![Value::from(321), Value::Binary(vec![7; 321])],
        );
        wire.extend(notification(
            "second-msg",
            vec![Value::Binary(vec![3; 123]), Value::F32(0.123)],
        ));
        wire.extend(
            encode_message(&Message::Request(Request {
                id: 5,
                method: "req".into(),
                params: vec![Value::Map(vec![(Value::from("k"), Value::Nil)])],
            }))
            .unwrap(),
        );
        // One of each header shape: ext, fixext, str8, array16, map16, wide ints.
        wire.extend(notification(
            "shapes",
            vec![
                Value::Ext(5, vec![1; 20]),
                Value::Ext(-2, vec![9; 4]),
                Value::from("s".repeat(40)),
                Value::Array((0..20).map(Value::from).collect()),
                Value::Map(
                    (0..17)
                        .map(|i| (Value::from(i), Value::Boolean(i % 2 == 0)))
                        .collect(),
                ),
                Value::from(-70_000i64),
                Value::from(u64::MAX),
                Value::F64(2.5),
            ],
        ));
        wire
    }

    #[test]
    fn test_decodes_concatenated_values_in_order() {
        let wire = sample_stream();
        let mut buf = BytesMut::from(&wire[..]);
        let mut decoder = MessageDecoder::default();
        let values = drain(&mut decoder, &mut buf);
        assert_eq!(values.len(), 4);
        assert!(buf.is_empty());
        assert_eq!(
            Message::from_value(values[0].clone()).unwrap().method(),
            Some("first-msg")
        );
        assert_eq!(
            Message::from_value(values[2].clone()).unwrap().method(),
            Some("req")
        );
    }

    #[test]
    fn test_split_at_every_offset_matches_contiguous() {
        let wire = sample_stream();
        let expected = drain(
            &mut MessageDecoder::default(),
            &mut BytesMut::from(&wire[..]),
        );

        for split in 0..=wire.len() {
            let mut decoder = MessageDecoder::default();
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&wire[..split]);
            let mut values = drain(&mut decoder, &mut buf);
            buf.extend_from_slice(&wire[split..]);
            values.extend(drain(&mut decoder, &mut buf));
            assert_eq!(values, expected, "split at {}", split);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_incomplete_value_leaves_buffer_untouched() {
        let wire = notification("partial", vec![Value::Binary(vec![1; 64])]);
        let mut buf = BytesMut::from(&wire[..wire.len() - 1]);
        let before = buf.clone();
        assert!(MessageDecoder::default().decode(&mut buf).unwrap().is_none());
        assert_eq!(buf, before);
    }

    #[test]
    fn test_excessive_nesting_is_a_decode_error() {
        let mut wire = vec![0x91u8; 4096];
        wire.push(0xc0);
        let mut buf = BytesMut::from(&wire[..]);
        match MessageDecoder::default().decode(&mut buf) {
            Err(RpcError::Deserialization(_)) => {}
            other => panic!("expected deserialization error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_incomplete_value_is_rejected() {
        // bin32 header announcing 1 MiB, followed by a short body.
        let mut wire = vec![0xc6, 0x00, 0x10, 0x00, 0x00];
        wire.extend(vec![0u8; 64]);
        let mut buf = BytesMut::from(&wire[..]);
        match MessageDecoder::new(32).decode(&mut buf) {
            Err(RpcError::Protocol(ProtocolError::FrameTooLarge { size, limit })) => {
                // The announced size is rejected before the body arrives.
                assert_eq!(size, 5 + 1024 * 1024);
                assert_eq!(limit, 32);
            }
            other => panic!("expected frame too large, got {:?}", other),
        }
    }

    #[test]
    fn test_reserved_marker_is_a_decode_error() {
        let mut buf = BytesMut::from(&[0x92, 0x01, 0xc1][..]);
        assert!(matches!(
            MessageDecoder::default().decode(&mut buf),
            Err(RpcError::Deserialization(_))
        ));
    }

    #[test]
    fn test_large_frame_in_small_reads_is_parsed_once() {
        let wire = notification("blob", vec![Value::Binary(vec![0x5a; 4 * 1024 * 1024])]);
        let mut decoder = MessageDecoder::default();
        let mut buf = BytesMut::new();
        let chunks: Vec<_> = wire.chunks(8 * 1024).collect();
        let (last, rest) = chunks.split_last().unwrap();
        for chunk in rest {
            buf.extend_from_slice(chunk);
            assert!(decoder.decode(&mut buf).unwrap().is_none());
        }
        assert_eq!(decoder.parses, 0);
        // The walk has already stepped past the string and bin headers.
        assert!(decoder.scan.offset > 0);

        buf.extend_from_slice(last);
        let value = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoder.parses, 1);
        assert!(buf.is_empty());
        match Message::from_value(value).unwrap() {
            Message::Notification(n) => {
                assert_eq!(n.method, "blob");
                assert_eq!(n.params[0].as_slice().map(<[u8]>::len), Some(4 * 1024 * 1024));
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }
}
