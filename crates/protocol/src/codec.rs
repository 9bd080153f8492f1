//! Newline-delimited framing.
//!
//! The decoder never fails on bad input: malformed or oversized lines surface as
//! [`Decoded::Malformed`] items so the caller can log them and keep reading.

use crate::error::ProtocolError;
use crate::message::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for a single line (8 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A single message, or every valid member of a batch array.
    Messages(Vec<Message>),
    /// The line was dropped.
    Malformed(ProtocolError),
}

#[derive(Debug, Clone)]
pub struct LineCodec {
    max_line_bytes: usize,
    // Bytes of the buffer already scanned for a newline.
    next_index: usize,
    // Inside an oversized line; drop bytes until the next newline.
    discarding: bool,
}

impl LineCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes: max_line_bytes.max(1),
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

fn trim_line(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., last] = line
        && last.is_ascii_whitespace()
    {
        line = rest;
    }
    while let [first, rest @ ..] = line
        && first.is_ascii_whitespace()
    {
        line = rest;
    }
    line
}

/// Decode one complete line (without its terminator). `None` for blank lines.
fn decode_line(line: &[u8]) -> Option<Decoded> {
    let line = trim_line(line);
    if line.is_empty() {
        return None;
    }
    if std::str::from_utf8(line).is_err() {
        return Some(Decoded::Malformed(ProtocolError::InvalidUtf8));
    }

    let value: Value = match serde_json::from_slice(line) {
        Ok(v) => v,
        Err(e) => return Some(Decoded::Malformed(ProtocolError::Json(e.to_string()))),
    };

    let Value::Array(items) = value else {
        return Some(match Message::from_value(value) {
            Ok(msg) => Decoded::Messages(vec![msg]),
            Err(e) => Decoded::Malformed(e),
        });
    };

    if items.is_empty() {
        return Some(Decoded::Malformed(ProtocolError::InvalidMessage(
            "empty batch".to_string(),
        )));
    }

    let mut messages = Vec::with_capacity(items.len());
    let mut first_error = None;
    for item in items {
        match Message::from_value(item) {
            Ok(msg) => messages.push(msg),
            Err(e) => {
                tracing::warn!(error = %e, "dropping invalid member of JSON-RPC batch");
                first_error.get_or_insert(e);
            }
        }
    }
    match (messages.is_empty(), first_error) {
        (true, Some(e)) => Some(Decoded::Malformed(e)),
        _ => Some(Decoded::Messages(messages)),
    }
}

impl Decoder for LineCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, io::Error> {
        loop {
            let read_to = if self.discarding {
                buf.len()
            } else {
                buf.len().min(self.max_line_bytes.saturating_add(1))
            };
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(idx)) => {
                    buf.advance(idx + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(Decoded::Malformed(ProtocolError::LineTooLong {
                        limit: self.max_line_bytes,
                    })));
                }
                (true, None) => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(idx)) => {
                    let line = buf.split_to(idx + 1);
                    self.next_index = 0;
                    if let Some(decoded) = decode_line(&line[..idx]) {
                        return Ok(Some(decoded));
                    }
                }
                (false, None) if buf.len() > self.max_line_bytes => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, io::Error> {
        if let Some(decoded) = self.decode(buf)? {
            return Ok(Some(decoded));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(Decoded::Malformed(ProtocolError::LineTooLong {
                limit: self.max_line_bytes,
            })));
        }
        // A final line without its terminator.
        let rest = buf.split();
        Ok(decode_line(&rest))
    }
}

impl Encoder<&Message> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = serde_json::to_vec(item).map_err(io::Error::other)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Encode a message as one newline-terminated frame.
pub fn encode(msg: &Message) -> Bytes {
    let mut dst = BytesMut::new();
    // Encoding into memory cannot hit an I/O error, and `Message` always serializes.
    let _ = LineCodec::default().encode(msg, &mut dst);
    dst.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{JsonRpcRequest, RequestId};
    use futures::StreamExt as _;
    use serde_json::json;
    use tokio::io::AsyncWriteExt as _;
    use tokio_util::codec::FramedRead;

    /// Feeds raw chunks through a [`LineCodec`], the way a partial-read stream would.
    #[derive(Default)]
    struct ChunkDecoder {
        codec: LineCodec,
        buf: BytesMut,
    }

    impl ChunkDecoder {
        fn new(max_line_bytes: usize) -> Self {
            Self {
                codec: LineCodec::new(max_line_bytes),
                buf: BytesMut::new(),
            }
        }

        fn decode(&mut self, chunk: &[u8]) -> Vec<Result<Message, ProtocolError>> {
            self.buf.extend_from_slice(chunk);
            let mut out = Vec::new();
            while let Ok(Some(decoded)) = self.codec.decode(&mut self.buf) {
                push_decoded(&mut out, decoded);
            }
            out
        }

        fn finish(&mut self) -> Vec<Result<Message, ProtocolError>> {
            let mut out = Vec::new();
            while let Ok(Some(decoded)) = self.codec.decode_eof(&mut self.buf) {
                push_decoded(&mut out, decoded);
            }
            out
        }
    }

    fn push_decoded(out: &mut Vec<Result<Message, ProtocolError>>, decoded: Decoded) {
        match decoded {
            Decoded::Messages(messages) => out.extend(messages.into_iter().map(Ok)),
            Decoded::Malformed(e) => out.push(Err(e)),
        }
    }

    fn response_id(res: &Result<Message, ProtocolError>) -> Option<RequestId> {
        match res {
            Ok(Message::Response(r)) => r.id.clone(),
            _ => None,
        }
    }

    #[test]
    fn buffers_partial_reads_until_newline() {
        let mut dec = ChunkDecoder::default();
        assert!(dec.decode(br#"{"jsonrpc":"2.0","id":1,"#).is_empty());
        assert!(dec.decode(br#""result":{}}"#).is_empty());
        let out = dec.decode(b"\n");
        assert_eq!(out.len(), 1);
        assert_eq!(response_id(&out[0]), Some(RequestId::Number(1)));
    }

    #[test]
    fn malformed_line_is_dropped_and_stream_continues() {
        let mut dec = ChunkDecoder::default();
        let out = dec.decode(
            b"not json at all\n{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"ok\":true}}\n",
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(ProtocolError::Json(_))));
        assert_eq!(response_id(&out[1]), Some(RequestId::Number(2)));
    }

    #[test]
    fn skips_blank_lines_and_strips_crlf() {
        let mut dec = ChunkDecoder::default();
        let out = dec.decode(b"\r\n\n{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\r\n");
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Ok(Message::Notification(_))));
    }

    #[test]
    fn oversized_line_is_discarded_without_losing_the_next_frame() {
        let mut dec = ChunkDecoder::new(48);
        let big = format!("{{\"jsonrpc\":\"2.0\",\"method\":\"{}\"}}", "x".repeat(100));
        let mut out = dec.decode(&big.as_bytes()[..60]);
        out.extend(dec.decode(&big.as_bytes()[60..]));
        out.extend(dec.decode(b"\n{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":1}\n"));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Err(ProtocolError::LineTooLong { limit: 48 }));
        assert_eq!(response_id(&out[1]), Some(RequestId::Number(3)));
    }

    #[test]
    fn batch_array_yields_each_member() {
        let mut dec = ChunkDecoder::default();
        let out = dec.decode(
            br#"[{"jsonrpc":"2.0","id":1,"result":1},{"bogus":true},{"jsonrpc":"2.0","id":2,"result":2}]
"#,
        );
        let ids: Vec<_> = out.iter().filter_map(response_id).collect();
        assert_eq!(ids, vec![RequestId::Number(1), RequestId::Number(2)]);
    }

    #[test]
    fn finish_flushes_unterminated_last_line() {
        let mut dec = ChunkDecoder::default();
        assert!(dec.decode(br#"{"jsonrpc":"2.0","id":9,"result":null}"#).is_empty());
        let out = dec.finish();
        assert_eq!(out.len(), 1);
        assert_eq!(response_id(&out[0]), Some(RequestId::Number(9)));
    }

    #[test]
    fn encode_emits_one_line() {
        let msg = Message::Request(JsonRpcRequest::new(5, "tools/list", Some(json!({}))));
        let frame = encode(&msg);
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
        assert!(frame.ends_with(b"\n"));
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["method"], "tools/list");
        assert_eq!(value["id"], 5);
    }

    #[tokio::test]
    async fn framed_read_survives_garbage_between_frames() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tokio::spawn(async move {
            tx.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":1}\n{{{\n")
                .await
                .unwrap();
            tx.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":2}\n")
                .await
                .unwrap();
        });

        let items: Vec<_> = FramedRead::new(rx, LineCodec::default())
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], Decoded::Messages(_)));
        assert!(matches!(items[1], Decoded::Malformed(ProtocolError::Json(_))));
        assert!(matches!(items[2], Decoded::Messages(_)));
    }
}
