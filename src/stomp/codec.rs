//! STOMP frame codec
//!
//! Frame format: `COMMAND\n` + `key:value\n`* + `\n` + body + `\0`.
//! A lone `\n` (or `\r\n`) between frames is a heartbeat.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::frame::{Command, Frame};
use crate::error::FeedError;

/// Default limit for the command line plus headers
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

/// Default limit for a frame body
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Incremental STOMP codec over a growing receive buffer
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_header_bytes: usize,
    max_body_bytes: usize,
    /// Bytes of a rejected frame that have not arrived yet
    pending_discard: usize,
}

/// Extent of a rejected frame in the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    /// Through the first NUL at or after this offset, or everything buffered
    ToNul(usize),
    /// Exactly this many bytes, which may not all be buffered yet
    Exact(usize),
}

#[derive(Debug)]
struct Rejected {
    error: FeedError,
    skip: Skip,
}

impl Rejected {
    fn new(error: FeedError, skip: Skip) -> Self {
        Self { error, skip }
    }
}

impl From<FeedError> for Rejected {
    fn from(error: FeedError) -> Self {
        Self::new(error, Skip::ToNul(0))
    }
}

impl FrameCodec {
    pub fn new(max_header_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            max_header_bytes,
            max_body_bytes,
            pending_discard: 0,
        }
    }

    /// Encode a frame into a standalone buffer
    pub fn encode_frame(&self, frame: &Frame) -> Bytes {
        let mut dst = BytesMut::with_capacity(64 + frame.body.len());
        write_frame(frame, &mut dst);
        dst.freeze()
    }

    /// Decode the next complete frame, leaving partial input buffered
    fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Frame>, Rejected> {
        match src.first() {
            None => return Ok(None),
            Some(b'\n') => {
                src.advance(1);
                return Ok(Some(Frame::heartbeat()));
            }
            Some(b'\r') => {
                if src.len() < 2 {
                    return Ok(None);
                }
                if src[1] == b'\n' {
                    src.advance(2);
                    return Ok(Some(Frame::heartbeat()));
                }
            }
            Some(_) => {}
        }

        let (header_len, body_start) = match find_header_end(src)? {
            Some(bounds) => bounds,
            None if src.len() > self.max_header_bytes => {
                return Err(FeedError::MalformedFrame(format!(
                    "header section exceeds {} bytes without terminator",
                    self.max_header_bytes
                ))
                .into());
            }
            None => return Ok(None),
        };

        // a frame with a readable content-length is skipped whole, even when rejected
        let declared_end = |len: usize| Skip::Exact(body_start + len + 1);
        let fallback = match raw_content_length(&src[..header_len]) {
            Some(len) => declared_end(len),
            None => Skip::ToNul(body_start),
        };

        if header_len > self.max_header_bytes {
            return Err(Rejected::new(
                FeedError::MalformedFrame(format!(
                    "header section of {} bytes exceeds {} bytes",
                    header_len, self.max_header_bytes
                )),
                fallback,
            ));
        }

        let (command, headers) = parse_header_section(&src[..header_len])
            .map_err(|error| Rejected::new(error, fallback))?;

        let body_len = match headers.get("content-length") {
            Some(raw) => {
                let len: usize = raw.trim().parse().map_err(|_| {
                    Rejected::new(
                        FeedError::MalformedFrame(format!("invalid content-length: {raw}")),
                        Skip::ToNul(body_start),
                    )
                })?;
                if len > self.max_body_bytes {
                    return Err(Rejected::new(
                        FeedError::MalformedFrame(format!(
                            "content-length {} exceeds {} bytes",
                            len, self.max_body_bytes
                        )),
                        declared_end(len),
                    ));
                }
                let needed = body_start + len + 1;
                if src.len() < needed {
                    src.reserve(needed - src.len());
                    return Ok(None);
                }
                if src[body_start + len] != 0 {
                    // the declared length is wrong, so the real terminator lies further on
                    return Err(Rejected::new(
                        FeedError::MalformedFrame(format!(
                            "content-length {} does not match body",
                            len
                        )),
                        Skip::ToNul(body_start + len),
                    ));
                }
                len
            }
            None => match src[body_start..].iter().position(|&b| b == 0) {
                Some(len) => len,
                None if src.len() - body_start > self.max_body_bytes => {
                    return Err(Rejected::new(
                        FeedError::MalformedFrame(format!(
                            "body exceeds {} bytes without NUL terminator",
                            self.max_body_bytes
                        )),
                        Skip::ToNul(body_start),
                    ));
                }
                None => return Ok(None),
            },
        };

        let mut raw = src.split_to(body_start + body_len + 1);
        raw.advance(body_start);
        raw.truncate(body_len);

        Ok(Some(Frame {
            command,
            headers,
            body: raw.freeze(),
        }))
    }

    /// Drop the bytes of a rejected frame; returns how many were dropped now
    fn discard_malformed(&mut self, src: &mut BytesMut, skip: Skip) -> usize {
        let skipped = match skip {
            Skip::ToNul(from) => {
                let from = from.min(src.len());
                src[from..]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|pos| from + pos + 1)
                    .unwrap_or(src.len())
            }
            Skip::Exact(len) => {
                let available = len.min(src.len());
                self.pending_discard = len - available;
                available
            }
        };
        src.advance(skipped);
        skipped
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES, DEFAULT_MAX_BODY_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FeedError;

    /// On `MalformedFrame` the offending bytes are dropped so the next call resumes
    /// at the following frame.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.pending_discard > 0 {
            let available = self.pending_discard.min(src.len());
            src.advance(available);
            self.pending_discard -= available;
            if self.pending_discard > 0 {
                return Ok(None);
            }
        }

        match self.decode_frame(src) {
            Ok(frame) => Ok(frame),
            Err(Rejected { error, skip }) => {
                let skipped = self.discard_malformed(src, skip);
                debug!(
                    skipped,
                    pending = self.pending_discard,
                    error = %error,
                    "Discarded malformed frame bytes"
                );
                Err(error)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FeedError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(&item, dst);
        Ok(())
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = FeedError;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(item, dst);
        Ok(())
    }
}

fn write_frame(frame: &Frame, dst: &mut BytesMut) {
    if frame.is_heartbeat() {
        dst.put_u8(b'\n');
        return;
    }

    let escape = frame.command.escapes_headers();
    dst.reserve(frame.command.as_str().len() + frame.body.len() + 64);
    dst.put_slice(frame.command.as_str().as_bytes());
    dst.put_u8(b'\n');
    for (key, value) in &frame.headers {
        if escape {
            put_escaped(dst, key);
            dst.put_u8(b':');
            put_escaped(dst, value);
        } else {
            dst.put_slice(key.as_bytes());
            dst.put_u8(b':');
            dst.put_slice(value.as_bytes());
        }
        dst.put_u8(b'\n');
    }
    dst.put_u8(b'\n');
    dst.put_slice(&frame.body);
    dst.put_u8(0);
}

fn put_escaped(dst: &mut BytesMut, raw: &str) {
    for byte in raw.bytes() {
        match byte {
            b'\\' => dst.put_slice(b"\\\\"),
            b'\n' => dst.put_slice(b"\\n"),
            b'\r' => dst.put_slice(b"\\r"),
            b':' => dst.put_slice(b"\\c"),
            other => dst.put_u8(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String, FeedError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(FeedError::MalformedFrame(format!(
                    "invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

/// Returns `(header_len, body_start)` once the blank line ending the header section is
/// buffered. `header_len` excludes the blank line.
fn find_header_end(buf: &[u8]) -> Result<Option<(usize, usize)>, FeedError> {
    let mut line_start = 0;
    for (i, &byte) in buf.iter().enumerate() {
        match byte {
            0 => {
                return Err(FeedError::MalformedFrame(
                    "NUL before end of headers".to_string(),
                ));
            }
            b'\n' => {
                let line = &buf[line_start..i];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if line.is_empty() && line_start > 0 {
                    return Ok(Some((line_start, i + 1)));
                }
                line_start = i + 1;
            }
            _ => {}
        }
    }
    Ok(None)
}

fn parse_header_section(
    section: &[u8],
) -> Result<(Command, std::collections::BTreeMap<String, String>), FeedError> {
    let text = std::str::from_utf8(section)
        .map_err(|e| FeedError::MalformedFrame(format!("header section is not UTF-8: {e}")))?;

    let mut lines = text.lines();
    let command = match lines.next().map(str::trim_end) {
        Some(raw) if !raw.is_empty() => Command::parse(raw),
        _ => return Err(FeedError::MalformedFrame("missing command".to_string())),
    };

    let escaped = command.escapes_headers();
    let mut headers = std::collections::BTreeMap::new();
    for line in lines {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let (key, value) = line.split_once(':').ok_or_else(|| {
            FeedError::MalformedFrame(format!("header line without ':': {line}"))
        })?;
        let (key, value) = if escaped {
            (unescape(key)?, unescape(value)?)
        } else {
            (key.to_string(), value.to_string())
        };
        // repeated headers: the first occurrence wins
        headers.entry(key).or_insert(value);
    }

    Ok((command, headers))
}

/// First `content-length` in a header section that may not parse as a whole
fn raw_content_length(section: &[u8]) -> Option<usize> {
    section.split(|&b| b == b'\n').find_map(|line| {
        let value = line.strip_prefix(b"content-length:")?;
        std::str::from_utf8(value).ok()?.trim().parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stomp::HeartbeatPair;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_round_trip() {
        let mut codec = FrameCodec::default();
        let frames = vec![
            Frame::connect("WebRT", "rtweb", "rtweb", HeartbeatPair::new(20_000, 0)),
            Frame::subscribe("sub-0", "/exchange/BetSlipRTv4Topics/GAME"),
            Frame::new(Command::Message)
                .with_header("destination", "/exchange/x/GAME")
                .with_header("note", "a:b\nc\\d")
                .with_body(r#"[{"gid":1,"seq":2}]"#),
            Frame::new(Command::Error)
                .with_header("content-length", "3")
                .with_body(&b"a\0b"[..]),
            Frame::heartbeat(),
            Frame::new(Command::Other("RECEIPT".into())).with_header("receipt-id", "77"),
        ];

        for frame in frames {
            let mut buf = BytesMut::new();
            codec.encode(&frame, &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_heartbeat_wire_form() {
        let codec = FrameCodec::default();
        assert_eq!(&codec.encode_frame(&Frame::heartbeat())[..], b"\n");
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\ndestination:/x\n\n{\"gid\""[..]);

        // No terminator yet: must not be reported as malformed
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(!buf.is_empty());

        buf.extend_from_slice(b":1}\0");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(&frame.body[..], br#"{"gid":1}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"CONNECTED\nversion:1.2\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"heart-beat:10000,10000\n\n\0");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.header("heart-beat"), Some("10000,10000"));
    }

    #[test]
    fn test_split_content_length_body() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:5\n\nhel"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo\0");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.body[..], b"hello");
    }

    #[test]
    fn test_multiple_frames_and_heartbeats() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\n");
        buf.extend_from_slice(b"MESSAGE\n\none\0");
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(b"MESSAGE\n\ntwo\0");

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 4);
        assert!(frames[0].is_heartbeat());
        assert_eq!(&frames[1].body[..], b"one");
        assert!(frames[2].is_heartbeat());
        assert_eq!(&frames[3].body[..], b"two");
    }

    #[test]
    fn test_content_length_mismatch_is_malformed() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:2\n\nhello\0MESSAGE\n\nok\0"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FeedError::MalformedFrame(_)));

        // decoding resumes at the next frame
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.body[..], b"ok");
    }

    #[test]
    fn test_mismatched_length_with_embedded_nul_skips_whole_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"MESSAGE\ncontent-length:5\n\nab\0cdefg\0");
        buf.extend_from_slice(b"MESSAGE\ndestination:/x\n\nnext\0");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FeedError::MalformedFrame(_))
        ));
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header("destination"), Some("/x"));
        assert_eq!(&frame.body[..], b"next");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bad_header_skips_declared_body() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"MESSAGE\ncontent-length:4\nbroken\n\na\0bc\0");
        buf.extend_from_slice(b"MESSAGE\n\nok\0");

        assert!(codec.decode(&mut buf).is_err());
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.body[..], b"ok");
    }

    #[test]
    fn test_oversized_declared_body_is_skipped_across_reads() {
        let mut codec = FrameCodec::new(1024, 8);
        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:20\n\n0123\0"[..]);

        assert!(codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());

        // rest of the oversized body, NULs included, then a good frame
        buf.extend_from_slice(b"456789\0abcdefgh\0");
        buf.extend_from_slice(b"MESSAGE\n\nok\0");
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].body[..], b"ok");
    }

    #[test]
    fn test_oversized_header_is_malformed() {
        let mut codec = FrameCodec::new(32, 1024);
        let mut buf = BytesMut::from(&b"MESSAGE\n"[..]);
        buf.extend_from_slice(&[b'x'; 64]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FeedError::MalformedFrame(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_body_without_terminator_is_malformed() {
        let mut codec = FrameCodec::new(1024, 8);
        let mut buf = BytesMut::from(&b"MESSAGE\n\n0123456789"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_header_without_colon_is_malformed() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\nbroken-header\n\n\0"[..]);
        assert!(codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_repeated_header_first_wins() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\nfoo:first\nfoo:second\n\n\0"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header("foo"), Some("first"));
    }

    #[test]
    fn test_connected_headers_not_unescaped() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"CONNECTED\nserver:rabbit\\c3\n\n\0"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header("server"), Some("rabbit\\c3"));
    }

    #[test]
    fn test_unknown_command_decodes() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"RECEIPT\nreceipt-id:1\n\n\0"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, Command::Other("RECEIPT".into()));
    }
}
