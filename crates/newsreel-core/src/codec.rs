//! Payload encoding seam.
//!
//! The core deliberately never interprets article payload encodings. A codec
//! contributes exactly two capabilities:
//!
//! 1. recognizing a segment's declared placement within its logical file
//!    from the article's header block, and
//! 2. turning the raw (dot-destuffed) article body into the decoded payload
//!    bytes.
//!
//! Production deployments plug in their yEnc implementation here. The
//! [`RawCodec`] ships for tests and demos: placement comes from an
//! `X-Part-Range` header and the body is the payload verbatim.

use std::io::Cursor;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

/// Object-safe alias for `AsyncRead + Send`, blanket-implemented so any
/// such reader coerces into a [`ByteStream`].
pub trait ByteRead: AsyncRead + Send {}

impl<T: AsyncRead + Send + ?Sized> ByteRead for T {}

impl std::fmt::Debug for dyn ByteRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ByteStream")
    }
}

/// Boxed byte stream handed across the codec seam.
pub type ByteStream = Pin<Box<dyn ByteRead>>;

/// Declared placement of one segment's payload within the logical file.
///
/// Catalog order is byte order, so for consecutive segments
/// `a.end() == b.file_offset`. The last segment's `end()` is the file size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredRange {
    pub file_offset: u64,
    pub size: u64,
}

impl DeclaredRange {
    pub fn new(file_offset: u64, size: u64) -> Self {
        DeclaredRange { file_offset, size }
    }

    /// First byte past this segment.
    pub fn end(&self) -> u64 {
        self.file_offset + self.size
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset < self.end()
    }
}

/// Payload encoding plugged in by the host application.
///
/// Implementations must be cheap to call: `parse_header` runs once per
/// placement probe and `decode` once per body open, both on the read path.
pub trait SegmentCodec: Send + Sync {
    /// Extract the declared file placement from a header block, if present.
    /// Returning `None` marks the article as unusable on this server and the
    /// probe moves on to the next candidate.
    fn parse_header(&self, header: &[u8]) -> Option<DeclaredRange>;

    /// Wrap the raw article body into the decoded payload stream. The input
    /// yields dot-destuffed body bytes exactly as they came off the wire.
    fn decode(&self, raw: ByteStream) -> ByteStream;
}

/// Identity codec: placement from an `X-Part-Range: <offset> <size>` header,
/// body passed through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

/// Header recognized by [`RawCodec`].
pub const RANGE_HEADER: &str = "X-Part-Range";

impl RawCodec {
    /// Header line announcing a placement, for posters and test fixtures.
    pub fn format_range_header(range: DeclaredRange) -> String {
        format!("{}: {} {}", RANGE_HEADER, range.file_offset, range.size)
    }
}

impl SegmentCodec for RawCodec {
    fn parse_header(&self, header: &[u8]) -> Option<DeclaredRange> {
        let text = std::str::from_utf8(header).ok()?;
        for line in text.lines() {
            let (name, value) = match line.split_once(':') {
                Some(split) => split,
                None => continue,
            };
            if !name.trim().eq_ignore_ascii_case(RANGE_HEADER) {
                continue;
            }
            let mut parts = value.split_whitespace();
            let offset: u64 = parts.next()?.parse().ok()?;
            let size: u64 = parts.next()?.parse().ok()?;
            return Some(DeclaredRange::new(offset, size));
        }
        None
    }

    fn decode(&self, raw: ByteStream) -> ByteStream {
        raw
    }
}

/// Adapt an in-memory buffer into a [`ByteStream`]. Test and demo helper.
pub fn byte_stream_from(bytes: Vec<u8>) -> ByteStream {
    Box::pin(Cursor::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn declared_range_arithmetic() {
        let range = DeclaredRange::new(1000, 250);
        assert_eq!(range.end(), 1250);
        assert!(range.contains(1000));
        assert!(range.contains(1249));
        assert!(!range.contains(1250));
        assert!(!range.contains(999));
    }

    #[test]
    fn raw_codec_reads_range_header() {
        let header = b"Subject: part 2\r\nX-Part-Range: 4096 1024\r\nFrom: poster\r\n";
        let range = RawCodec.parse_header(header).unwrap();
        assert_eq!(range, DeclaredRange::new(4096, 1024));
    }

    #[test]
    fn raw_codec_header_name_is_case_insensitive() {
        let header = b"x-part-range: 0 512\r\n";
        assert_eq!(
            RawCodec.parse_header(header),
            Some(DeclaredRange::new(0, 512))
        );
    }

    #[test]
    fn raw_codec_rejects_missing_or_malformed_headers() {
        assert!(RawCodec.parse_header(b"Subject: hello\r\n").is_none());
        assert!(RawCodec.parse_header(b"X-Part-Range: twelve 13\r\n").is_none());
        assert!(RawCodec.parse_header(b"X-Part-Range: 12\r\n").is_none());
        assert!(RawCodec.parse_header(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn format_and_parse_round_trip() {
        let line = RawCodec::format_range_header(DeclaredRange::new(77, 33));
        let range = RawCodec.parse_header(line.as_bytes()).unwrap();
        assert_eq!(range, DeclaredRange::new(77, 33));
    }

    #[tokio::test]
    async fn raw_codec_decode_is_identity() {
        let payload = b"raw payload bytes".to_vec();
        let mut decoded = RawCodec.decode(byte_stream_from(payload.clone()));
        let mut out = Vec::new();
        decoded.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }
}
