//! Segment and article identity types.
//!
//! A logical file is an ordered list of segments, each stored remotely as
//! one article. Catalog order is byte order: segment `i + 1`'s payload
//! starts where segment `i`'s ends. Byte placement is not trusted from the
//! catalog; it is probed from article headers and recorded as a
//! [`DeclaredRange`](crate::codec::DeclaredRange) once known.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque article identity: the message-id without angle brackets.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn new(id: impl Into<String>) -> Self {
        let raw: String = id.into();
        // Tolerate bracketed input from catalogs that keep the wire form.
        let trimmed = raw
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .map(str::to_owned)
            .unwrap_or(raw);
        SegmentId(trimmed)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wire form used in protocol commands.
    pub fn bracketed(&self) -> String {
        format!("<{}>", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl From<&str> for SegmentId {
    fn from(s: &str) -> Self {
        SegmentId::new(s)
    }
}

impl From<String> for SegmentId {
    fn from(s: String) -> Self {
        SegmentId::new(s)
    }
}

/// One article's place within a logical file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Zero-based position in catalog order.
    pub index: usize,
    pub id: SegmentId,
}

impl Segment {
    pub fn new(index: usize, id: impl Into<SegmentId>) -> Self {
        Segment {
            index,
            id: id.into(),
        }
    }
}

/// Build a catalog from ids already in byte order.
pub fn catalog<I, S>(ids: I) -> Vec<Segment>
where
    I: IntoIterator<Item = S>,
    S: Into<SegmentId>,
{
    ids.into_iter()
        .enumerate()
        .map(|(index, id)| Segment {
            index,
            id: id.into(),
        })
        .collect()
}
