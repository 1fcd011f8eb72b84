//! Core types shared across the newsreel workspace.
//!
//! This crate is dependency-light on purpose: it defines the error taxonomy,
//! the segment and server data model, and the [`SegmentCodec`] seam through
//! which article payload encodings are plugged in. The resilience machinery
//! (pooling, failover, caching) lives in `newsreel-client`; the seekable
//! stream and integrity checker live in `newsreel-stream`.

pub mod codec;
pub mod error;
pub mod segment;
pub mod server;

pub use codec::{byte_stream_from, ByteStream, DeclaredRange, RawCodec, SegmentCodec};
pub use error::{Error, Result};
pub use segment::{catalog, Segment, SegmentId};
pub use server::{Credentials, ServerConfig};
