//! NNTP wire client (RFC 3977, RFC 4643 authentication).
//!
//! One [`NntpConnection`] is one TCP or TLS link in command state: strictly
//! request then response, with multiline payloads framed by dot-stuffing and
//! a lone-dot terminator. The split between "answered but the article is not
//! there" and "the exchange itself broke" is load-bearing for everything
//! above this crate: a 430 is an authoritative answer from a healthy server,
//! while a malformed reply or a dropped link poisons the connection.
//!
//! Connection sharing, pooling, and retries all live in `newsreel-client`;
//! this crate assumes exclusive access to the connection for the duration of
//! each call.

pub mod conn;
pub mod response;

pub use conn::NntpConnection;
pub use response::{Response, ResponseClass};
