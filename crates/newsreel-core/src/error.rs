//! Error taxonomy for the streaming core.
//!
//! Operationally there are four families, and every decision the failover
//! layer makes branches on which family an error belongs to:
//!
//! - connection-level failures: the server could not be reached, dropped the
//!   link, or rejected authentication. Eligible for failover and recorded
//!   against server health.
//! - protocol faults: the server is alive but answered outside the contract.
//!   Eligible for failover after the offending connection is replaced.
//! - authoritative not-found: the server definitively does not carry the
//!   article. Failover only when the caller opted in (retention windows
//!   differ per provider).
//! - caller-side interruptions: acquire timeouts and cancellations. Never
//!   recorded as server health failures and never retried on another server.
//!
//! One outlier sits outside the families: [`Error::PlacementGap`], where
//! successfully fetched headers are mutually inconsistent. It charges no
//! server and surfaces to readers as invalid data.

use std::time::Duration;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server could not be reached or the link died mid-exchange.
    ///
    /// ## Causes
    /// - DNS, TCP, or TLS failure while connecting
    /// - greeting other than 200/201
    /// - the peer closed or reset an established connection
    ///
    /// Feeds the per-server circuit breaker; the next candidate server is
    /// tried when one is configured.
    #[error("server {server}: connection failed: {reason}")]
    Connect { server: String, reason: String },

    /// Authentication was rejected by the server.
    ///
    /// Providers reply 481/482 for bad credentials and commonly 502 when the
    /// account is over its connection limit; both heal the same way (back
    /// off, try another server), so both land here.
    #[error("server {server}: authentication rejected ({reply})")]
    Auth { server: String, reply: String },

    /// The server answered outside the protocol contract on an otherwise
    /// live connection. The connection that produced this is poisoned and
    /// must be replaced, never returned to its pool.
    #[error("server {server}: protocol fault: {detail}")]
    Protocol { server: String, detail: String },

    /// Authoritative absence: the queried server definitively does not have
    /// the article. This is a successful protocol exchange, not a server
    /// fault.
    #[error("article <{id}> not found")]
    NotFound { id: String },

    /// Segment headers declare ranges that do not tile the file: `offset`
    /// falls between consecutive segments' declared placements. The ranges
    /// came from successful header fetches, possibly from different servers,
    /// so there is no single connection or server to blame; failover has
    /// already run for each header individually.
    #[error("segment placements leave a gap at byte {offset}")]
    PlacementGap { offset: u64 },

    /// No pool slot became free within the acquire timeout. Distinct from
    /// [`Error::Cancelled`] so callers can catch saturation separately.
    #[error("no connection available on {server} within {waited:?}")]
    AcquireTimeout { server: String, waited: Duration },

    /// The caller gave up. Any connection involved is treated as being in an
    /// unknown state and replaced.
    #[error("operation cancelled")]
    Cancelled,

    /// Every candidate server failed. `first` is the error from the first
    /// candidate, which is the most diagnostic one (the preferred server's
    /// story, not whichever stale fallback happened to run last).
    #[error("all {attempts} servers failed; first error: {first}")]
    AllServersFailed {
        attempts: usize,
        #[source]
        first: Box<Error>,
    },

    /// A component was used after `dispose`.
    #[error("{0} used after dispose")]
    Disposed(&'static str),

    /// Rejected configuration: empty server list, duplicate ids, zero
    /// connection capacity, and similar.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn connect(server: impl Into<String>, reason: impl ToString) -> Self {
        Error::Connect {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(server: impl Into<String>, detail: impl ToString) -> Self {
        Error::Protocol {
            server: server.into(),
            detail: detail.to_string(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Error::NotFound { id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True when trying the next candidate server may still succeed.
    ///
    /// Not-found is handled separately by the failover driver (it depends on
    /// whether the operation opted into cross-server retries), and
    /// caller-side interruptions always propagate unchanged. `Disposed` is
    /// retryable because it only means this operation raced a configuration
    /// swap onto a retired pool.
    pub fn is_retryable_on_next_server(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::Auth { .. }
                | Error::Protocol { .. }
                | Error::Tls(_)
                | Error::Io(_)
                | Error::Disposed(_)
        )
    }

    /// True when the error counts against the originating server's health.
    /// Timeouts and cancellations say something about the caller, not the
    /// server, and never count; neither does racing a configuration swap.
    pub fn records_health_failure(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::Auth { .. }
                | Error::Protocol { .. }
                | Error::Tls(_)
                | Error::Io(_)
        )
    }

    /// True when the connection that produced this error is in an unknown
    /// protocol state and must not be reused. Cancellation counts: the
    /// command may have been half-written when the caller gave up.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::Auth { .. }
                | Error::Protocol { .. }
                | Error::Io(_)
                | Error::Tls(_)
                | Error::Cancelled
        )
    }

    /// Lossy conversion for `AsyncRead` surfaces, which speak `io::Error`.
    pub fn into_io(self) -> std::io::Error {
        use std::io::ErrorKind;
        let kind = match &self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::PlacementGap { .. } => ErrorKind::InvalidData,
            Error::AcquireTimeout { .. } => ErrorKind::TimedOut,
            Error::Cancelled => ErrorKind::Interrupted,
            Error::Io(e) => e.kind(),
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Classification
    // ========================================================================

    #[test]
    fn connection_and_protocol_errors_are_retryable() {
        assert!(Error::connect("s1", "refused").is_retryable_on_next_server());
        assert!(Error::protocol("s1", "garbage reply").is_retryable_on_next_server());
        assert!(Error::Auth {
            server: "s1".into(),
            reply: "481 wrong".into()
        }
        .is_retryable_on_next_server());
    }

    #[test]
    fn not_found_and_interruptions_are_not_retryable() {
        assert!(!Error::not_found("a@b").is_retryable_on_next_server());
        assert!(!Error::Cancelled.is_retryable_on_next_server());
        assert!(!Error::AcquireTimeout {
            server: "s1".into(),
            waited: Duration::from_secs(5)
        }
        .is_retryable_on_next_server());
    }

    #[test]
    fn interruptions_never_record_health_failures() {
        assert!(!Error::Cancelled.records_health_failure());
        assert!(!Error::AcquireTimeout {
            server: "s1".into(),
            waited: Duration::from_secs(5)
        }
        .records_health_failure());
        assert!(Error::connect("s1", "refused").records_health_failure());
    }

    #[test]
    fn racing_a_retired_pool_is_retryable_but_not_a_server_fault() {
        let err = Error::Disposed("connection pool");
        assert!(err.is_retryable_on_next_server());
        assert!(!err.records_health_failure());
    }

    #[test]
    fn placement_gaps_are_data_faults_not_caller_errors() {
        let err = Error::PlacementGap { offset: 120 };
        assert!(!err.is_retryable_on_next_server());
        assert!(!err.records_health_failure());
        assert!(!err.poisons_connection());
        assert_eq!(err.into_io().kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn not_found_does_not_poison_the_connection() {
        assert!(!Error::not_found("a@b").poisons_connection());
        assert!(Error::protocol("s1", "bad").poisons_connection());
        assert!(Error::Cancelled.poisons_connection());
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    #[test]
    fn io_conversion_preserves_semantic_kinds() {
        assert_eq!(
            Error::not_found("a@b").into_io().kind(),
            std::io::ErrorKind::NotFound
        );
        assert_eq!(
            Error::Cancelled.into_io().kind(),
            std::io::ErrorKind::Interrupted
        );
    }

    #[test]
    fn exhaustion_display_carries_first_error() {
        let err = Error::AllServersFailed {
            attempts: 3,
            first: Box::new(Error::connect("primary", "connection refused")),
        };
        let text = err.to_string();
        assert!(text.contains("3 servers"));
        assert!(text.contains("primary"));
        assert!(text.contains("refused"));
    }
}
