//! Error handling for psql-front
//!
//! One enum covers the whole taxonomy: wire-level I/O, idle timeouts,
//! analyzer failures, cache-database failures, and origin failures. The
//! distinguishable classes the rest of the system dispatches on are
//! `Analyze` (never injected into the wire stream), `OriginNotFound`
//! (logged and swallowed during refresh), and `IdleTimeout` (expected
//! teardown, logged at warn).

use thiserror::Error;

/// PostgreSQL SQLSTATE error codes used on the injected wire messages.
/// See: https://www.postgresql.org/docs/current/errcodes-appendix.html
pub mod sqlstate {
    /// Class 00 — Successful Completion (used on NoticeResponse)
    pub const SUCCESSFUL_COMPLETION: &str = "00000";

    /// Class 58 — System Error (external to PostgreSQL itself)
    pub const IO_ERROR: &str = "58030";
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("analyze query: {0}")]
    Analyze(#[from] sqlparser::parser::ParserError),

    #[error("origin not found: {0}")]
    OriginNotFound(String),

    /// Opaque transient failure inside an origin (HTTP, CSV, encoding, ...).
    #[error("origin: {0}")]
    Origin(anyhow::Error),

    #[error("config: {0}")]
    Config(anyhow::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("idle timeout expired")]
    IdleTimeout,

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn origin(err: impl Into<anyhow::Error>) -> Self {
        Error::Origin(err.into())
    }

    pub fn config(err: impl Into<anyhow::Error>) -> Self {
        Error::Config(err.into())
    }

    pub fn is_origin_not_found(&self) -> bool {
        matches!(self, Error::OriginNotFound(_))
    }

    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, Error::IdleTimeout)
    }

    pub fn is_analyze(&self) -> bool {
        matches!(self, Error::Analyze(_))
    }

    /// A clean peer hangup: the other side went away between messages.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
