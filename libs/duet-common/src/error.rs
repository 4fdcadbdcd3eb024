//! Error taxonomy shared by the host and the container side.
//!
//! Domain errors are the test logic reporting a problem; everything else is
//! infrastructure that kept the run from completing.

use crate::types::Side;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("no test found with name {0:?}. Has it been registered?")]
    NotFound(String),

    #[error("a test named {0:?} is already registered")]
    DuplicateName(String),

    #[error("failed listening for address on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed accepting address connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("timed out {} after {:.1} seconds{}", .operation, .after.as_secs_f64(), LastError(.last_error))]
    Timeout {
        operation: &'static str,
        after: Duration,
        last_error: Option<String>,
    },

    #[error("error writing address marker to {peer}: {source}")]
    Write {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{side} test failed: {message}")]
    Domain { side: Side, message: String },

    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("container error: {0}")]
    Container(String),
}

/// Renders the optional most-recent error suffix of a timeout.
struct LastError<'a>(&'a Option<String>);

impl fmt::Display for LastError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(err) => write!(f, ", most recent error: {}", err),
            None => Ok(()),
        }
    }
}

impl HarnessError {
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout {
            operation,
            after,
            last_error: None,
        }
    }

    /// Wraps a test body failure, keeping the whole `anyhow` context chain.
    pub fn domain(side: Side, err: &anyhow::Error) -> Self {
        Self::Domain {
            side,
            message: format!("{:#}", err),
        }
    }

    /// True when the test logic itself reported the failure.
    pub fn is_domain(&self) -> bool {
        matches!(self, Self::Domain { .. })
    }

    pub fn is_infrastructure(&self) -> bool {
        !self.is_domain()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Stable short name for structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::DuplicateName(_) => "duplicate_name",
            Self::Listen { .. } => "listen",
            Self::Accept(_) => "accept",
            Self::Timeout { .. } => "timeout",
            Self::Write { .. } => "write",
            Self::Domain { .. } => "domain",
            Self::InvalidAddress(_) => "invalid_address",
            Self::Container(_) => "container",
        }
    }
}
