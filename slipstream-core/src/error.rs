//! Error taxonomy shared across the Slipstream crates.

use thiserror::Error;

/// Result alias used throughout the Slipstream crates.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure conditions the balancer distinguishes.
///
/// Node-level failures are absorbed into registry-state changes and never
/// reach a client directly; only the final post-retry outcome does.
#[derive(Error, Debug)]
pub enum Error {
    /// The registry is empty or every node is unavailable.
    #[error("no nodes available")]
    NoNodesAvailable,

    /// A client exceeded its per-second admission allowance.
    #[error("client {client} exceeded {limit} requests per second")]
    RateLimited {
        /// Client identifier (IP) that was throttled.
        client: String,
        /// The configured per-second admission limit.
        limit: u32,
    },

    /// A queued request gave up waiting for free capacity.
    #[error("request timed out after waiting {waited_ms}ms for free capacity")]
    QueueTimeout {
        /// How long the request was parked before giving up.
        waited_ms: u64,
    },

    /// A node could not be reached at the transport level.
    #[error("node {url} is unreachable: {message}")]
    Unreachable {
        /// URL of the unreachable node.
        url: String,
        /// Transport-level failure description.
        message: String,
    },

    /// A node answered its probe with a status outside the accepted set.
    #[error("node {url} reported status \"{status}\"")]
    UnhealthyBackend {
        /// URL of the unhealthy node.
        url: String,
        /// The status string the node reported.
        status: String,
    },

    /// A forwarded request came back with a non-2xx status.
    #[error("upstream {url} answered HTTP {status}")]
    Upstream {
        /// URL of the node that failed the request.
        url: String,
        /// HTTP status code returned by the node.
        status: u16,
    },

    /// A probe response did not match any known payload shape.
    #[error("unrecognized probe payload: {message}")]
    ProbeParse {
        /// Parse failure description.
        message: String,
    },

    /// The durable node store failed to load or persist.
    #[error("store operation failed: {message}")]
    Store {
        /// Store failure description.
        message: String,
    },

    /// Startup configuration was rejected.
    #[error("invalid configuration: {message}")]
    Config {
        /// Validation failure description.
        message: String,
    },

    /// An HTTP transport error outside of node reachability.
    #[error("http transport error: {message}")]
    Http {
        /// Transport failure description.
        message: String,
    },
}

impl Error {
    /// Builds a [`Error::ProbeParse`] from any displayable cause.
    pub fn probe_parse(message: impl std::fmt::Display) -> Self {
        Error::ProbeParse {
            message: message.to_string(),
        }
    }

    /// Builds a [`Error::Store`] from any displayable cause.
    pub fn store(message: impl std::fmt::Display) -> Self {
        Error::Store {
            message: message.to_string(),
        }
    }

    /// Builds a [`Error::Config`] from any displayable cause.
    pub fn config(message: impl std::fmt::Display) -> Self {
        Error::Config {
            message: message.to_string(),
        }
    }

    /// Builds a [`Error::Http`] from any displayable cause.
    pub fn http(message: impl std::fmt::Display) -> Self {
        Error::Http {
            message: message.to_string(),
        }
    }
}
