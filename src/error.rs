//! Error types for the overlay control plane.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the vxmesh core.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input (missing namespace path, bad flag combination...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unparsable CIDR notation
    #[error("Invalid CIDR '{0}'")]
    InvalidCidr(String),

    /// Unparsable hardware address
    #[error("Invalid MAC address '{0}'")]
    InvalidMac(String),

    /// Unparsable or out-of-range IP address
    #[error("Invalid IP address: {0}")]
    InvalidAddress(String),

    /// Nothing stored under the key or prefix
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Kernel link configuration failed
    #[error("Netlink {op} failed on {target}: {detail}")]
    Netlink {
        op: &'static str,
        target: String,
        detail: String,
    },

    /// A kernel or store call exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Distributed store transport failure
    #[error("Store error: {0}")]
    Store(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint is active and no forced deactivation was requested
    #[error("Endpoint {0} is still active")]
    EndpointActive(String),

    /// A namespace still holds endpoint interfaces
    #[error("Endpoint interface {interface} still present in namespace {}", namespace.display())]
    EndpointStillPresent {
        namespace: PathBuf,
        interface: String,
    },

    /// The endpoint has no wiring to tear down
    #[error("Endpoint {0} is already disabled")]
    EndpointDisabled(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The sequential allocator reached its configured maximum
    #[error("No id available")]
    NoIdAvailable,

    #[error("No available IP addresses in pool {0}")]
    PoolExhausted(String),

    /// The persisted bit-vector does not match the configured CIDR
    #[error("IP pool {scope} holds {found} addresses but its CIDR implies {expected}")]
    PoolMismatch {
        scope: String,
        expected: usize,
        found: usize,
    },

    /// Endpoints still reference the network
    #[error("Network {0} still has endpoints")]
    NetworkInUse(String),

    #[error("Unknown network type '{0}'")]
    UnknownNetworkType(String),
}

impl Error {
    pub(crate) fn netlink(op: &'static str, target: impl Into<String>, detail: impl ToString) -> Self {
        Error::Netlink {
            op,
            target: target.into(),
            detail: detail.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// True for errors the caller caused; retrying them never helps.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_)
                | Error::InvalidCidr(_)
                | Error::InvalidMac(_)
                | Error::InvalidAddress(_)
        )
    }
}

impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        Error::Store(e.to_string())
    }
}

/// Result type alias for vxmesh operations
pub type Result<T> = std::result::Result<T, Error>;
