use thiserror::Error;

/// Errors that may occur in this library.
///
/// The reload path surfaces each failure mode as its own variant so callers
/// can tell a persistence problem from a hardware one. Whatever the failure,
/// the manager is never left holding two connections or a stale handle: a
/// failed swap leaves it connectionless, and a later reload can heal it.
#[derive(Debug, Error)]
pub enum Error {
    /// The manager is missing a collaborator it needs (factory or store).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A configuration file which does not uphold its invariants.
    #[error("bad configuration: {0}")]
    BadConfig(String),

    /// Persisted port options did not pass normalization.
    #[error("invalid port options: {0}")]
    Validation(String),

    /// The configuration store failed.
    #[error("configuration store failure: {0}")]
    Store(String),

    /// The store returned zero enabled configurations.
    #[error("no enabled configurations found")]
    NoConfiguration,

    /// The factory could not construct a connection.
    #[error("could not open device: {0}")]
    Open(String),

    /// The connection opened but failed its handshake.
    #[error("device failed to initialize: {0}")]
    Init(String),

    /// The manager is closed, or no connection is installed.
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// An I/O problem on a live connection.
    #[error("device i/o problem: {0}")]
    Device(String),
}

impl Error {
    /// Whether this is the cancellation error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
