//! Error types for the registry integration layer.

use thiserror::Error;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by extension resolution, URL handling, the registry facade,
/// and the provider/consumer pipelines.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// No implementation registered under the requested (interface, name).
    #[error("extension not found: {interface}/{name}")]
    ExtensionNotFound {
        /// Interface the extension was requested for.
        interface: String,
        /// Name that was requested.
        name: String,
    },

    /// A factory callback failed while constructing an extension instance.
    #[error("failed to instantiate extension {interface}/{name}: {reason}")]
    ExtensionInstantiationFailed {
        /// Interface the extension was requested for.
        interface: String,
        /// Name that was requested.
        name: String,
        /// Underlying failure.
        reason: String,
    },

    /// More than one descriptor claims to be the adaptive class for an interface.
    #[error("adaptive extension conflict for interface {0}")]
    AdaptiveConflict(String),

    /// A URL string did not parse.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The naming-service client could not be reached. Retried by failback.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// A subscribe/unsubscribe call failed. Retried by failback.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// The transport-level Protocol plug-in failed to export a local invoker.
    #[error("protocol export failed: {0}")]
    ProtocolExportFailed(String),

    /// The remote peer returned an application-level error.
    #[error("remote error: {0}")]
    RpcRemoteError(String),

    /// A call did not complete within its configured timeout.
    #[error("call timed out")]
    RpcTimeout,

    /// A consumer invoker was called while its directory held no providers.
    #[error("no providers available for {0}")]
    NoProvidersAvailable(String),

    /// Internal invariant violation; always a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the Registry Facade's failback retry should reschedule this
    /// error rather than surface it to the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RegistryUnavailable(_) | Self::SubscribeFailed(_))
    }
}

impl From<fabric_core::UrlParseError> for Error {
    fn from(e: fabric_core::UrlParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}

impl From<fabric_core::CallError> for Error {
    fn from(e: fabric_core::CallError) -> Self {
        match e {
            fabric_core::CallError::Remote(msg) => Self::RpcRemoteError(msg),
            fabric_core::CallError::Timeout => Self::RpcTimeout,
            fabric_core::CallError::Internal(msg) => Self::Internal(msg),
            fabric_core::CallError::NoProviders(key) => Self::NoProvidersAvailable(key),
        }
    }
}
