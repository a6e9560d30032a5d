use thiserror::Error;

/// Errors raised while building or parsing a [`crate::Url`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlParseError {
    /// The input had no `scheme://` prefix.
    #[error("missing protocol in url: {0}")]
    MissingProtocol(String),
    /// The port segment was not a valid `u16`.
    #[error("invalid port in url: {0}")]
    InvalidPort(String),
    /// A `%XX` escape sequence was malformed.
    #[error("invalid percent-encoding: {0}")]
    InvalidEncoding(String),
}

/// The outcome of a single remote/local call, carried inside a completed
/// [`crate::RpcResult`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// The callee returned an application-level error.
    #[error("remote error: {0}")]
    Remote(String),
    /// The call did not complete within its deadline.
    #[error("call timed out")]
    Timeout,
    /// A local, non-remote failure (serialization, destroyed invoker, ...).
    #[error("internal error: {0}")]
    Internal(String),
    /// A consumer invoker was called while its directory held no matching
    /// providers.
    #[error("no providers available for {0}")]
    NoProviders(String),
}
