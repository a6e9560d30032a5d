//! The uniform call surface.

use async_trait::async_trait;

use crate::{Invocation, RpcResult, Url};

/// A handle to something callable: a terminal provider invoker, a filter
/// chain wrapped around one, a directory-backed consumer invoker that picks
/// among several, or a delegating invoker that only overrides the URL.
///
/// Object-safe by design so it is always used behind `Arc<dyn Invoker>` —
/// the framework is generalized over one dynamic interface name rather than
/// a type parameter `T`, since routing decisions (which sub-invoker to
/// call, which filters apply) happen at the URL/name level, not the type
/// level.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Fully-qualified name of the interface this invoker serves.
    fn interface_name(&self) -> &str;

    /// The URL this invoker was created from (or, for a delegating
    /// invoker, the URL it currently presents).
    fn url(&self) -> &Url;

    /// Whether this invoker can currently accept calls.
    fn is_available(&self) -> bool;

    /// Dispatch one call.
    async fn invoke(&self, invocation: Invocation) -> RpcResult;

    /// Release any resources. Idempotent: destroying an already-destroyed
    /// invoker is a no-op. Propagates synchronously to children (a filter
    /// chain invoker destroys its terminal invoker; a directory destroys
    /// every per-provider invoker it holds).
    fn destroy(&self);
}
