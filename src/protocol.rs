//! The transport-level Protocol plug-in.
//!
//! The wire codec and transport are external collaborators. [`Protocol`] is
//! the seam the Provider Export Pipeline and Consumer Refer Pipeline call
//! through — `export` turns a local invoker into something reachable,
//! `refer` turns a provider URL into a callable invoker. [`LocalProtocol`]
//! is the in-process stand-in used by the demonstration binary and the
//! end-to-end tests, the same role [`crate::registry::mock::MockRegistry`]
//! plays for the Registry Facade.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fabric_core::{Invoker, Url};

use crate::{Error, Result};

/// Ownership token for a live local export. `unexport` releases the
/// underlying invoker; idempotent, matching [`crate::Error`]'s
/// no-throw-on-unexport policy (callers still see `Result` here because a
/// production transport's unbind can fail, but [`LocalProtocol`]'s never
/// does).
#[async_trait]
pub trait ProtocolExporter: Send + Sync {
    /// The invoker this exporter wraps.
    fn invoker(&self) -> Arc<dyn Invoker>;
    /// Release the export. Idempotent.
    async fn unexport(&self);
}

/// The transport-level plug-in a `Protocol` URL scheme resolves to via the
/// Extension Registry's adaptive dispatch (see [`crate::extension`]).
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Export `invoker` so that a peer holding the same URL can reach it
    /// via [`Protocol::refer`].
    ///
    /// # Errors
    /// [`Error::ProtocolExportFailed`] if the transport cannot bind.
    async fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn ProtocolExporter>>;

    /// Resolve `url` (as published by a provider's export) into a callable
    /// invoker for `interface`.
    ///
    /// # Errors
    /// [`Error::ProtocolExportFailed`] if no export is reachable at `url`.
    async fn refer(&self, interface: &str, url: Url) -> Result<Arc<dyn Invoker>>;
}

struct LocalExporter {
    invoker: Arc<dyn Invoker>,
    key: String,
    table: Arc<DashMap<String, Arc<dyn Invoker>>>,
}

#[async_trait]
impl ProtocolExporter for LocalExporter {
    fn invoker(&self) -> Arc<dyn Invoker> {
        Arc::clone(&self.invoker)
    }

    async fn unexport(&self) {
        self.table.remove(&self.key);
        self.invoker.destroy();
    }
}

/// In-process loopback `Protocol`: `export` publishes the invoker into a
/// shared table keyed by `host:port/path`; `refer` looks it up directly,
/// with no serialization and no network round-trip. This is the "mock
/// transport" analogue of [`crate::registry::mock::MockRegistry`] — it
/// lets the provider/consumer pipelines be exercised end-to-end in a
/// single process.
#[derive(Default)]
pub struct LocalProtocol {
    exports: Arc<DashMap<String, Arc<dyn Invoker>>>,
}

impl LocalProtocol {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cache_key(url: &Url) -> String {
        format!("{}/{}", url.address(), url.path())
    }
}

#[async_trait]
impl Protocol for LocalProtocol {
    async fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn ProtocolExporter>> {
        let key = Self::cache_key(invoker.url());
        self.exports.insert(key.clone(), Arc::clone(&invoker));
        Ok(Arc::new(LocalExporter {
            invoker,
            key,
            table: Arc::clone(&self.exports),
        }))
    }

    async fn refer(&self, interface: &str, url: Url) -> Result<Arc<dyn Invoker>> {
        let key = Self::cache_key(&url);
        self.exports
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                Error::ProtocolExportFailed(format!("no local export reachable at {url} for {interface}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fabric_core::{CallError, Invocation, RpcResult};

    struct EchoInvoker {
        url: Url,
    }

    #[async_trait]
    impl Invoker for EchoInvoker {
        fn interface_name(&self) -> &str {
            "test.Echo"
        }
        fn url(&self) -> &Url {
            &self.url
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn invoke(&self, invocation: Invocation) -> RpcResult {
            RpcResult::completed_ok(serde_json::json!(invocation.method_name()))
        }
        fn destroy(&self) {}
    }

    #[tokio::test]
    async fn export_then_refer_round_trips_to_the_same_invoker() {
        let protocol = LocalProtocol::new();
        let url = Url::parse("dubbo://10.0.0.1:20880/test.Echo").unwrap();
        let invoker: Arc<dyn Invoker> = Arc::new(EchoInvoker { url: url.clone() });

        let exporter = protocol.export(Arc::clone(&invoker)).await.unwrap();
        let referred = protocol.refer("test.Echo", url).await.unwrap();

        let result = referred.invoke(Invocation::new("ping", vec![])).await;
        assert_eq!(result.value().await.unwrap(), serde_json::json!("ping"));

        exporter.unexport().await;
    }

    #[tokio::test]
    async fn refer_without_export_fails() {
        let protocol = LocalProtocol::new();
        let err = protocol
            .refer("test.Echo", Url::parse("dubbo://h:1/test.Echo").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolExportFailed(_)));
    }

    #[tokio::test]
    async fn unexport_removes_the_entry() {
        let protocol = LocalProtocol::new();
        let url = Url::parse("dubbo://h:1/test.Echo").unwrap();
        let invoker: Arc<dyn Invoker> = Arc::new(EchoInvoker { url: url.clone() });
        let exporter = protocol.export(Arc::clone(&invoker)).await.unwrap();
        exporter.unexport().await;
        assert!(protocol.refer("test.Echo", url).await.is_err());
    }
}
