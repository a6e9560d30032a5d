//! Cluster strategies: fold a [`Directory`] into a single user-visible
//! consumer invoker. Selected by the `cluster` URL parameter,
//! except `mergeable`, which is forced whenever the `group` refer parameter
//! contains `,` or `*`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fabric_core::{CallError, Invocation, Invoker, RpcResult, Url};
use futures::future::join_all;

use super::loadbalance::LoadBalance;
use super::Directory;

/// Folds a directory into one invoker. Implementations must consult the
/// directory fresh on every call (never cache the invoker list) so routing
/// stays correct across registry updates.
pub trait Cluster: Send + Sync {
    /// Produce the user-visible consumer invoker for `directory`.
    fn join(&self, directory: Arc<dyn Directory>, loadbalance: Arc<dyn LoadBalance>) -> Arc<dyn Invoker>;
}

fn no_providers_result(interface: &str) -> RpcResult {
    RpcResult::completed_err(CallError::NoProviders(interface.to_string()))
}

struct ActiveGuard {
    loadbalance: Arc<dyn LoadBalance>,
    key: String,
}

impl ActiveGuard {
    fn begin(loadbalance: Arc<dyn LoadBalance>, key: String) -> Self {
        loadbalance.note_active_delta(&key, 1);
        Self { loadbalance, key }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.loadbalance.note_active_delta(&self.key, -1);
    }
}

/// Retries on remote error against up to `max_retries` further invokers
/// from the same routed set, excluding any already tried. Matches
/// end-to-end scenario (d): two providers, the first throws a remote
/// error, the second succeeds, and exactly two underlying `invoke` calls
/// are observed.
pub struct FailoverCluster {
    pub max_retries: u32,
}

struct FailoverInvoker {
    directory: Arc<dyn Directory>,
    loadbalance: Arc<dyn LoadBalance>,
    max_retries: u32,
}

#[async_trait]
impl Invoker for FailoverInvoker {
    fn interface_name(&self) -> &str {
        self.directory.interface_name()
    }

    fn url(&self) -> &Url {
        self.directory.url()
    }

    fn is_available(&self) -> bool {
        self.directory.is_available()
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        let candidates = self.directory.route(&invocation);
        if candidates.is_empty() {
            return no_providers_result(self.directory.interface_name());
        }

        let mut tried: HashSet<String> = HashSet::new();
        let attempts = (self.max_retries as usize) + 1;
        let mut last = no_providers_result(self.directory.interface_name());

        for _ in 0..attempts {
            let remaining: Vec<_> = candidates
                .iter()
                .filter(|inv| !tried.contains(&inv.url().to_string()))
                .cloned()
                .collect();
            let Some(picked) = self.loadbalance.select(&remaining, &invocation) else {
                break;
            };
            let key = picked.url().to_string();
            tried.insert(key.clone());

            let _guard = ActiveGuard::begin(Arc::clone(&self.loadbalance), key);
            let result = picked.invoke(invocation.clone()).await;
            match result.value().await {
                Ok(value) => return RpcResult::completed_ok(value),
                Err(CallError::Remote(msg)) => {
                    last = RpcResult::completed_err(CallError::Remote(msg));
                }
                Err(other) => return RpcResult::completed_err(other),
            }
        }
        last
    }

    fn destroy(&self) {
        self.directory.destroy();
    }
}

impl Cluster for FailoverCluster {
    fn join(&self, directory: Arc<dyn Directory>, loadbalance: Arc<dyn LoadBalance>) -> Arc<dyn Invoker> {
        Arc::new(FailoverInvoker {
            directory,
            loadbalance,
            max_retries: self.max_retries,
        })
    }
}

/// Calls exactly one invoker; any error (remote or no-providers) is
/// returned immediately with no retry.
#[derive(Default)]
pub struct FailfastCluster;

struct FailfastInvoker {
    directory: Arc<dyn Directory>,
    loadbalance: Arc<dyn LoadBalance>,
}

#[async_trait]
impl Invoker for FailfastInvoker {
    fn interface_name(&self) -> &str {
        self.directory.interface_name()
    }

    fn url(&self) -> &Url {
        self.directory.url()
    }

    fn is_available(&self) -> bool {
        self.directory.is_available()
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        let candidates = self.directory.route(&invocation);
        let Some(picked) = self.loadbalance.select(&candidates, &invocation) else {
            return no_providers_result(self.directory.interface_name());
        };
        let key = picked.url().to_string();
        let _guard = ActiveGuard::begin(Arc::clone(&self.loadbalance), key);
        picked.invoke(invocation).await
    }

    fn destroy(&self) {
        self.directory.destroy();
    }
}

impl Cluster for FailfastCluster {
    fn join(&self, directory: Arc<dyn Directory>, loadbalance: Arc<dyn LoadBalance>) -> Arc<dyn Invoker> {
        Arc::new(FailfastInvoker { directory, loadbalance })
    }
}

/// Selected when the refer `group` parameter contains `,` or `*`: calls one
/// invoker per distinct `group` parameter value among the routed set,
/// concurrently, and merges the successful results into a JSON array.
/// Invokers lacking a `group` parameter fall into a single unnamed group.
#[derive(Default)]
pub struct MergeableCluster;

struct MergeableInvoker {
    directory: Arc<dyn Directory>,
    loadbalance: Arc<dyn LoadBalance>,
}

#[async_trait]
impl Invoker for MergeableInvoker {
    fn interface_name(&self) -> &str {
        self.directory.interface_name()
    }

    fn url(&self) -> &Url {
        self.directory.url()
    }

    fn is_available(&self) -> bool {
        self.directory.is_available()
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        let candidates = self.directory.route(&invocation);
        if candidates.is_empty() {
            return no_providers_result(self.directory.interface_name());
        }

        let mut by_group: std::collections::BTreeMap<String, Vec<Arc<dyn Invoker>>> = std::collections::BTreeMap::new();
        for inv in &candidates {
            by_group.entry(inv.url().parameter("group", "").to_string()).or_default().push(Arc::clone(inv));
        }

        let calls = by_group.into_values().map(|group_invokers| {
            let picked = self.loadbalance.select(&group_invokers, &invocation);
            let invocation = invocation.clone();
            async move {
                match picked {
                    Some(inv) => inv.invoke(invocation).await.value().await.ok(),
                    None => None,
                }
            }
        });

        let results: Vec<serde_json::Value> = join_all(calls).await.into_iter().flatten().collect();
        if results.is_empty() {
            return no_providers_result(self.directory.interface_name());
        }
        RpcResult::completed_ok(serde_json::Value::Array(results))
    }

    fn destroy(&self) {
        self.directory.destroy();
    }
}

impl Cluster for MergeableCluster {
    fn join(&self, directory: Arc<dyn Directory>, loadbalance: Arc<dyn LoadBalance>) -> Arc<dyn Invoker> {
        Arc::new(MergeableInvoker { directory, loadbalance })
    }
}

/// Resolve a cluster strategy by name, defaulting to `failover` for an
/// unrecognized name.
#[must_use]
pub fn by_name(name: &str, max_retries: u32) -> Arc<dyn Cluster> {
    match name {
        "failfast" => Arc::new(FailfastCluster),
        "mergeable" => Arc::new(MergeableCluster),
        _ => Arc::new(FailoverCluster { max_retries }),
    }
}

/// Whether the refer `group` parameter forces the `mergeable` cluster,
/// independent of the configured/requested `cluster` name.
#[must_use]
pub fn group_forces_mergeable(group: &str) -> bool {
    group.contains(',') || group.contains('*')
}
