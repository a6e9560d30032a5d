//! Consumer Refer Pipeline: build a dynamic directory of providers,
//! compose a router chain, join via a cluster strategy, and hand back the
//! user-visible consumer invoker.
//!
//! `refer(interfaceType, url) → RegistryDirectory → subscribe(providers,
//! configurators, routers) → Router chain → Cluster.join → consumer
//! invoker`.

pub mod cluster;
pub mod loadbalance;
pub mod router;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fabric_core::{Invocation, Invoker, Url};
use parking_lot::{Mutex, RwLock};

use crate::config::{ConsumerConfig, FailbackConfig};
use crate::configurator::{self, Configurator};
use crate::extension::ExtensionRegistry;
use crate::filter::{self, Filter, FilterSide};
use crate::protocol::Protocol;
use crate::registry::{NotifyListener, RegistryClient, RegistryFacade};
use crate::Result;

/// The consumer-side authoritative candidate set for one service
/// reference. `route` is called fresh on every invocation
/// so router/load-balance decisions always see the latest snapshot.
pub trait Directory: Send + Sync {
    fn interface_name(&self) -> &str;
    fn url(&self) -> &Url;
    fn is_available(&self) -> bool;
    /// Run the router chain against the current snapshot for one call.
    fn route(&self, invocation: &Invocation) -> Vec<Arc<dyn Invoker>>;
    /// Propagates synchronously to every per-provider invoker currently held.
    fn destroy(&self);
}

struct ProviderEntry {
    /// The provider URL as delivered by the registry, before configurator
    /// overrides — the identity used to diff additions/removals.
    raw_url: Url,
    invoker: Arc<dyn Invoker>,
}

/// Registry-subscription-driven [`Directory`] implementation. Registry
/// notifications are the producer; per-call `route` reads a copy-on-write
/// snapshot so calls never see a partially updated list.
pub struct RegistryDirectory {
    interface: String,
    subscribe_url: Url,
    protocol: Arc<dyn Protocol>,
    extensions: ExtensionRegistry,
    invokers: RwLock<Arc<Vec<ProviderEntry>>>,
    configurators: Mutex<Vec<Configurator>>,
    routers: Mutex<router::RouterChain>,
    destroyed: AtomicBool,
}

impl RegistryDirectory {
    fn new(interface: String, subscribe_url: Url, protocol: Arc<dyn Protocol>, extensions: ExtensionRegistry) -> Arc<Self> {
        Arc::new(Self {
            interface,
            subscribe_url,
            protocol,
            extensions,
            invokers: RwLock::new(Arc::new(Vec::new())),
            configurators: Mutex::new(Vec::new()),
            routers: Mutex::new(router::RouterChain::with_builtins()),
            destroyed: AtomicBool::new(false),
        })
    }

    fn snapshot(&self) -> Arc<Vec<ProviderEntry>> {
        Arc::clone(&self.invokers.read())
    }

    async fn rebuild_providers(&self, raw_urls: &[Url]) {
        let configurators = self.configurators.lock().clone();
        let previous = self.snapshot();

        let mut next: Vec<ProviderEntry> = Vec::with_capacity(raw_urls.len());
        for raw_url in raw_urls {
            let effective = configurator::apply_all(raw_url, &configurators);
            if let Some(existing) = previous.iter().find(|e| &e.raw_url == raw_url) {
                // Reuse outright when the effective URL hasn't changed —
                // the consumer-side analogue of reExport's no-op-on-equal
                // simplified URL.
                if existing.invoker.url() == &effective {
                    next.push(ProviderEntry { raw_url: raw_url.clone(), invoker: Arc::clone(&existing.invoker) });
                    continue;
                }
                existing.invoker.destroy();
            }

            match self.protocol.refer(&self.interface, effective.clone()).await {
                Ok(terminal) => {
                    let filters = self
                        .extensions
                        .get_activate_extension::<dyn Filter>(&effective, &[], Some(FilterSide::Consumer.as_str()))
                        .unwrap_or_else(|e| {
                            tracing::warn!(error = %e, "consumer refer: failed to resolve activated filters");
                            Vec::new()
                        });
                    let invoker = filter::build_chain(terminal, filters);
                    next.push(ProviderEntry { raw_url: raw_url.clone(), invoker });
                }
                Err(e) => {
                    tracing::warn!(url = %effective, error = %e, "consumer refer: failed to create provider invoker");
                }
            }
        }

        for old in previous.iter() {
            if !raw_urls.contains(&old.raw_url) {
                old.invoker.destroy();
            }
        }

        *self.invokers.write() = Arc::new(next);
    }

    fn rebuild_routers(&self, router_urls: &[Url]) {
        let mut chain = router::RouterChain::with_builtins();
        for url in router_urls {
            if url.parameter_bool("force", false) {
                chain.push(Arc::new(router::TagRouter));
            }
        }
        *self.routers.lock() = chain;
    }
}

impl Directory for RegistryDirectory {
    fn interface_name(&self) -> &str {
        &self.interface
    }

    fn url(&self) -> &Url {
        &self.subscribe_url
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::Acquire) && !self.snapshot().is_empty()
    }

    fn route(&self, invocation: &Invocation) -> Vec<Arc<dyn Invoker>> {
        let snapshot = self.snapshot();
        let invokers: Vec<Arc<dyn Invoker>> = snapshot.iter().map(|e| Arc::clone(&e.invoker)).collect();
        self.routers.lock().route(&invokers, &self.subscribe_url, invocation)
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        for entry in self.snapshot().iter() {
            entry.invoker.destroy();
        }
        *self.invokers.write() = Arc::new(Vec::new());
    }
}

#[async_trait]
impl NotifyListener for RegistryDirectory {
    /// `urls` is the full current set across every subscribed category:
    /// partition it, then replace each of the three pieces
    /// of directory state wholesale — there is no delta to apply.
    async fn notify(&self, urls: Vec<Url>) {
        let mut providers = Vec::new();
        let mut configurator_urls = Vec::new();
        let mut router_urls = Vec::new();

        for url in urls {
            if url.protocol() == "empty" {
                continue;
            }
            match url.parameter("category", "providers") {
                "configurators" if configurator::is_configurator_url(&url) => configurator_urls.push(url),
                "routers" => router_urls.push(url),
                _ => providers.push(url),
            }
        }

        *self.configurators.lock() = configurator_urls.into_iter().map(Configurator::new).collect();
        self.rebuild_routers(&router_urls);
        self.rebuild_providers(&providers).await;
    }
}

/// Entry point: build the directory, router chain, and cluster invoker for
/// one service reference.
pub struct ConsumerReferPipeline {
    extensions: ExtensionRegistry,
    protocol: Arc<dyn Protocol>,
    registries: DashMap<Url, Arc<RegistryFacade>>,
    config: ConsumerConfig,
    failback: FailbackConfig,
}

impl ConsumerReferPipeline {
    #[must_use]
    pub fn new(extensions: ExtensionRegistry, protocol: Arc<dyn Protocol>, config: ConsumerConfig) -> Self {
        Self::with_failback(extensions, protocol, config, FailbackConfig::default())
    }

    #[must_use]
    pub fn with_failback(extensions: ExtensionRegistry, protocol: Arc<dyn Protocol>, config: ConsumerConfig, failback: FailbackConfig) -> Self {
        Self {
            extensions,
            protocol,
            registries: DashMap::new(),
            config,
            failback,
        }
    }

    /// `backend` names the registered [`RegistryClient`] (the refer URL's
    /// `registry` parameter); `registry_url` is the already-stripped URL
    /// used only as the cache key and the client's own connection target,
    /// so resolution must not depend on a parameter scrubbed from it.
    fn registry_for(&self, backend: &str, registry_url: &Url) -> Result<Arc<RegistryFacade>> {
        if let Some(existing) = self.registries.get(registry_url) {
            return Ok(Arc::clone(existing.value()));
        }
        let client: Arc<dyn RegistryClient> = self.extensions.get_extension::<dyn RegistryClient>(backend)?;
        let facade = RegistryFacade::new(client, self.failback.clone());
        let entry = self.registries.entry(registry_url.clone()).or_insert_with(|| facade);
        Ok(Arc::clone(entry.value()))
    }

    /// `refer(interfaceType, url)`.
    ///
    /// # Errors
    /// [`crate::Error::RegistryUnavailable`] or [`crate::Error::SubscribeFailed`]
    /// for non-retryable registry failures; [`crate::Error::ExtensionNotFound`]
    /// if the `registry` parameter names an unregistered backend.
    pub async fn refer(&self, interface: &str, url: Url) -> Result<Arc<dyn Invoker>> {
        let backend = url.parameter("registry", "mock").to_string();
        let registry_url = url.with_protocol(backend.clone()).without_parameters(&["registry"]);
        let registry = self.registry_for(&backend, &registry_url)?;

        let refer_map = parse_refer_params(url.parameter("refer", ""));
        let group = refer_map.get("group").map(String::as_str).unwrap_or("");
        let cluster_name = if cluster::group_forces_mergeable(group) {
            "mergeable".to_string()
        } else {
            refer_map.get("cluster").cloned().unwrap_or_else(|| self.config.cluster.clone())
        };
        let loadbalance_name = refer_map
            .get("loadbalance")
            .cloned()
            .unwrap_or_else(|| self.config.loadbalance.clone());

        let consumer_host = refer_map.get("register.ip").cloned().unwrap_or_else(|| "0.0.0.0".to_string());
        let mut subscribe_builder = Url::builder("consumer", consumer_host).path(interface.to_string());
        for (k, v) in &refer_map {
            subscribe_builder = subscribe_builder.parameter(k.clone(), v.clone());
        }
        let subscribe_url = subscribe_builder.build();

        let directory = RegistryDirectory::new(interface.to_string(), subscribe_url.clone(), Arc::clone(&self.protocol), self.extensions.clone());

        let simplified_consumer_url = subscribe_url
            .without_hidden_parameters()
            .with_parameter("category", "consumers")
            .with_parameter("check", "false");
        registry.register(simplified_consumer_url).await?;

        let compound_subscribe = subscribe_url.with_parameter("category", "providers,configurators,routers");
        registry.subscribe(compound_subscribe, Arc::clone(&directory) as Arc<dyn NotifyListener>).await?;

        let loadbalance = loadbalance::by_name(&loadbalance_name);
        let cluster_strategy = cluster::by_name(&cluster_name, self.config.retries);
        Ok(cluster_strategy.join(directory, loadbalance))
    }
}

fn parse_refer_params(refer: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if refer.is_empty() {
        return map;
    }
    for pair in refer.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            map.insert(k.to_string(), v.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LocalProtocol;
    use crate::registry::mock::MockRegistry;

    struct EchoInvoker(Url);

    #[async_trait]
    impl Invoker for EchoInvoker {
        fn interface_name(&self) -> &str {
            "com.example.Car"
        }
        fn url(&self) -> &Url {
            &self.0
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn invoke(&self, invocation: Invocation) -> fabric_core::RpcResult {
            fabric_core::RpcResult::completed_ok(serde_json::json!(invocation.method_name()))
        }
        fn destroy(&self) {}
    }

    #[tokio::test]
    async fn refer_with_no_providers_is_unavailable_and_fails_calls() {
        let extensions = ExtensionRegistry::default();
        extensions.register::<dyn RegistryClient, _>("mock", |_| Ok(Arc::new(MockRegistry::new()) as Arc<dyn RegistryClient>));
        let protocol = Arc::new(LocalProtocol::new());
        let pipeline = ConsumerReferPipeline::new(extensions, protocol, ConsumerConfig::default());

        let url = Url::parse("registry://r:2181/RegistryService?registry=mock&refer=interface%3Dcom.example.Car").unwrap();
        let invoker = pipeline.refer("com.example.Car", url).await.unwrap();

        assert!(!invoker.is_available());
        let result = invoker.invoke(Invocation::new("m", vec![])).await;
        assert!(matches!(result.value().await, Err(fabric_core::CallError::NoProviders(_))));
    }

    #[tokio::test]
    async fn refer_picks_up_a_provider_registered_before_subscribe() {
        let registry = Arc::new(MockRegistry::new());
        let extensions = ExtensionRegistry::default();
        extensions.register::<dyn RegistryClient, _>("mock", {
            let registry = Arc::clone(&registry);
            move |_| Ok(Arc::clone(&registry) as Arc<dyn RegistryClient>)
        });

        let protocol = Arc::new(LocalProtocol::new());
        let provider_url = Url::parse("dubbo://10.0.0.1:20880/com.example.Car?category=providers").unwrap();
        let terminal: Arc<dyn Invoker> = Arc::new(EchoInvoker(provider_url.clone()));
        let _exporter = protocol.export(terminal).await.unwrap();
        registry.register(provider_url).await.unwrap();

        let pipeline = ConsumerReferPipeline::new(extensions, protocol, ConsumerConfig::default());
        let url = Url::parse("registry://r:2181/RegistryService?registry=mock&refer=interface%3Dcom.example.Car").unwrap();
        let invoker = pipeline.refer("com.example.Car", url).await.unwrap();

        assert!(invoker.is_available());
        let result = invoker.invoke(Invocation::new("ping", vec![])).await;
        assert_eq!(result.value().await.unwrap(), serde_json::json!("ping"));
    }
}
