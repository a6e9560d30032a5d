//! Provider Export Pipeline: turn a local invoker into a registered,
//! reconfigurable export.
//!
//! `originInvoker → overrideUrlWithConfig → doLocalExport (Protocol plug-in)
//! → register simplified URL → subscribe override listener → (on notify)
//! reExport`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fabric_core::{Invocation, Invoker, RpcResult, Url};
use parking_lot::{Mutex, RwLock};

use crate::config::{FailbackConfig, ProviderConfig};
use crate::configurator::{self, Configurator};
use crate::extension::ExtensionRegistry;
use crate::filter::{self, Filter, FilterSide};
use crate::protocol::{Protocol, ProtocolExporter};
use crate::registry::{NotifyListener, RegistryClient, RegistryFacade};
use crate::service_key::ServiceKey;
use crate::{Error, Result};

struct DelegatingInvoker {
    origin: Arc<dyn Invoker>,
    url: Url,
}

#[async_trait]
impl Invoker for DelegatingInvoker {
    fn interface_name(&self) -> &str {
        self.origin.interface_name()
    }
    fn url(&self) -> &Url {
        &self.url
    }
    fn is_available(&self) -> bool {
        self.origin.is_available()
    }
    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        self.origin.invoke(invocation).await
    }
    fn destroy(&self) {
        self.origin.destroy();
    }
}

/// Drop every `.`-prefixed key, the fixed infrastructure exclusion set, every
/// `qos.`-prefixed key, and — when the provider config declares an
/// allow-list — everything not on that list plus whatever extra keys the
/// registry URL names.
fn simplify(url: &Url, config: &ProviderConfig, registry_url: &Url) -> Url {
    let mut result = url.without_hidden_parameters();
    let qos_keys: Vec<String> = result
        .parameters()
        .keys()
        .filter(|k| k.starts_with("qos."))
        .cloned()
        .collect();
    let mut excluded: Vec<&str> = config.excluded_keys.iter().map(String::as_str).collect();
    excluded.extend(qos_keys.iter().map(String::as_str));
    result = result.without_parameters(&excluded);

    if !config.simplified_keys.is_empty() {
        let mut allow: std::collections::HashSet<String> = config.simplified_keys.iter().cloned().collect();
        if let Some(extra) = registry_url.parameter_opt("simplified.keys") {
            allow.extend(extra.split(',').filter(|s| !s.is_empty()).map(str::to_string));
        }
        let drop_keys: Vec<String> = result
            .parameters()
            .keys()
            .filter(|k| !allow.contains(k.as_str()))
            .cloned()
            .collect();
        let drop_refs: Vec<&str> = drop_keys.iter().map(String::as_str).collect();
        result = result.without_parameters(&drop_refs);
    }
    result
}

fn cache_key(provider_url: &Url) -> String {
    provider_url.without_parameters(&["dynamic", "enabled"]).to_string()
}

struct WrapperState {
    effective_url: Url,
    simplified_url: Url,
    registry_side_configurators: Vec<Configurator>,
    exporter: Arc<dyn ProtocolExporter>,
}

/// Bound to one cache key. Holds the current inner exporter plus
/// enough state to decide, on `reExport`, whether the simplified URL
/// changed and a full unregister/register is required.
struct ExporterChangeableWrapper {
    origin_provider_url: Url,
    registry_url: Url,
    service_key: ServiceKey,
    state: Mutex<WrapperState>,
}

impl ExporterChangeableWrapper {
    fn recompute_effective_url(&self, app_configurators: &[Configurator], service_configurators: &[Configurator]) -> Url {
        let registry_side = self.state.lock().registry_side_configurators.clone();
        let mut all = Vec::with_capacity(app_configurators.len() + service_configurators.len() + registry_side.len());
        all.extend(app_configurators.iter().cloned());
        all.extend(service_configurators.iter().cloned());
        all.extend(registry_side);
        configurator::apply_all(&self.origin_provider_url, &all)
    }
}

/// Callback seam for [`crate::config_listener`]: configuration listeners
/// call back into the pipeline that owns the affected exports rather than
/// reaching into `bounds` themselves.
#[async_trait]
pub trait OverrideSink: Send + Sync {
    async fn update_application_configurators(&self, configurators: Vec<Configurator>);
    async fn update_service_configurators(&self, service_key: &str, configurators: Vec<Configurator>);
}

struct OverrideListener {
    pipeline: Arc<ProviderExportPipeline>,
    cache_key: String,
}

#[async_trait]
impl NotifyListener for OverrideListener {
    async fn notify(&self, urls: Vec<Url>) {
        let registry_side: Vec<Configurator> = urls
            .into_iter()
            .filter(|u| u.protocol() != "empty" && configurator::is_configurator_url(u))
            .map(Configurator::new)
            .collect();
        self.pipeline.apply_registry_configurators(&self.cache_key, registry_side).await;
    }
}

/// A live export. `unexport` is idempotent: the second of two concurrent
/// calls observes `destroyed` already set and returns immediately.
pub struct ProviderExport {
    pipeline: Arc<ProviderExportPipeline>,
    cache_key: String,
    registry: Arc<RegistryFacade>,
    override_subscribe_url: Url,
    listener: Arc<dyn NotifyListener>,
    shutdown_timeout: Duration,
    destroyed: AtomicBool,
}

impl ProviderExport {
    /// Remove the bounds entry, unregister, unsubscribe, then (after an
    /// optional drain sleep run on a detached task so the caller is never
    /// blocked) release the inner transport export.
    pub async fn unexport(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some((_, wrapper)) = self.pipeline.bounds.remove(&self.cache_key) else {
            return;
        };
        let simplified = wrapper.state.lock().simplified_url.clone();
        let _ = self.registry.unregister(simplified).await;
        let _ = self.registry.unsubscribe(self.override_subscribe_url.clone(), Arc::clone(&self.listener)).await;

        let exporter = wrapper.state.lock().exporter.clone();
        let shutdown_timeout = self.shutdown_timeout;
        tokio::spawn(async move {
            if !shutdown_timeout.is_zero() {
                tokio::time::sleep(shutdown_timeout).await;
            }
            exporter.unexport().await;
        });
    }
}

/// Entry point: export a local invoker, register it, and keep it
/// reconciled against dynamic configuration for as long as the returned
/// [`ProviderExport`] lives.
pub struct ProviderExportPipeline {
    extensions: ExtensionRegistry,
    protocol: Arc<dyn Protocol>,
    registries: DashMap<Url, Arc<RegistryFacade>>,
    config: ProviderConfig,
    failback: FailbackConfig,
    bounds: DashMap<String, Arc<ExporterChangeableWrapper>>,
    app_configurators: RwLock<Vec<Configurator>>,
    service_configurators: DashMap<String, Vec<Configurator>>,
}

impl ProviderExportPipeline {
    #[must_use]
    pub fn new(extensions: ExtensionRegistry, protocol: Arc<dyn Protocol>, config: ProviderConfig) -> Arc<Self> {
        Self::with_failback(extensions, protocol, config, FailbackConfig::default())
    }

    #[must_use]
    pub fn with_failback(extensions: ExtensionRegistry, protocol: Arc<dyn Protocol>, config: ProviderConfig, failback: FailbackConfig) -> Arc<Self> {
        Arc::new(Self {
            extensions,
            protocol,
            registries: DashMap::new(),
            config,
            failback,
            bounds: DashMap::new(),
            app_configurators: RwLock::new(Vec::new()),
            service_configurators: DashMap::new(),
        })
    }

    /// `backend` names the registered [`RegistryClient`] (the provider
    /// URL's `registry` parameter); `registry_url` is the already-stripped
    /// URL used only as the cache key and as the client's own connection
    /// target, so resolution must not depend on a parameter scrubbed from it.
    fn registry_for(&self, backend: &str, registry_url: &Url) -> Result<Arc<RegistryFacade>> {
        if let Some(existing) = self.registries.get(registry_url) {
            return Ok(Arc::clone(existing.value()));
        }
        let client: Arc<dyn RegistryClient> = self.extensions.get_extension::<dyn RegistryClient>(backend)?;
        let facade = RegistryFacade::new(client, self.failback.clone());
        let entry = self.registries.entry(registry_url.clone()).or_insert_with(|| facade);
        Ok(Arc::clone(entry.value()))
    }

    /// `export(originInvoker)`. `origin.url()` carries the
    /// `registry` and `export` (percent-encoded provider URL) parameters,
    /// mirroring the consumer side's `refer` parameter convention.
    ///
    /// # Errors
    /// [`Error::InvalidUrl`] if `export` is missing or malformed;
    /// [`Error::ProtocolExportFailed`] if the transport cannot bind;
    /// [`Error::RegistryUnavailable`]/[`Error::SubscribeFailed`] for
    /// non-retryable registry failures.
    pub async fn export(self: &Arc<Self>, origin: Arc<dyn Invoker>) -> Result<ProviderExport> {
        let origin_url = origin.url().clone();
        let backend = origin_url.parameter("registry", "mock").to_string();
        let registry_url = origin_url.with_protocol(backend.clone()).without_parameters(&["registry", "export"]);

        let raw_provider_url = origin_url.parameter_opt("export").ok_or_else(|| {
            Error::InvalidUrl("export() requires an `export` parameter naming the provider URL".to_string())
        })?;
        let provider_url = Url::parse(raw_provider_url)?;

        let registry = self.registry_for(&backend, &registry_url)?;
        let service_key = ServiceKey::from_url(&provider_url);

        let app_configurators = self.app_configurators.read().clone();
        let service_configurators = self
            .service_configurators
            .get(&service_key.to_string())
            .map(|v| v.value().clone())
            .unwrap_or_default();
        let mut all_configurators = app_configurators;
        all_configurators.extend(service_configurators);
        let effective_url = configurator::apply_all(&provider_url, &all_configurators);

        let key = cache_key(&effective_url);
        let wrapper = match self.bounds.get(&key) {
            Some(existing) => Arc::clone(existing.value()),
            None => {
                let delegating: Arc<dyn Invoker> = Arc::new(DelegatingInvoker { origin: Arc::clone(&origin), url: effective_url.clone() });
                let filters = self
                    .extensions
                    .get_activate_extension::<dyn Filter>(&effective_url, &[], Some(FilterSide::Provider.as_str()))
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "provider export: failed to resolve activated filters");
                        Vec::new()
                    });
                let chained = filter::build_chain(delegating, filters);
                let exporter = self.protocol.export(chained).await?;

                let simplified_url = simplify(&effective_url, &self.config, &registry_url);
                let wrapper = Arc::new(ExporterChangeableWrapper {
                    origin_provider_url: provider_url.clone(),
                    registry_url: registry_url.clone(),
                    service_key: service_key.clone(),
                    state: Mutex::new(WrapperState {
                        effective_url: effective_url.clone(),
                        simplified_url,
                        registry_side_configurators: Vec::new(),
                        exporter,
                    }),
                });
                let entry = self.bounds.entry(key.clone()).or_insert_with(|| wrapper);
                Arc::clone(entry.value())
            }
        };

        let simplified_url = wrapper.state.lock().simplified_url.clone();
        if effective_url.parameter_bool("register", true) {
            registry.register(simplified_url).await?;
        }

        let override_subscribe_url = provider_url
            .with_protocol("provider")
            .with_parameter("category", "configurators")
            .with_parameter("check", "false");
        let listener: Arc<dyn NotifyListener> = Arc::new(OverrideListener { pipeline: Arc::clone(self), cache_key: key.clone() });
        registry.subscribe(override_subscribe_url.clone(), Arc::clone(&listener)).await?;

        Ok(ProviderExport {
            pipeline: Arc::clone(self),
            cache_key: key,
            registry,
            override_subscribe_url,
            listener,
            shutdown_timeout: self.config.shutdown_timeout,
            destroyed: AtomicBool::new(false),
        })
    }

    async fn reexport(&self, wrapper: &Arc<ExporterChangeableWrapper>, new_effective_url: Url) {
        let new_simplified = simplify(&new_effective_url, &self.config, &wrapper.registry_url);
        let registry = match self.registry_for(wrapper.registry_url.protocol(), &wrapper.registry_url) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "provider reExport: registry unavailable");
                return;
            }
        };

        let previous_simplified = wrapper.state.lock().simplified_url.clone();
        if previous_simplified != new_simplified {
            let _ = registry.unregister(previous_simplified).await;
            if let Err(e) = registry.register(new_simplified.clone()).await {
                tracing::error!(error = %e, "provider reExport: register failed");
                return;
            }
        }

        let delegating: Arc<dyn Invoker> = Arc::new(DelegatingInvoker {
            origin: wrapper_origin_invoker(wrapper),
            url: new_effective_url.clone(),
        });
        let filters = self
            .extensions
            .get_activate_extension::<dyn Filter>(&new_effective_url, &[], Some(FilterSide::Provider.as_str()))
            .unwrap_or_default();
        let chained = filter::build_chain(delegating, filters);
        let new_exporter = match self.protocol.export(chained).await {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(error = %e, "provider reExport: local export failed");
                return;
            }
        };

        let old_exporter = {
            let mut state = wrapper.state.lock();
            state.effective_url = new_effective_url;
            state.simplified_url = new_simplified;
            std::mem::replace(&mut state.exporter, new_exporter)
        };
        old_exporter.unexport().await;
    }

    async fn apply_registry_configurators(&self, key: &str, configurators: Vec<Configurator>) {
        let Some(wrapper) = self.bounds.get(key).map(|e| Arc::clone(e.value())) else {
            return;
        };
        wrapper.state.lock().registry_side_configurators = configurators;
        self.recompute_and_maybe_reexport(&wrapper).await;
    }

    async fn recompute_and_maybe_reexport(&self, wrapper: &Arc<ExporterChangeableWrapper>) {
        let app_configurators = self.app_configurators.read().clone();
        let service_configurators = self
            .service_configurators
            .get(&wrapper.service_key.to_string())
            .map(|v| v.value().clone())
            .unwrap_or_default();
        let new_effective = wrapper.recompute_effective_url(&app_configurators, &service_configurators);
        let current_effective = wrapper.state.lock().effective_url.clone();
        if new_effective != current_effective {
            self.reexport(wrapper, new_effective).await;
        }
    }
}

/// `reExport` needs the original, un-wrapped invoker to rebuild the
/// delegating/filter chain around the new effective URL — recovered from
/// the currently-exported chain's terminal invoker via the `ProtocolExporter`.
fn wrapper_origin_invoker(wrapper: &Arc<ExporterChangeableWrapper>) -> Arc<dyn Invoker> {
    wrapper.state.lock().exporter.invoker()
}

#[async_trait]
impl OverrideSink for ProviderExportPipeline {
    async fn update_application_configurators(&self, configurators: Vec<Configurator>) {
        *self.app_configurators.write() = configurators;
        let wrappers: Vec<Arc<ExporterChangeableWrapper>> = self.bounds.iter().map(|e| Arc::clone(e.value())).collect();
        for wrapper in wrappers {
            self.recompute_and_maybe_reexport(&wrapper).await;
        }
    }

    async fn update_service_configurators(&self, service_key: &str, configurators: Vec<Configurator>) {
        self.service_configurators.insert(service_key.to_string(), configurators);
        let matching: Vec<Arc<ExporterChangeableWrapper>> = self
            .bounds
            .iter()
            .filter(|e| e.value().service_key.to_string() == service_key)
            .map(|e| Arc::clone(e.value()))
            .collect();
        for wrapper in matching {
            self.recompute_and_maybe_reexport(&wrapper).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LocalProtocol;
    use crate::registry::mock::MockRegistry;
    use fabric_core::CallError;

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
        async fn invoke(&self, invocation: Invocation) -> RpcResult {
            RpcResult::completed_ok(serde_json::json!(invocation.method_name()))
        }
        fn destroy(&self) {}
    }

    fn test_pipeline() -> (Arc<ProviderExportPipeline>, Arc<MockRegistry>) {
        let registry = Arc::new(MockRegistry::new());
        let extensions = ExtensionRegistry::default();
        extensions.register::<dyn RegistryClient, _>("mock", {
            let registry = Arc::clone(&registry);
            move |_| Ok(Arc::clone(&registry) as Arc<dyn RegistryClient>)
        });
        let protocol = Arc::new(LocalProtocol::new());
        let pipeline = ProviderExportPipeline::new(extensions, protocol, ProviderConfig::default());
        (pipeline, registry)
    }

    fn origin_url() -> Url {
        Url::parse(
            "registry://r:2181/RegistryService?registry=mock&export=dubbo%3A%2F%2F10.0.0.1%3A20880%2Fcom.example.Car%3Fapplication%3Da%26.hidden%3Dz",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn export_registers_a_simplified_url_without_hidden_parameters() {
        let (pipeline, registry) = test_pipeline();
        let origin: Arc<dyn Invoker> = Arc::new(EchoInvoker(origin_url()));
        let export = pipeline.export(origin).await.unwrap();

        let registered = registry.registered_urls();
        assert_eq!(registered.len(), 1);
        assert!(registered[0].parameter_opt(".hidden").is_none());
        assert!(registered[0].parameter_opt("bind.ip").is_none());
        assert_eq!(registered[0].parameter_opt("application"), Some("a"));

        export.unexport().await;
    }

    #[tokio::test]
    async fn override_configurator_triggers_reexport_without_register_churn() {
        let (pipeline, registry) = test_pipeline();
        let origin: Arc<dyn Invoker> = Arc::new(EchoInvoker(origin_url()));
        let export = pipeline.export(origin).await.unwrap();

        let before = registry.registered_urls();
        assert_eq!(before.len(), 1);

        let override_url = Url::parse("provider://10.0.0.1:20880/com.example.Car?category=configurators&timeout=5000").unwrap();
        registry.register(override_url).await.unwrap();

        let after = registry.registered_urls();
        // the export's own registered (simplified) URL is untouched: a pure
        // timeout override never changes the identity the registry sees
        assert_eq!(after.len(), 2);
        assert!(after.contains(&before[0]));

        export.unexport().await;
    }

    #[tokio::test]
    async fn unexport_is_idempotent_under_concurrent_callers() {
        let (pipeline, _registry) = test_pipeline();
        let origin: Arc<dyn Invoker> = Arc::new(EchoInvoker(origin_url()));
        let export = Arc::new(pipeline.export(origin).await.unwrap());

        let a = Arc::clone(&export);
        let b = Arc::clone(&export);
        tokio::join!(a.unexport(), b.unexport());
    }

    #[tokio::test]
    async fn no_providers_error_variant_is_reachable_from_call_error() {
        let err = CallError::NoProviders("com.example.Car".to_string());
        assert!(matches!(crate::Error::from(err), crate::Error::NoProvidersAvailable(_)));
    }
}
