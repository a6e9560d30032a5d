//! End-to-end tests across the provider export and consumer refer
//! pipelines, wired together over the in-memory `MockRegistry` and
//! `LocalProtocol` stand-ins (the out-of-scope naming-service client and
//! transport, per spec).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fabric_core::{CallError, Invocation, Invoker, RpcResult, Url};

use fabric_rpc::config::{ConsumerConfig, ProviderConfig};
use fabric_rpc::consumer::ConsumerReferPipeline;
use fabric_rpc::extension::ExtensionRegistry;
use fabric_rpc::protocol::{LocalProtocol, Protocol};
use fabric_rpc::provider::ProviderExportPipeline;
use fabric_rpc::registry::mock::MockRegistry;
use fabric_rpc::registry::RegistryClient;

struct EchoInvoker {
    url: Url,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Invoker for EchoInvoker {
    fn interface_name(&self) -> &str {
        "com.example.Car"
    }
    fn url(&self) -> &Url {
        &self.url
    }
    fn is_available(&self) -> bool {
        true
    }
    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        RpcResult::completed_ok(serde_json::json!(invocation.method_name()))
    }
    fn destroy(&self) {}
}

struct FailingInvoker {
    url: Url,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Invoker for FailingInvoker {
    fn interface_name(&self) -> &str {
        "com.example.Car"
    }
    fn url(&self) -> &Url {
        &self.url
    }
    fn is_available(&self) -> bool {
        true
    }
    async fn invoke(&self, _invocation: Invocation) -> RpcResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        RpcResult::completed_err(CallError::Remote("backend unreachable".to_string()))
    }
    fn destroy(&self) {}
}

fn shared_extensions(registry: &Arc<MockRegistry>) -> ExtensionRegistry {
    let extensions = ExtensionRegistry::default();
    extensions.register::<dyn RegistryClient, _>("mock", {
        let registry = Arc::clone(registry);
        move |_| Ok(Arc::clone(&registry) as Arc<dyn RegistryClient>)
    });
    extensions
}

#[tokio::test]
async fn export_then_refer_calls_through_to_the_exported_invoker() {
    let registry = Arc::new(MockRegistry::new());
    let protocol = Arc::new(LocalProtocol::new());
    let extensions = shared_extensions(&registry);

    let provider_pipeline = ProviderExportPipeline::new(extensions.clone(), Arc::clone(&protocol) as _, ProviderConfig::default());
    let origin_url = Url::parse(
        "registry://r:2181/RegistryService?registry=mock&export=local%3A%2F%2F10.0.0.1%3A20880%2Fcom.example.Car%3Fapplication%3Da",
    )
    .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let origin: Arc<dyn Invoker> = Arc::new(EchoInvoker {
        url: origin_url.clone(),
        calls: Arc::clone(&calls),
    });
    let export = provider_pipeline.export(origin).await.unwrap();

    let consumer_pipeline = ConsumerReferPipeline::new(extensions, protocol, ConsumerConfig::default());
    let refer_url = Url::parse("registry://r:2181/RegistryService?registry=mock&refer=interface%3Dcom.example.Car").unwrap();
    let invoker = consumer_pipeline.refer("com.example.Car", refer_url).await.unwrap();

    assert!(invoker.is_available());
    let result = invoker.invoke(Invocation::new("ping", vec![])).await;
    assert_eq!(result.value().await.unwrap(), serde_json::json!("ping"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    invoker.destroy();
    export.unexport().await;
}

/// End-to-end scenario (d): two providers, the first throws a remote
/// error, failover retries the second, and exactly two underlying
/// `invoke` calls are observed.
#[tokio::test]
async fn consumer_failover_retries_against_the_second_provider() {
    let registry = Arc::new(MockRegistry::new());
    let protocol = Arc::new(LocalProtocol::new());
    let extensions = shared_extensions(&registry);

    let failing_calls = Arc::new(AtomicUsize::new(0));
    let failing_url = Url::parse("local://10.0.0.1:20880/com.example.Car?category=providers").unwrap();
    let failing: Arc<dyn Invoker> = Arc::new(FailingInvoker {
        url: failing_url.clone(),
        calls: Arc::clone(&failing_calls),
    });
    let _failing_exporter = protocol.export(failing).await.unwrap();
    registry.register(failing_url).await.unwrap();

    let ok_calls = Arc::new(AtomicUsize::new(0));
    let ok_url = Url::parse("local://10.0.0.2:20880/com.example.Car?category=providers").unwrap();
    let ok: Arc<dyn Invoker> = Arc::new(EchoInvoker {
        url: ok_url.clone(),
        calls: Arc::clone(&ok_calls),
    });
    let _ok_exporter = protocol.export(ok).await.unwrap();
    registry.register(ok_url).await.unwrap();

    let consumer_pipeline = ConsumerReferPipeline::new(extensions, protocol, ConsumerConfig::default());
    // round_robin (rather than the config default random) keeps the pick
    // order deterministic: the registry preserves registration order, so
    // the first select lands on the failing provider and the retry lands
    // on the second.
    let refer_url = Url::parse(
        "registry://r:2181/RegistryService?registry=mock&refer=interface%3Dcom.example.Car%26cluster%3Dfailover%26loadbalance%3Dround_robin",
    )
    .unwrap();
    let invoker = consumer_pipeline.refer("com.example.Car", refer_url).await.unwrap();

    let result = invoker.invoke(Invocation::new("ping", vec![])).await;
    assert_eq!(result.value().await.unwrap(), serde_json::json!("ping"));
    assert_eq!(failing_calls.load(Ordering::SeqCst), 1, "the first attempt hits the failing provider");
    assert_eq!(ok_calls.load(Ordering::SeqCst), 1, "the retry hits the second provider");

    invoker.destroy();
}

/// End-to-end scenario (e): an empty-set notification leaves the
/// directory unavailable and fails calls with `NoProvidersAvailable`
/// until a provider registers.
#[tokio::test]
async fn empty_provider_set_fails_calls_until_a_provider_registers() {
    let registry = Arc::new(MockRegistry::new());
    let protocol = Arc::new(LocalProtocol::new());
    let extensions = shared_extensions(&registry);

    let consumer_pipeline = ConsumerReferPipeline::new(extensions, Arc::clone(&protocol), ConsumerConfig::default());
    let refer_url = Url::parse("registry://r:2181/RegistryService?registry=mock&refer=interface%3Dcom.example.Car").unwrap();
    let invoker = consumer_pipeline.refer("com.example.Car", refer_url).await.unwrap();

    assert!(!invoker.is_available());
    let result = invoker.invoke(Invocation::new("ping", vec![])).await;
    assert!(matches!(result.value().await, Err(CallError::NoProviders(_))));

    let provider_url = Url::parse("local://10.0.0.1:20880/com.example.Car?category=providers").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let terminal: Arc<dyn Invoker> = Arc::new(EchoInvoker {
        url: provider_url.clone(),
        calls: Arc::clone(&calls),
    });
    let _exporter = protocol.export(terminal).await.unwrap();
    registry.register(provider_url).await.unwrap();

    // The registry's notify is synchronous-on-register in MockRegistry, so
    // the directory is already repopulated by the time `register` returns.
    assert!(invoker.is_available());
    let result = invoker.invoke(Invocation::new("ping", vec![])).await;
    assert_eq!(result.value().await.unwrap(), serde_json::json!("ping"));

    invoker.destroy();
}

/// End-to-end scenario (f): `unexport` returns immediately; the inner
/// release happens after the configured shutdown-timeout, on the
/// wrapper's own task, and a concurrent second `unexport` is a no-op.
#[tokio::test]
async fn unexport_drains_before_releasing_the_inner_export() {
    let registry = Arc::new(MockRegistry::new());
    let protocol = Arc::new(LocalProtocol::new());
    let extensions = shared_extensions(&registry);

    let provider_pipeline = ProviderExportPipeline::new(
        extensions,
        Arc::clone(&protocol) as _,
        ProviderConfig {
            shutdown_timeout: Duration::from_millis(50),
            ..ProviderConfig::default()
        },
    );
    let origin_url = Url::parse(
        "registry://r:2181/RegistryService?registry=mock&export=local%3A%2F%2F10.0.0.1%3A20880%2Fcom.example.Car",
    )
    .unwrap();
    let origin: Arc<dyn Invoker> = Arc::new(EchoInvoker {
        url: origin_url,
        calls: Arc::new(AtomicUsize::new(0)),
    });
    let export = Arc::new(provider_pipeline.export(origin).await.unwrap());

    let provider_url = Url::parse("local://10.0.0.1:20880/com.example.Car").unwrap();

    let started = std::time::Instant::now();
    let a = Arc::clone(&export);
    let b = Arc::clone(&export);
    tokio::join!(a.unexport(), b.unexport());
    assert!(started.elapsed() < Duration::from_millis(40), "unexport must return before the drain sleep elapses");

    // Immediately after unexport() returns, the inner release is still
    // pending on the wrapper's detached task.
    assert!(protocol.refer("com.example.Car", provider_url.clone()).await.is_ok());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(protocol.refer("com.example.Car", provider_url).await.is_err());
}
