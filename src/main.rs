//! fabric-rpc demonstration binary.
//!
//! Wires a provider export pipeline and a consumer refer pipeline against
//! the in-memory [`MockRegistry`]/[`LocalProtocol`] stand-ins, exports one
//! service, refers to it, performs one call, then waits for shutdown.

use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use fabric_core::{Invocation, Invoker, RpcResult, Url};
use tracing::{error, info};

use fabric_rpc::config_listener::{DynamicConfig, ProviderConfigurationListener};
use fabric_rpc::config_reload::FileDynamicConfig;
use fabric_rpc::config::Config;
use fabric_rpc::consumer::ConsumerReferPipeline;
use fabric_rpc::extension::ExtensionRegistry;
use fabric_rpc::protocol::LocalProtocol;
use fabric_rpc::provider::ProviderExportPipeline;
use fabric_rpc::registry::mock::MockRegistry;
use fabric_rpc::registry::RegistryClient;
use fabric_rpc::{cli::Cli, setup_tracing};

struct EchoInvoker {
    url: Url,
}

#[async_trait]
impl Invoker for EchoInvoker {
    fn interface_name(&self) -> &str {
        "com.example.Greeter"
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        let greeting = format!("hello, {}", invocation.arguments().first().cloned().unwrap_or_default());
        RpcResult::completed_ok(serde_json::Value::String(greeting))
    }

    fn destroy(&self) {}
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(url) = cli.registry_url {
        config.registry.url = url;
    }
    if cli.no_dynamic_config {
        config.dynamic_config.enabled = false;
    }

    info!(version = env!("CARGO_PKG_VERSION"), registry = %config.registry.url, "starting fabric-rpc");

    let extensions = ExtensionRegistry::default();
    let mock_registry = Arc::new(MockRegistry::new());
    extensions.register::<dyn RegistryClient, _>("mock", {
        let mock_registry = Arc::clone(&mock_registry);
        move |_| Ok(Arc::clone(&mock_registry) as Arc<dyn RegistryClient>)
    });

    let protocol = Arc::new(LocalProtocol::new());
    let provider_pipeline = ProviderExportPipeline::with_failback(extensions.clone(), Arc::clone(&protocol) as _, config.provider.clone(), config.failback.clone());
    let consumer_pipeline = ConsumerReferPipeline::with_failback(extensions, Arc::clone(&protocol) as _, config.consumer.clone(), config.failback.clone());

    let _dynamic_config_listener = if config.dynamic_config.enabled {
        match FileDynamicConfig::start(&config.dynamic_config.directory) {
            Ok(dynamic_config) => {
                let dynamic_config: Arc<dyn DynamicConfig> = dynamic_config;
                match ProviderConfigurationListener::subscribe(dynamic_config, "fabric-rpc-demo".to_string(), provider_pipeline.clone()).await {
                    Ok(listener) => Some(listener),
                    Err(e) => {
                        error!("failed to subscribe to dynamic configuration: {e}");
                        None
                    }
                }
            }
            Err(e) => {
                error!("failed to start dynamic configuration watcher: {e}");
                None
            }
        }
    } else {
        None
    };

    let origin_url = Url::parse("local://0.0.0.0:0/com.example.Greeter?application=fabric-rpc-demo&registry=mock&export=local%3A%2F%2F127.0.0.1%3A20880%2Fcom.example.Greeter%3Fapplication%3Dfabric-rpc-demo")
        .expect("hardcoded demo origin url is valid");
    let origin: Arc<dyn Invoker> = Arc::new(EchoInvoker { url: origin_url });

    let export = match provider_pipeline.export(origin).await {
        Ok(export) => export,
        Err(e) => {
            error!("failed to export demo service: {e}");
            return ExitCode::FAILURE;
        }
    };

    let refer_url = Url::parse("consumer://127.0.0.1/com.example.Greeter?registry=mock").expect("hardcoded demo refer url is valid");
    let consumer = match consumer_pipeline.refer("com.example.Greeter", refer_url).await {
        Ok(invoker) => invoker,
        Err(e) => {
            error!("failed to refer demo service: {e}");
            export.unexport().await;
            return ExitCode::FAILURE;
        }
    };

    let invocation = Invocation::new("greet", vec![serde_json::Value::String("world".to_string())]);
    match consumer.invoke(invocation).await.value().await {
        Ok(value) => info!(result = %value, "demo call succeeded"),
        Err(e) => error!("demo call failed: {e}"),
    }

    info!("fabric-rpc running, press ctrl-c to shut down");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }

    consumer.destroy();
    export.unexport().await;
    info!("fabric-rpc shutdown complete");
    ExitCode::SUCCESS
}
