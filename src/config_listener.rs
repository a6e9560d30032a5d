//! Configuration Listeners: bridge file-backed dynamic configuration
//! into the Provider Export Pipeline's [`OverrideSink`].
//!
//! Distinct from the naming-registry's override subscription
//! ([`crate::protocol`]'s `OverrideListener` counterpart in
//! [`crate::provider`]): a [`DynamicConfig`] is a separate configuration
//! center (here, a directory of rule files watched for changes) keyed by
//! `<application>.configurators` for the process-wide singleton and
//! `<service-key>.configurators` per service, matching the naming-service
//! key convention in [`crate::service_key`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fabric_core::Url;

use crate::configurator::Configurator;
use crate::provider::OverrideSink;
use crate::Result;

/// Delivered the full current rule set for one configuration key; called
/// once synchronously on subscribe and again on every change, mirroring
/// [`crate::registry::NotifyListener`]'s full-set-never-delta contract.
#[async_trait]
pub trait DynamicConfigListener: Send + Sync {
    async fn notify(&self, configurators: Vec<Configurator>);
}

/// Abstraction over a configuration-rule source keyed by cache key (e.g.
/// `<application>.configurators`). [`crate::config_reload::FileDynamicConfig`]
/// is the directory-of-YAML-files implementation used by the demonstration
/// binary and tests.
#[async_trait]
pub trait DynamicConfig: Send + Sync {
    /// Subscribe `listener` to `key`. Must call `listener.notify` once,
    /// synchronously, with the current rule set before returning.
    async fn add_listener(&self, key: &str, listener: Arc<dyn DynamicConfigListener>) -> Result<()>;
    /// Remove a previously registered subscription.
    async fn remove_listener(&self, key: &str, listener: Arc<dyn DynamicConfigListener>) -> Result<()>;
}

struct ApplicationListener {
    sink: Arc<dyn OverrideSink>,
}

#[async_trait]
impl DynamicConfigListener for ApplicationListener {
    async fn notify(&self, configurators: Vec<Configurator>) {
        self.sink.update_application_configurators(configurators).await;
    }
}

/// Singleton subscription for the process-wide `<application>.configurators`
/// key. One instance per application, shared across every exported service.
pub struct ProviderConfigurationListener {
    dynamic_config: Arc<dyn DynamicConfig>,
    application: String,
    listener: Arc<dyn DynamicConfigListener>,
}

impl ProviderConfigurationListener {
    /// Subscribe to `<application>.configurators` and forward every update
    /// to `sink`.
    ///
    /// # Errors
    /// Propagates [`DynamicConfig::add_listener`] failures.
    pub async fn subscribe(dynamic_config: Arc<dyn DynamicConfig>, application: String, sink: Arc<dyn OverrideSink>) -> Result<Self> {
        let listener: Arc<dyn DynamicConfigListener> = Arc::new(ApplicationListener { sink });
        let key = format!("{application}.configurators");
        dynamic_config.add_listener(&key, Arc::clone(&listener)).await?;
        Ok(Self { dynamic_config, application, listener })
    }

    pub async fn unsubscribe(&self) {
        let key = format!("{}.configurators", self.application);
        let _ = self.dynamic_config.remove_listener(&key, Arc::clone(&self.listener)).await;
    }
}

struct ServiceListener {
    sink: Arc<dyn OverrideSink>,
    service_key: String,
}

#[async_trait]
impl DynamicConfigListener for ServiceListener {
    async fn notify(&self, configurators: Vec<Configurator>) {
        self.sink.update_service_configurators(&self.service_key, configurators).await;
    }
}

/// Per-service subscription keyed via [`crate::service_key::ServiceKey::configurators_key`].
/// One instance per exported service, created alongside its provider export.
pub struct ServiceConfigurationListener {
    dynamic_config: Arc<dyn DynamicConfig>,
    subscribe_key: String,
    listener: Arc<dyn DynamicConfigListener>,
}

impl ServiceConfigurationListener {
    /// `service_key` is the plain `group/interface:version` form (the
    /// `.configurators` suffix is appended here, matching
    /// [`crate::service_key::ServiceKey::configurators_key`]).
    ///
    /// # Errors
    /// Propagates [`DynamicConfig::add_listener`] failures.
    pub async fn subscribe(dynamic_config: Arc<dyn DynamicConfig>, service_key: String, sink: Arc<dyn OverrideSink>) -> Result<Self> {
        let subscribe_key = format!("{service_key}.configurators");
        let listener: Arc<dyn DynamicConfigListener> = Arc::new(ServiceListener { sink, service_key });
        dynamic_config.add_listener(&subscribe_key, Arc::clone(&listener)).await?;
        Ok(Self { dynamic_config, subscribe_key, listener })
    }

    pub async fn unsubscribe(&self) {
        let _ = self.dynamic_config.remove_listener(&self.subscribe_key, Arc::clone(&self.listener)).await;
    }
}

/// Parse one rule-file's URL lines into a configurator list, skipping blank
/// lines and `#`-prefixed comments. Shared by
/// [`crate::config_reload::FileDynamicConfig`]'s file loader and unit tests.
///
/// # Errors
/// The first malformed line's [`fabric_core::UrlParseError`], converted.
pub fn parse_rule_file(contents: &str) -> Result<Vec<Configurator>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Ok(Configurator::new(Url::parse(line)?)))
        .collect()
}

/// Directory + filename convention for one configuration key's rule file:
/// `<directory>/<key>.yaml` with the `.configurators` suffix stripped and
/// any `/` replaced so the key is a safe filename.
#[must_use]
pub fn rule_file_path(directory: &str, key: &str) -> PathBuf {
    let sanitized = key.replace('/', "_");
    PathBuf::from(directory).join(format!("{sanitized}.yaml"))
}

pub(crate) type KeyedListeners = DashMap<String, Vec<Arc<dyn DynamicConfigListener>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        app_calls: Mutex<Vec<usize>>,
        service_calls: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl OverrideSink for RecordingSink {
        async fn update_application_configurators(&self, configurators: Vec<Configurator>) {
            self.app_calls.lock().unwrap().push(configurators.len());
        }
        async fn update_service_configurators(&self, service_key: &str, configurators: Vec<Configurator>) {
            self.service_calls.lock().unwrap().push((service_key.to_string(), configurators.len()));
        }
    }

    struct InMemoryDynamicConfig {
        listeners: KeyedListeners,
    }

    #[async_trait]
    impl DynamicConfig for InMemoryDynamicConfig {
        async fn add_listener(&self, key: &str, listener: Arc<dyn DynamicConfigListener>) -> Result<()> {
            listener.notify(Vec::new()).await;
            self.listeners.entry(key.to_string()).or_default().push(listener);
            Ok(())
        }
        async fn remove_listener(&self, key: &str, listener: Arc<dyn DynamicConfigListener>) -> Result<()> {
            if let Some(mut entries) = self.listeners.get_mut(key) {
                entries.retain(|l| !Arc::ptr_eq(l, &listener));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn provider_listener_subscribes_under_application_key() {
        let dynamic_config = Arc::new(InMemoryDynamicConfig { listeners: DashMap::new() });
        let sink = Arc::new(RecordingSink::default());
        let _listener = ProviderConfigurationListener::subscribe(dynamic_config.clone(), "my-app".to_string(), sink.clone())
            .await
            .unwrap();

        assert!(dynamic_config.listeners.contains_key("my-app.configurators"));
        assert_eq!(*sink.app_calls.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn service_listener_subscribes_under_service_key_suffix() {
        let dynamic_config = Arc::new(InMemoryDynamicConfig { listeners: DashMap::new() });
        let sink = Arc::new(RecordingSink::default());
        let _listener = ServiceConfigurationListener::subscribe(dynamic_config.clone(), "com.example.Car".to_string(), sink.clone())
            .await
            .unwrap();

        assert!(dynamic_config.listeners.contains_key("com.example.Car.configurators"));
        assert_eq!(*sink.service_calls.lock().unwrap(), vec![("com.example.Car".to_string(), 0)]);
    }

    #[test]
    fn parse_rule_file_skips_blanks_and_comments() {
        let contents = "# a comment\n\noverride://0.0.0.0/com.example.Car?timeout=5000\n";
        let rules = parse_rule_file(contents).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].url().parameter_opt("timeout"), Some("5000"));
    }

    #[test]
    fn rule_file_path_sanitizes_slashes() {
        let path = rule_file_path("config/dynamic", "g1/com.example.Car:1.0");
        assert_eq!(path, PathBuf::from("config/dynamic/g1_com.example.Car:1.0.yaml"));
    }
}
