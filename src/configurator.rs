//! A rule that overrides parameters on matching provider URLs.
//!
//! Built from either an `override://` URL (legacy) or any URL carrying
//! `category=configurators` — both forms are accepted by the Registry
//! Facade's override subscription and by the file-backed
//! dynamic-config rules fed in by [`crate::config_listener`].

use fabric_core::Url;

/// One configurator: a match predicate plus the parameters it sets when it
/// matches. `matches` compares host/port/path, `*` on any field matching
/// anything; `apply` is last-writer-wins per key against whatever's already
/// on the provider URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configurator {
    url: Url,
}

impl Configurator {
    /// Wrap a raw configurator URL. `url`'s own parameters (minus the
    /// handful the override mechanism uses for routing — `category`,
    /// `side`, `check`) are the override set applied by [`Configurator::apply`].
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether this configurator's match predicate accepts `provider_url`.
    /// A wildcard (`*` or empty) host/port/path accepts anything; legacy
    /// `override://` configurators with an empty host/path are treated as
    /// matching every provider for the subscribed service.
    #[must_use]
    pub fn matches(&self, provider_url: &Url) -> bool {
        field_matches(self.url.host(), provider_url.host())
            && port_matches(self.url.port(), provider_url.port())
            && field_matches(self.url.path(), provider_url.path())
    }

    /// Apply this configurator's override parameters onto `provider_url`,
    /// returning a new URL. Routing-only keys are never copied as
    /// overrides. Last-writer-wins: callers fold configurators in
    /// descriptor order, so a later `apply` call overwrites an earlier one
    /// on the same key.
    #[must_use]
    pub fn apply(&self, provider_url: &Url) -> Url {
        let mut next = provider_url.clone();
        for (key, value) in self.url.parameters() {
            if ROUTING_KEYS.contains(&key.as_str()) {
                continue;
            }
            next = next.with_parameter(key.clone(), value.clone());
        }
        next
    }
}

const ROUTING_KEYS: &[&str] = &["category", "side", "check", "compatible_version", "configVersion"];

fn field_matches(pattern: &str, actual: &str) -> bool {
    pattern.is_empty() || pattern == "*" || pattern == actual
}

fn port_matches(pattern: Option<u16>, actual: Option<u16>) -> bool {
    match pattern {
        None => true,
        Some(p) => actual == Some(p),
    }
}

/// Whether `url` should be treated as a configurator for the override
/// listener: either the legacy `override://` scheme, or any scheme
/// carrying `category=configurators`.
#[must_use]
pub fn is_configurator_url(url: &Url) -> bool {
    url.protocol() == "override" || url.parameter("category", "") == "configurators"
}

/// Fold `configurators` onto `base`, in order, filtering to those whose
/// match predicate accepts `base`. Used by both the override listener
/// (registry-delivered configurators) and the configuration listeners
/// (file-backed configurators), and composed by the Provider Export
/// Pipeline across both sources.
#[must_use]
pub fn apply_all(base: &Url, configurators: &[Configurator]) -> Url {
    let mut current = base.clone();
    for c in configurators {
        if c.matches(&current) {
            current = c.apply(&current);
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Url {
        Url::parse("dubbo://10.0.0.1:20880/com.example.Car?application=a").unwrap()
    }

    #[test]
    fn wildcard_configurator_matches_any_provider() {
        let c = Configurator::new(Url::parse("override://0.0.0.0/com.example.Car?timeout=5000").unwrap());
        assert!(c.matches(&provider()));
    }

    #[test]
    fn host_specific_configurator_only_matches_that_host() {
        let c = Configurator::new(Url::parse("override://10.0.0.9/com.example.Car?timeout=5000").unwrap());
        assert!(!c.matches(&provider()));
    }

    #[test]
    fn apply_overrides_parameters_and_skips_routing_keys() {
        let c = Configurator::new(
            Url::parse("override://0.0.0.0/com.example.Car?category=configurators&timeout=5000").unwrap(),
        );
        let applied = c.apply(&provider());
        assert_eq!(applied.parameter_opt("timeout"), Some("5000"));
        assert_ne!(applied.parameter_opt("category"), Some("configurators"));
    }

    #[test]
    fn apply_all_is_last_writer_wins_in_descriptor_order() {
        let c1 = Configurator::new(Url::parse("override://0.0.0.0/com.example.Car?timeout=1000").unwrap());
        let c2 = Configurator::new(Url::parse("override://0.0.0.0/com.example.Car?timeout=5000").unwrap());
        let result = apply_all(&provider(), &[c1, c2]);
        assert_eq!(result.parameter_opt("timeout"), Some("5000"));
    }

    #[test]
    fn is_configurator_url_recognizes_legacy_and_category_forms() {
        assert!(is_configurator_url(&Url::parse("override://h/p").unwrap()));
        assert!(is_configurator_url(
            &Url::parse("provider://h/p?category=configurators").unwrap()
        ));
        assert!(!is_configurator_url(&Url::parse("provider://h/p?category=providers").unwrap()));
    }
}
