//! In-memory `RegistryClient` used by pipeline tests and the demonstration
//! binary in place of a real naming-service (etcd, zookeeper, ...).

use std::sync::Arc;

use async_trait::async_trait;
use fabric_core::Url;
use parking_lot::Mutex;

use super::{NotifyListener, RegistryClient};
use crate::Result;

struct Subscription {
    url: Url,
    listener: Arc<dyn NotifyListener>,
}

#[derive(Default)]
struct State {
    registered: Vec<Url>,
    subscriptions: Vec<Subscription>,
}

/// An in-process stand-in naming service. Registration and notification are
/// both driven synchronously on the calling task — adequate for tests and
/// single-process demonstrations, where no real network round-trip exists
/// to decouple.
#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<State>,
}

impl MockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every URL currently registered, for assertions in tests.
    #[must_use]
    pub fn registered_urls(&self) -> Vec<Url> {
        self.state.lock().registered.clone()
    }

    fn current_matches(state: &State, subscribed: &Url) -> Vec<Url> {
        state
            .registered
            .iter()
            .filter(|candidate| matches(candidate, subscribed))
            .cloned()
            .collect()
    }

    async fn notify_matching(&self, subscribed_filter: impl Fn(&Url) -> bool) {
        let deliveries: Vec<(Arc<dyn NotifyListener>, Vec<Url>)> = {
            let state = self.state.lock();
            state
                .subscriptions
                .iter()
                .filter(|sub| subscribed_filter(&sub.url))
                .map(|sub| {
                    let matched = Self::current_matches(&state, &sub.url);
                    let delivered = if matched.is_empty() { vec![empty_marker(&sub.url)] } else { matched };
                    (Arc::clone(&sub.listener), delivered)
                })
                .collect()
        };
        for (listener, urls) in deliveries {
            listener.notify(urls).await;
        }
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn register(&self, url: Url) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.registered.contains(&url) {
                state.registered.push(url.clone());
            }
        }
        self.notify_matching(|subscribed| matches(&url, subscribed)).await;
        Ok(())
    }

    async fn unregister(&self, url: Url) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.registered.retain(|u| u != &url);
        }
        self.notify_matching(|subscribed| matches(&url, subscribed)).await;
        Ok(())
    }

    async fn subscribe(&self, url: Url, listener: Arc<dyn NotifyListener>) -> Result<()> {
        let delivered = {
            let mut state = self.state.lock();
            let delivered = Self::current_matches(&state, &url);
            state.subscriptions.push(Subscription { url: url.clone(), listener: Arc::clone(&listener) });
            delivered
        };
        let delivered = if delivered.is_empty() { vec![empty_marker(&url)] } else { delivered };
        listener.notify(delivered).await;
        Ok(())
    }

    async fn unsubscribe(&self, url: Url, listener: Arc<dyn NotifyListener>) -> Result<()> {
        let mut state = self.state.lock();
        state
            .subscriptions
            .retain(|sub| !(sub.url == url && Arc::ptr_eq(&sub.listener, &listener)));
        Ok(())
    }
}

/// `registered`'s category must be among `subscribed`'s requested
/// (comma-separated) categories. For `providers`/`routers` categories the
/// match is by interface path only (any provider of the interface is
/// relevant to every consumer); for `configurators`/`consumers` categories
/// the match additionally requires host/port/path equality, since those
/// notifications are scoped to one specific provider URL.
fn matches(registered: &Url, subscribed: &Url) -> bool {
    let reg_category = registered.parameter("category", "providers");
    let wanted = subscribed.parameter("category", "providers");
    if !wanted.split(',').any(|c| c == reg_category) {
        return false;
    }

    match reg_category {
        "configurators" | "consumers" => {
            registered.host() == subscribed.host()
                && registered.port() == subscribed.port()
                && registered.path() == subscribed.path()
        }
        _ => subscribed.path() == "*" || subscribed.path() == registered.path(),
    }
}

fn empty_marker(subscribed: &Url) -> Url {
    let category = subscribed.parameter("category", "providers").to_string();
    let mut builder = Url::builder("empty", subscribed.host().to_string())
        .path(subscribed.path().to_string())
        .parameter("category", category);
    if let Some(port) = subscribed.port() {
        builder = builder.port(port);
    }
    builder.build()
}
