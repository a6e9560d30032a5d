//! Router chain: filters the directory's candidate invoker set before the
//! load balancer picks one, per call. Built from the registry's `routers`
//! category plus whatever built-ins the process configures;
//! [`RouterChain`] folds them left to right, each router seeing only the
//! survivors of the one before it.

use std::sync::Arc;

use fabric_core::{Invocation, Invoker, Url};

/// One routing rule. Implementations must be side-effect free: `route` may
/// be called concurrently from many calls against the same directory
/// snapshot.
pub trait Router: Send + Sync {
    /// Narrow `invokers` down for one call against `consumer_url`.
    fn route(&self, invokers: &[Arc<dyn Invoker>], consumer_url: &Url, invocation: &Invocation) -> Vec<Arc<dyn Invoker>>;
}

/// Keeps only invokers whose `tag` parameter matches the invocation's `tag`
/// attachment, when one is present; invokers with no `tag` always survive a
/// call carrying no `tag` attachment. Mirrors dubbo-style tag routing.
#[derive(Default)]
pub struct TagRouter;

impl Router for TagRouter {
    fn route(&self, invokers: &[Arc<dyn Invoker>], _consumer_url: &Url, invocation: &Invocation) -> Vec<Arc<dyn Invoker>> {
        let Some(wanted) = invocation.attachment("tag") else {
            return invokers.to_vec();
        };
        let tagged: Vec<_> = invokers
            .iter()
            .filter(|inv| inv.url().parameter("tag", "") == wanted)
            .cloned()
            .collect();
        if tagged.is_empty() {
            invokers.to_vec()
        } else {
            tagged
        }
    }
}

/// Drops invokers the directory currently considers unavailable
/// (`Invoker::is_available`), independent of any registry-side removal.
#[derive(Default)]
pub struct AvailabilityRouter;

impl Router for AvailabilityRouter {
    fn route(&self, invokers: &[Arc<dyn Invoker>], _consumer_url: &Url, _invocation: &Invocation) -> Vec<Arc<dyn Invoker>> {
        invokers.iter().filter(|inv| inv.is_available()).cloned().collect()
    }
}

/// An ordered fold of [`Router`]s built from a subscribe URL.
#[derive(Default)]
pub struct RouterChain {
    routers: Vec<Arc<dyn Router>>,
}

impl RouterChain {
    /// The default chain every `RegistryDirectory` builds: availability
    /// filtering, then tag routing.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self {
            routers: vec![Arc::new(AvailabilityRouter), Arc::new(TagRouter)],
        }
    }

    #[must_use]
    pub fn new(routers: Vec<Arc<dyn Router>>) -> Self {
        Self { routers }
    }

    pub fn push(&mut self, router: Arc<dyn Router>) {
        self.routers.push(router);
    }

    /// Run every router in order, each seeing only the prior router's
    /// survivors.
    #[must_use]
    pub fn route(&self, invokers: &[Arc<dyn Invoker>], consumer_url: &Url, invocation: &Invocation) -> Vec<Arc<dyn Invoker>> {
        let mut current = invokers.to_vec();
        for router in &self.routers {
            current = router.route(&current, consumer_url, invocation);
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fabric_core::RpcResult;

    struct StubInvoker {
        url: Url,
        available: bool,
    }

    #[async_trait]
    impl Invoker for StubInvoker {
        fn interface_name(&self) -> &str {
            "test.Stub"
        }
        fn url(&self) -> &Url {
            &self.url
        }
        fn is_available(&self) -> bool {
            self.available
        }
        async fn invoke(&self, _invocation: Invocation) -> RpcResult {
            RpcResult::completed_ok(serde_json::json!("ok"))
        }
        fn destroy(&self) {}
    }

    fn inv(url: &str, available: bool) -> Arc<dyn Invoker> {
        Arc::new(StubInvoker { url: Url::parse(url).unwrap(), available })
    }

    #[test]
    fn availability_router_drops_unavailable_invokers() {
        let router = AvailabilityRouter;
        let invokers = vec![inv("x://h1/p", true), inv("x://h2/p", false)];
        let routed = router.route(&invokers, &Url::parse("consumer://c/p").unwrap(), &Invocation::new("m", vec![]));
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].url().host(), "h1");
    }

    #[test]
    fn tag_router_passes_through_when_no_tag_attachment() {
        let router = TagRouter;
        let invokers = vec![inv("x://h1/p", true)];
        let routed = router.route(&invokers, &Url::parse("consumer://c/p").unwrap(), &Invocation::new("m", vec![]));
        assert_eq!(routed.len(), 1);
    }

    #[test]
    fn chain_folds_routers_left_to_right() {
        let chain = RouterChain::with_builtins();
        let invokers = vec![inv("x://h1/p", true), inv("x://h2/p", false)];
        let routed = chain.route(&invokers, &Url::parse("consumer://c/p").unwrap(), &Invocation::new("m", vec![]));
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].url().host(), "h1");
    }
}
