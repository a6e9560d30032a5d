//! Load balance strategies, selected per cluster invocation by the
//! `loadbalance` URL parameter (default taken from [`crate::config::ConsumerConfig`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use fabric_core::{Invocation, Invoker};
use parking_lot::Mutex;
use rand::Rng;

/// Picks one invoker from the (already routed) candidate set for a single call.
pub trait LoadBalance: Send + Sync {
    /// Select among `invokers`, or `None` if the slice is empty.
    fn select(&self, invokers: &[Arc<dyn Invoker>], invocation: &Invocation) -> Option<Arc<dyn Invoker>>;

    /// Hook for strategies that track in-flight calls (`least_active`);
    /// `delta` is `+1` when a call starts against `url` and `-1` when it
    /// completes. No-op for stateless strategies.
    fn note_active_delta(&self, _url_key: &str, _delta: i64) {}
}

/// Uniform random selection.
#[derive(Default)]
pub struct RandomLoadBalance;

impl LoadBalance for RandomLoadBalance {
    fn select(&self, invokers: &[Arc<dyn Invoker>], _invocation: &Invocation) -> Option<Arc<dyn Invoker>> {
        if invokers.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..invokers.len());
        Some(Arc::clone(&invokers[idx]))
    }
}

/// Round-robin over the candidate set, independent of call arguments.
#[derive(Default)]
pub struct RoundRobinLoadBalance {
    counter: AtomicUsize,
}

impl LoadBalance for RoundRobinLoadBalance {
    fn select(&self, invokers: &[Arc<dyn Invoker>], _invocation: &Invocation) -> Option<Arc<dyn Invoker>> {
        if invokers.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % invokers.len();
        Some(Arc::clone(&invokers[idx]))
    }
}

/// Picks the invoker with the fewest in-flight calls, as tracked by
/// [`LoadBalance::note_active_delta`]. Ties broken at random.
#[derive(Default)]
pub struct LeastActiveLoadBalance {
    active: Mutex<HashMap<String, Arc<AtomicI64>>>,
}

impl LeastActiveLoadBalance {
    fn counter_for(&self, url_key: &str) -> Arc<AtomicI64> {
        let mut active = self.active.lock();
        Arc::clone(
            active
                .entry(url_key.to_string())
                .or_insert_with(|| Arc::new(AtomicI64::new(0))),
        )
    }
}

impl LoadBalance for LeastActiveLoadBalance {
    fn select(&self, invokers: &[Arc<dyn Invoker>], _invocation: &Invocation) -> Option<Arc<dyn Invoker>> {
        if invokers.is_empty() {
            return None;
        }
        let mut best: Option<(usize, i64)> = None;
        for (idx, invoker) in invokers.iter().enumerate() {
            let count = self.counter_for(&invoker.url().to_string()).load(Ordering::Relaxed);
            match best {
                Some((_, best_count)) if count >= best_count => {}
                _ => best = Some((idx, count)),
            }
        }
        best.map(|(idx, _)| Arc::clone(&invokers[idx]))
    }

    fn note_active_delta(&self, url_key: &str, delta: i64) {
        self.counter_for(url_key).fetch_add(delta, Ordering::Relaxed);
    }
}

/// Resolve a load balance strategy by name, falling back to `random` for
/// an unrecognized name (mirrors the Extension Registry's default-name
/// fallback for adaptive extensions).
#[must_use]
pub fn by_name(name: &str) -> Arc<dyn LoadBalance> {
    match name {
        "round_robin" => Arc::new(RoundRobinLoadBalance::default()),
        "least_active" => Arc::new(LeastActiveLoadBalance::default()),
        _ => Arc::new(RandomLoadBalance),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fabric_core::{RpcResult, Url};

    struct StubInvoker(Url);

    #[async_trait]
    impl Invoker for StubInvoker {
        fn interface_name(&self) -> &str {
            "test.Stub"
        }
        fn url(&self) -> &Url {
            &self.0
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn invoke(&self, _invocation: Invocation) -> RpcResult {
            RpcResult::completed_ok(serde_json::json!("ok"))
        }
        fn destroy(&self) {}
    }

    fn invokers(n: usize) -> Vec<Arc<dyn Invoker>> {
        (0..n)
            .map(|i| {
                Arc::new(StubInvoker(Url::parse(&format!("dubbo://10.0.0.{i}:20880/test.Stub")).unwrap()))
                    as Arc<dyn Invoker>
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_through_every_invoker() {
        let lb = RoundRobinLoadBalance::default();
        let invokers = invokers(3);
        let invocation = Invocation::new("m", vec![]);
        let picks: Vec<String> = (0..6)
            .map(|_| lb.select(&invokers, &invocation).unwrap().url().to_string())
            .collect();
        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_eq!(picks[2], picks[5]);
    }

    #[test]
    fn least_active_prefers_the_invoker_with_fewer_in_flight_calls() {
        let lb = LeastActiveLoadBalance::default();
        let invokers = invokers(2);
        lb.note_active_delta(&invokers[0].url().to_string(), 5);

        let picked = lb.select(&invokers, &Invocation::new("m", vec![])).unwrap();
        assert_eq!(picked.url(), invokers[1].url());
    }

    #[test]
    fn random_never_panics_on_single_invoker() {
        let lb = RandomLoadBalance;
        let invokers = invokers(1);
        let picked = lb.select(&invokers, &Invocation::new("m", vec![])).unwrap();
        assert_eq!(picked.url(), invokers[0].url());
    }

    #[test]
    fn select_on_empty_set_returns_none() {
        let lb = RandomLoadBalance;
        assert!(lb.select(&[], &Invocation::new("m", vec![])).is_none());
    }
}
