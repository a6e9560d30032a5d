//! Filter Chain Builder: compose an ordered interceptor list around a
//! terminal invoker and route per-call completion back through listeners.
//!
//! Ordered wrapping with reverse-order post-processing, generalized from a
//! request/response pipeline to the invoker/`RpcResult` model: forward
//! `invoke` calls nest outside-in
//! (`F0` wraps `F1` wraps ... wraps the terminal invoker), while listener
//! notification on completion walks back inside-out (`Fn`, ..., `F0`).

use std::sync::Arc;

use async_trait::async_trait;
use fabric_core::{CallError, Invocation, Invoker, RpcResult, Url};

use crate::Result;

/// An interceptor around an invoker. `invoke` may itself fail synchronously
/// (returning `Err` before any [`RpcResult`] exists) — the Rust analogue of
/// a filter throwing before producing a result — or succeed by producing a
/// (possibly still-pending) [`RpcResult`] whose eventual value `on_response`
/// / `on_error` will be notified about.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Forward the call to `next`, optionally mutating the invocation first.
    async fn invoke(&self, next: Arc<dyn Invoker>, invocation: Invocation) -> Result<RpcResult>;

    /// Called once, in reverse filter order, when the chain's result
    /// completes successfully.
    fn on_response(&self, _value: &serde_json::Value, _invoker: &dyn Invoker, _invocation: &Invocation) {}

    /// Called once, in reverse filter order, when the chain's result
    /// completes with an error (including a synchronous `invoke` failure
    /// anywhere in the chain).
    fn on_error(&self, _error: &CallError, _invoker: &dyn Invoker, _invocation: &Invocation) {}
}

/// Activation side-tag passed to `get_activate_extension` when assembling a
/// chain — distinguishes provider-side from consumer-side filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSide {
    Provider,
    Consumer,
}

impl FilterSide {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Consumer => "consumer",
        }
    }
}

struct FilterInvoker {
    filter: Arc<dyn Filter>,
    next: Arc<dyn Invoker>,
    url: Url,
}

#[async_trait]
impl Invoker for FilterInvoker {
    fn interface_name(&self) -> &str {
        self.next.interface_name()
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn is_available(&self) -> bool {
        self.next.is_available()
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        match self.filter.invoke(Arc::clone(&self.next), invocation).await {
            Ok(result) => result,
            Err(err) => RpcResult::completed_err(CallError::Internal(err.to_string())),
        }
    }

    fn destroy(&self) {
        self.next.destroy();
    }
}

/// Wraps the chain head so that, once its `RpcResult` completes, every
/// filter's listener hook fires exactly once, in reverse filter order. This
/// is the single registration point the design note calls for instead of
/// threading one hook per filter.
struct CallbackRegistrationInvoker {
    head: Arc<dyn Invoker>,
    filters: Vec<Arc<dyn Filter>>,
}

#[async_trait]
impl Invoker for CallbackRegistrationInvoker {
    fn interface_name(&self) -> &str {
        self.head.interface_name()
    }

    fn url(&self) -> &Url {
        self.head.url()
    }

    fn is_available(&self) -> bool {
        self.head.is_available()
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        let result = self.head.invoke(invocation.clone()).await;

        let filters = self.filters.clone();
        let head = Arc::clone(&self.head);
        let invocation_for_hook = invocation.clone();
        result.when_complete(Box::new(move |outcome| match outcome {
            Ok(value) => {
                for filter in filters.iter().rev() {
                    filter.on_response(value, head.as_ref(), &invocation_for_hook);
                }
            }
            Err(err) => {
                for filter in filters.iter().rev() {
                    filter.on_error(err, head.as_ref(), &invocation_for_hook);
                }
            }
        }));

        result
    }

    fn destroy(&self) {
        self.head.destroy();
    }
}

/// Build a filter chain around `terminal`: `filters[0]` is outermost, its
/// `next` is `filters[1]`, and the innermost filter's `next` is `terminal`.
/// The returned invoker is the `CallbackRegistrationInvoker` described
/// above — calling it runs the whole chain and, on completion, notifies
/// every filter's listener hook in reverse order exactly once.
#[must_use]
pub fn build_chain(terminal: Arc<dyn Invoker>, filters: Vec<Arc<dyn Filter>>) -> Arc<dyn Invoker> {
    let url = terminal.url().clone();
    let mut current = terminal;
    for filter in filters.iter().rev() {
        current = Arc::new(FilterInvoker {
            filter: Arc::clone(filter),
            next: current,
            url: url.clone(),
        });
    }
    Arc::new(CallbackRegistrationInvoker { head: current, filters })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct TerminalInvoker {
        url: Url,
        fail: bool,
    }

    #[async_trait]
    impl Invoker for TerminalInvoker {
        fn interface_name(&self) -> &str {
            "test.Interface"
        }
        fn url(&self) -> &Url {
            &self.url
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn invoke(&self, _invocation: Invocation) -> RpcResult {
            if self.fail {
                RpcResult::completed_err(CallError::Remote("boom".to_string()))
            } else {
                RpcResult::completed_ok(serde_json::json!("ok"))
            }
        }
        fn destroy(&self) {}
    }

    struct RecordingFilter {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Filter for RecordingFilter {
        async fn invoke(&self, next: Arc<dyn Invoker>, invocation: Invocation) -> Result<RpcResult> {
            Ok(next.invoke(invocation).await)
        }

        fn on_response(&self, _value: &serde_json::Value, _invoker: &dyn Invoker, _invocation: &Invocation) {
            self.log.lock().push(format!("{}:response", self.name));
        }

        fn on_error(&self, _error: &CallError, _invoker: &dyn Invoker, _invocation: &Invocation) {
            self.log.lock().push(format!("{}:error", self.name));
        }
    }

    fn url() -> Url {
        Url::parse("dubbo://10.0.0.1:20880/test.Interface").unwrap()
    }

    #[tokio::test]
    async fn no_filters_invokes_terminal_directly() {
        let terminal = Arc::new(TerminalInvoker { url: url(), fail: false });
        let chain = build_chain(terminal, Vec::new());
        let result = chain.invoke(Invocation::new("m", vec![])).await;
        assert_eq!(result.value().await.unwrap(), serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn listeners_fire_in_reverse_order_on_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let terminal = Arc::new(TerminalInvoker { url: url(), fail: false });
        let filters: Vec<Arc<dyn Filter>> = vec![
            Arc::new(RecordingFilter { name: "f0", log: Arc::clone(&log) }),
            Arc::new(RecordingFilter { name: "f1", log: Arc::clone(&log) }),
        ];
        let chain = build_chain(terminal, filters);

        let result = chain.invoke(Invocation::new("m", vec![])).await;
        result.value().await.unwrap();

        assert_eq!(*log.lock(), vec!["f1:response".to_string(), "f0:response".to_string()]);
    }

    #[tokio::test]
    async fn listeners_fire_in_reverse_order_on_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let terminal = Arc::new(TerminalInvoker { url: url(), fail: true });
        let filters: Vec<Arc<dyn Filter>> = vec![
            Arc::new(RecordingFilter { name: "f0", log: Arc::clone(&log) }),
            Arc::new(RecordingFilter { name: "f1", log: Arc::clone(&log) }),
        ];
        let chain = build_chain(terminal, filters);

        let result = chain.invoke(Invocation::new("m", vec![])).await;
        assert!(result.value().await.is_err());

        assert_eq!(*log.lock(), vec!["f1:error".to_string(), "f0:error".to_string()]);
    }

    #[tokio::test]
    async fn single_filter_chain_still_notifies_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let terminal = Arc::new(TerminalInvoker { url: url(), fail: false });
        let filters: Vec<Arc<dyn Filter>> =
            vec![Arc::new(RecordingFilter { name: "only", log: Arc::clone(&log) })];
        let chain = build_chain(terminal, filters);

        chain.invoke(Invocation::new("m", vec![])).await.value().await.unwrap();
        assert_eq!(*log.lock(), vec!["only:response".to_string()]);
    }
}
