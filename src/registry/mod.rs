//! Registry Facade: idempotent register/unregister/subscribe/unsubscribe
//! layered over a concrete naming-service client, with failback retry and
//! per-subscription notification hygiene (full-set delivery, duplicate
//! suppression, serialized per-URL ordering).

pub mod mock;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use dashmap::{DashMap, DashSet};
use fabric_core::Url;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::config::FailbackConfig;
use crate::Result;

/// Delivered a URL set for one subscription; called exactly once
/// synchronously on subscribe, and thereafter on every change.
#[async_trait]
pub trait NotifyListener: Send + Sync {
    /// `urls` is always the full current matching set, never a delta.
    async fn notify(&self, urls: Vec<Url>);
}

/// Abstraction over a concrete naming-service client. `MockRegistry` in
/// [`mock`] is the in-memory stand-in used by tests and the demonstration
/// binary; a production implementation (etcd, zookeeper, ...) would
/// implement the same trait.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Register `url`. Implementations need not be idempotent themselves —
    /// [`RegistryFacade`] tracks registration state above this trait.
    async fn register(&self, url: Url) -> Result<()>;
    /// Remove a previously registered URL.
    async fn unregister(&self, url: Url) -> Result<()>;
    /// Subscribe `listener` to every URL matching `url`. Must call
    /// `listener.notify` synchronously, once, before returning.
    async fn subscribe(&self, url: Url, listener: Arc<dyn NotifyListener>) -> Result<()>;
    /// Remove a previously registered subscription.
    async fn unsubscribe(&self, url: Url, listener: Arc<dyn NotifyListener>) -> Result<()>;
}

enum PendingOp {
    Register(Url),
    Unregister(Url),
    Subscribe(Url, Arc<dyn NotifyListener>),
}

/// Wraps a listener to suppress duplicate consecutive notifications and
/// serialize delivery for one subscribed URL, regardless of how the
/// concrete client schedules its own delivery thread(s).
struct DedupingListener {
    inner: Arc<dyn NotifyListener>,
    serialize: AsyncMutex<()>,
    last: Mutex<Option<Vec<Url>>>,
}

#[async_trait]
impl NotifyListener for DedupingListener {
    async fn notify(&self, urls: Vec<Url>) {
        let _serialize_guard = self.serialize.lock().await;
        {
            let mut last = self.last.lock();
            if last.as_ref() == Some(&urls) {
                return;
            }
            *last = Some(urls.clone());
        }
        self.inner.notify(urls).await;
    }
}

/// Register/unregister/subscribe/unsubscribe over a [`RegistryClient`],
/// idempotent at this layer and resilient to transient client failures via
/// a background failback retry loop.
pub struct RegistryFacade {
    client: Arc<dyn RegistryClient>,
    registered: DashSet<Url>,
    /// Maps (subscribed URL, caller's original listener identity) to the
    /// `DedupingListener` wrapper actually handed to `client`, so
    /// `unsubscribe` can forward the same object `client.subscribe` stored
    /// rather than the caller's un-wrapped listener.
    wrapped_listeners: DashMap<(Url, usize), Arc<dyn NotifyListener>>,
    pending: Arc<Mutex<VecDeque<PendingOp>>>,
    failback: FailbackConfig,
}

fn listener_identity(listener: &Arc<dyn NotifyListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

impl RegistryFacade {
    /// Build a facade over `client` and, if `failback.enabled`, spawn the
    /// background retry task.
    #[must_use]
    pub fn new(client: Arc<dyn RegistryClient>, failback: FailbackConfig) -> Arc<Self> {
        let facade = Arc::new(Self {
            client,
            registered: DashSet::new(),
            wrapped_listeners: DashMap::new(),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            failback,
        });
        facade.clone().spawn_failback_loop();
        facade
    }

    /// Idempotent: re-registering an already-tracked URL is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error only for a non-retryable client failure; a
    /// retryable failure is queued for failback and this call still
    /// returns `Ok(())`.
    pub async fn register(&self, url: Url) -> Result<()> {
        if !self.registered.insert(url.clone()) {
            return Ok(());
        }
        match self.client.register(url.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                self.pending.lock().push_back(PendingOp::Register(url));
                Ok(())
            }
            Err(e) => {
                self.registered.remove(&url);
                Err(e)
            }
        }
    }

    /// Idempotent: unregistering a URL that was never (or no longer)
    /// tracked is a no-op.
    ///
    /// # Errors
    ///
    /// See [`RegistryFacade::register`].
    pub async fn unregister(&self, url: Url) -> Result<()> {
        if self.registered.remove(&url).is_none() {
            return Ok(());
        }
        match self.client.unregister(url.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                self.pending.lock().push_back(PendingOp::Unregister(url));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Subscribe `listener`, wrapped for duplicate suppression and
    /// per-subscription serialization.
    ///
    /// # Errors
    ///
    /// See [`RegistryFacade::register`].
    pub async fn subscribe(&self, url: Url, listener: Arc<dyn NotifyListener>) -> Result<()> {
        let identity = listener_identity(&listener);
        let wrapped: Arc<dyn NotifyListener> = Arc::new(DedupingListener {
            inner: listener,
            serialize: AsyncMutex::new(()),
            last: Mutex::new(None),
        });
        self.wrapped_listeners.insert((url.clone(), identity), Arc::clone(&wrapped));
        match self.client.subscribe(url.clone(), Arc::clone(&wrapped)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                self.pending.lock().push_back(PendingOp::Subscribe(url, wrapped));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Forwards the `DedupingListener` wrapper `subscribe` actually handed
    /// to `client`, keyed by `(url, listener)` identity, so a client that
    /// matches subscriptions by listener pointer (like
    /// [`mock::MockRegistry`]) can find and remove the right one.
    ///
    /// # Errors
    ///
    /// Propagates the underlying client's `unsubscribe` failure; failback
    /// retry does not apply to unsubscribe (there is nothing to replay).
    pub async fn unsubscribe(&self, url: Url, listener: Arc<dyn NotifyListener>) -> Result<()> {
        let identity = listener_identity(&listener);
        let target = self
            .wrapped_listeners
            .remove(&(url.clone(), identity))
            .map_or(listener, |(_, wrapped)| wrapped);
        self.client.unsubscribe(url, target).await
    }

    fn spawn_failback_loop(self: Arc<Self>) {
        if !self.failback.enabled {
            return;
        }
        tokio::spawn(async move {
            let mut was_degraded = false;
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let ops: Vec<PendingOp> = {
                    let mut pending = self.pending.lock();
                    pending.drain(..).collect()
                };
                if ops.is_empty() {
                    if was_degraded {
                        tracing::info!("registry failback: reconnected, pending queue drained");
                        was_degraded = false;
                    }
                    continue;
                }

                was_degraded = true;
                let backoff = ExponentialBuilder::default()
                    .with_min_delay(self.failback.initial_backoff)
                    .with_max_delay(self.failback.max_backoff)
                    .with_factor(self.failback.multiplier as f32)
                    .without_max_times();

                for op in ops {
                    let client = Arc::clone(&self.client);
                    let outcome = (|| {
                        let client = Arc::clone(&client);
                        let op = clone_op(&op);
                        async move { replay(&client, op).await }
                    })
                    .retry(backoff)
                    .notify(|err, dur| {
                        warn!(error = %err, retry_in = ?dur, "registry failback retry");
                    })
                    .await;

                    if outcome.is_err() {
                        self.pending.lock().push_back(op);
                    }
                }
            }
        });
    }
}

fn clone_op(op: &PendingOp) -> PendingOp {
    match op {
        PendingOp::Register(u) => PendingOp::Register(u.clone()),
        PendingOp::Unregister(u) => PendingOp::Unregister(u.clone()),
        PendingOp::Subscribe(u, l) => PendingOp::Subscribe(u.clone(), Arc::clone(l)),
    }
}

async fn replay(client: &Arc<dyn RegistryClient>, op: PendingOp) -> Result<()> {
    match op {
        PendingOp::Register(url) => client.register(url).await,
        PendingOp::Unregister(url) => client.unregister(url).await,
        PendingOp::Subscribe(url, listener) => client.subscribe(url, listener).await,
    }
}
