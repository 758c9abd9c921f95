//! Context service: capture, wrapping, and the ambient executor

use crate::config::{ContextPolicy, ContextServiceConfig};
use crate::error::{Result, StrandError};
use crate::executor::managed::ManagedExecutor;
use crate::stage::ManagedFuture;
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::contextual::Contextual;
use super::descriptor::ContextDescriptor;
use super::provider::{ContextProvider, ContextCapture};

/// Ordered provider registry with resolved per-type policies.
///
/// Shared by a service and every executor derived from it; immutable after
/// construction.
pub(crate) struct ProviderRegistry {
    entries: Vec<RegisteredProvider>,
}

struct RegisteredProvider {
    provider: Arc<dyn ContextProvider>,
    policy: ContextPolicy,
}

impl ProviderRegistry {
    pub(crate) fn new(
        providers: Vec<Arc<dyn ContextProvider>>,
        policies: &BTreeMap<String, ContextPolicy>,
        default_policy: ContextPolicy,
    ) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for provider in &providers {
            if !seen.insert(provider.context_type().to_string()) {
                return Err(StrandError::Configuration(format!(
                    "Duplicate context type '{}'",
                    provider.context_type()
                )));
            }
        }
        for name in policies.keys() {
            if !seen.contains(name) {
                tracing::warn!(
                    context_type = %name,
                    "policy configured for an unregistered context type"
                );
            }
        }

        let entries = providers
            .into_iter()
            .map(|provider| {
                let policy = policies
                    .get(provider.context_type())
                    .copied()
                    .unwrap_or(default_policy);
                RegisteredProvider { provider, policy }
            })
            .collect();
        Ok(Self { entries })
    }

    /// Snapshot the calling thread, honoring per-call policy overrides.
    ///
    /// Capture never fails: a propagated type with no ambient value on the
    /// calling thread degrades to a clear-marker for that type.
    pub(crate) fn capture(
        &self,
        overrides: &BTreeMap<String, ContextPolicy>,
    ) -> Arc<ContextDescriptor> {
        let mut entries: Vec<(Arc<dyn ContextProvider>, Option<ContextCapture>)> = Vec::new();
        for registered in &self.entries {
            let name = registered.provider.context_type();
            let policy = overrides.get(name).copied().unwrap_or(registered.policy);
            match policy {
                ContextPolicy::Unchanged => continue,
                ContextPolicy::Cleared => entries.push((registered.provider.clone(), None)),
                ContextPolicy::Propagated => {
                    let capture = registered.provider.capture();
                    if capture.is_none() {
                        tracing::debug!(
                            context_type = %name,
                            "no ambient value to propagate, degrading to clear"
                        );
                    }
                    entries.push((registered.provider.clone(), capture));
                }
            }
        }
        Arc::new(ContextDescriptor::new(entries))
    }

    pub(crate) fn capture_default(&self) -> Arc<ContextDescriptor> {
        self.capture(&BTreeMap::new())
    }
}

struct ServiceInner {
    config: ContextServiceConfig,
    registry: Arc<ProviderRegistry>,
    /// Compare-and-install slot for the lazily-built ambient executor:
    /// racing builders each construct one, losers of `try_insert` shut
    /// theirs down and adopt the winner's.
    ambient: OnceCell<Arc<ManagedExecutor>>,
    shut_down: AtomicBool,
}

/// Capture and propagation of ambient thread state under a fixed policy.
///
/// A `ContextService` maps each registered context type to a policy
/// (propagated, cleared, or unchanged), builds immutable
/// [`ContextDescriptor`] snapshots of the calling thread, and wraps
/// callables and executors so captured context travels with scheduled work.
/// Handles are cheap to clone and share one underlying service.
#[derive(Clone)]
pub struct ContextService {
    inner: Arc<ServiceInner>,
}

impl ContextService {
    /// Start building a service.
    pub fn builder() -> ContextServiceBuilder {
        ContextServiceBuilder::new()
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The service configuration.
    pub fn config(&self) -> &ContextServiceConfig {
        &self.inner.config
    }

    /// Snapshot the calling thread under the service's configured policies.
    ///
    /// No side effects on the calling thread; the descriptor is immutable
    /// and freely shareable.
    pub fn capture(&self) -> Arc<ContextDescriptor> {
        self.inner.registry.capture_default()
    }

    /// As [`capture`](Self::capture), with per-call policy overrides.
    pub fn capture_with(
        &self,
        overrides: &BTreeMap<String, ContextPolicy>,
    ) -> Arc<ContextDescriptor> {
        self.inner.registry.capture(overrides)
    }

    /// Wrap a callable so every invocation runs under the context captured
    /// right now, on whatever thread invokes it.
    pub fn contextual<F>(&self, delegate: F) -> Contextual<F> {
        Contextual::new(self.capture(), delegate)
    }

    /// An executor that establishes the context current at this call around
    /// every task handed to it. Captured once, reused for all tasks.
    pub fn current_context_executor(&self) -> CurrentContextExecutor {
        CurrentContextExecutor {
            descriptor: self.capture(),
        }
    }

    /// The service's cached unbounded executor, built on first use.
    ///
    /// Concurrent first uses race to install: exactly one instance survives,
    /// losing builders shut their pool down before adopting the winner.
    ///
    /// # Errors
    ///
    /// [`StrandError::ExecutorUnavailable`] after [`shutdown`](Self::shutdown);
    /// configuration errors from pool construction outside a Tokio runtime.
    pub fn ambient_executor(&self) -> Result<Arc<ManagedExecutor>> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(StrandError::ExecutorUnavailable(format!(
                "service '{}' is shut down",
                self.name()
            )));
        }
        if let Some(executor) = self.inner.ambient.get() {
            return Ok(executor.clone());
        }

        let built = ManagedExecutor::unbounded(self.inner.registry.clone())?;
        match self.inner.ambient.try_insert(built) {
            Ok(installed) => {
                tracing::debug!(
                    service = %self.name(),
                    executor = %installed.name(),
                    "installed ambient executor"
                );
                Ok(installed.clone())
            }
            Err((current, losing)) => {
                // Lost the install race; this instance never ran work.
                tracing::debug!(
                    service = %self.name(),
                    discarded = %losing.name(),
                    "lost ambient executor install race"
                );
                losing.shutdown();
                Ok(current.clone())
            }
        }
    }

    /// Bridge an asynchronous result into this service's context domain.
    ///
    /// The returned stage completes identically to `stage`, driven by a
    /// listener on it, but continuations chained onto the returned stage run
    /// under the context captured here and now, not under whichever thread
    /// drives the source's completion. The returned stage refuses external
    /// completion; the listener lands through the internal path.
    ///
    /// # Errors
    ///
    /// Fails when the ambient executor cannot be obtained.
    pub fn with_context_capture<T>(&self, stage: &ManagedFuture<T>) -> Result<ManagedFuture<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let executor = self.ambient_executor()?;
        let descriptor = self.capture();
        let bridged = ManagedFuture::pending_bridged(executor, descriptor);

        let target = bridged.clone();
        stage.on_outcome(move |outcome| {
            target.settle(outcome);
        });

        Ok(bridged)
    }

    /// Shut the service down, releasing the ambient executor's pool if one
    /// was ever built. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(service = %self.name(), "shutting down context service");
        if let Some(executor) = self.inner.ambient.get() {
            executor.shutdown();
        }
    }

    /// Shut down and wait up to the configured grace period for in-flight
    /// tasks to drain. Returns `true` if the executor went idle in time (or
    /// was never built).
    pub async fn shutdown_graceful(&self) -> bool {
        let executor = self.inner.ambient.get().cloned();
        self.shutdown();
        match executor {
            Some(executor) => {
                executor
                    .shutdown_graceful(self.inner.config.shutdown_grace)
                    .await
            }
            None => true,
        }
    }
}

impl std::fmt::Debug for ContextService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextService")
            .field("name", &self.name())
            .field("ambient_built", &self.inner.ambient.get().is_some())
            .field("shut_down", &self.inner.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

/// An executor bound to one captured descriptor.
///
/// Tasks run inline on the invoking thread, under the context that was
/// current when [`ContextService::current_context_executor`] was called.
pub struct CurrentContextExecutor {
    descriptor: Arc<ContextDescriptor>,
}

impl CurrentContextExecutor {
    /// Run `task` under the captured context, restoring the invoking
    /// thread's own state afterwards.
    pub fn execute<R>(&self, task: impl FnOnce() -> R) -> R {
        let _ctx = self.descriptor.establish();
        task()
    }

    /// The descriptor this executor establishes.
    pub fn descriptor(&self) -> &Arc<ContextDescriptor> {
        &self.descriptor
    }
}

impl std::fmt::Debug for CurrentContextExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurrentContextExecutor")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Builder for [`ContextService`].
pub struct ContextServiceBuilder {
    config: ContextServiceConfig,
    providers: Vec<Arc<dyn ContextProvider>>,
}

impl ContextServiceBuilder {
    /// Create a builder with default configuration and no providers.
    pub fn new() -> Self {
        Self {
            config: ContextServiceConfig::default(),
            providers: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ContextServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the service name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the policy for one context type.
    pub fn policy(mut self, context_type: impl Into<String>, policy: ContextPolicy) -> Self {
        self.config.policies.insert(context_type.into(), policy);
        self
    }

    /// Set the policy applied to context types without an explicit one.
    pub fn default_policy(mut self, policy: ContextPolicy) -> Self {
        self.config.default_policy = policy;
        self
    }

    /// Register a context provider.
    pub fn provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Build the service.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid config or duplicate
    /// provider names.
    pub fn build(self) -> Result<ContextService> {
        self.config.validate()?;
        let registry = Arc::new(ProviderRegistry::new(
            self.providers,
            &self.config.policies,
            self.config.default_policy,
        )?);
        tracing::debug!(service = %self.config.name, "built context service");
        Ok(ContextService {
            inner: Arc::new(ServiceInner {
                config: self.config,
                registry,
                ambient: OnceCell::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

impl Default for ContextServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::provider::ThreadStateProvider;

    fn identity_service(provider: &Arc<ThreadStateProvider<String>>) -> ContextService {
        ContextService::builder()
            .name("test-service")
            .provider(provider.clone())
            .policy("identity", ContextPolicy::Propagated)
            .build()
            .unwrap()
    }

    #[test]
    fn test_capture_has_no_side_effects() {
        let provider = Arc::new(ThreadStateProvider::new("identity"));
        let service = identity_service(&provider);

        provider.set("alice".to_string());
        let descriptor = service.capture();
        assert_eq!(descriptor.len(), 1);
        assert_eq!(provider.get(), Some("alice".to_string()));
    }

    #[test]
    fn test_capture_policies_resolved() {
        let identity = Arc::new(ThreadStateProvider::<String>::new("identity"));
        let locale = Arc::new(ThreadStateProvider::<String>::new("locale"));
        let txn = Arc::new(ThreadStateProvider::<String>::new("txn"));
        let service = ContextService::builder()
            .provider(identity.clone())
            .provider(locale.clone())
            .provider(txn.clone())
            .policy("identity", ContextPolicy::Propagated)
            .policy("locale", ContextPolicy::Unchanged)
            .policy("txn", ContextPolicy::Cleared)
            .build()
            .unwrap();

        let descriptor = service.capture();
        // Unchanged types are absent; propagated and cleared appear once.
        let types: Vec<_> = descriptor.context_types().collect();
        assert_eq!(types, vec!["identity", "txn"]);
    }

    #[test]
    fn test_capture_with_overrides() {
        let provider = Arc::new(ThreadStateProvider::<String>::new("identity"));
        let service = identity_service(&provider);

        let mut overrides = BTreeMap::new();
        overrides.insert("identity".to_string(), ContextPolicy::Unchanged);
        let descriptor = service.capture_with(&overrides);
        assert!(descriptor.is_empty());
    }

    #[test]
    fn test_default_policy_applies() {
        let provider = Arc::new(ThreadStateProvider::<String>::new("identity"));
        let service = ContextService::builder()
            .provider(provider.clone())
            .default_policy(ContextPolicy::Propagated)
            .build()
            .unwrap();

        provider.set("alice".to_string());
        let wrapped = {
            let inner = provider.clone();
            service.contextual(move || inner.get())
        };
        provider.set("bob".to_string());
        assert_eq!(wrapped.call(), Some("alice".to_string()));
        assert_eq!(provider.get(), Some("bob".to_string()));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let a = Arc::new(ThreadStateProvider::<String>::new("identity"));
        let b = Arc::new(ThreadStateProvider::<String>::new("identity"));
        let result = ContextService::builder().provider(a).provider(b).build();
        assert!(matches!(result, Err(StrandError::Configuration(_))));
    }

    #[test]
    fn test_current_context_executor_reuses_one_capture() {
        let provider = Arc::new(ThreadStateProvider::new("identity"));
        let service = identity_service(&provider);

        provider.set("alice".to_string());
        let executor = service.current_context_executor();
        provider.set("bob".to_string());

        let inner = provider.clone();
        assert_eq!(executor.execute(|| inner.get()), Some("alice".to_string()));
        let inner = provider.clone();
        assert_eq!(executor.execute(|| inner.get()), Some("alice".to_string()));
        assert_eq!(provider.get(), Some("bob".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ambient_executor_cached() {
        let provider = Arc::new(ThreadStateProvider::<String>::new("identity"));
        let service = identity_service(&provider);

        let first = service.ambient_executor().unwrap();
        let second = service.ambient_executor().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.name().starts_with("managed-executor--1--1-"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ambient_executor_race_single_winner() {
        let provider = Arc::new(ThreadStateProvider::<String>::new("identity"));
        let service = identity_service(&provider);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                service.ambient_executor().unwrap()
            }));
        }
        let mut executors = Vec::new();
        for handle in handles {
            executors.push(handle.await.unwrap());
        }

        let winner = service.ambient_executor().unwrap();
        for executor in &executors {
            assert!(Arc::ptr_eq(executor, &winner));
        }
        // The surviving instance still accepts work.
        assert!(!winner.pool().is_shut_down());
        let stage = winner.submit(|| 1).unwrap();
        assert_eq!(stage.outcome().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_releases_and_refuses() {
        let provider = Arc::new(ThreadStateProvider::<String>::new("identity"));
        let service = identity_service(&provider);

        let executor = service.ambient_executor().unwrap();
        assert!(service.shutdown_graceful().await);
        assert!(executor.pool().is_shut_down());
        assert!(matches!(
            service.ambient_executor(),
            Err(StrandError::ExecutorUnavailable(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_with_context_capture_registration_context() {
        let provider = Arc::new(ThreadStateProvider::new("identity"));
        let service = identity_service(&provider);

        // Source stage completed later by a foreign thread.
        let source = ManagedFuture::pending(service.ambient_executor().unwrap());

        provider.set("alice".to_string());
        let bridged = service.with_context_capture(&source).unwrap();
        provider.set("mallory".to_string());

        let inner = provider.clone();
        let seen = bridged.then_apply(move |_: i32| inner.get());

        let completer = source.clone();
        std::thread::spawn(move || {
            completer.complete(0);
        })
        .join()
        .unwrap();

        assert_eq!(seen.outcome().await.unwrap(), Some("alice".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bridged_stage_refuses_external_completion() {
        let provider = Arc::new(ThreadStateProvider::<String>::new("identity"));
        let service = identity_service(&provider);

        let source: ManagedFuture<i32> =
            ManagedFuture::pending(service.ambient_executor().unwrap());
        let bridged = service.with_context_capture(&source).unwrap();

        assert!(!bridged.complete(99));
        assert!(!bridged.fail(anyhow::anyhow!("nope")));
        assert!(!bridged.is_done());

        source.complete(7);
        assert_eq!(bridged.outcome().await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bridged_stage_propagates_failure() {
        let provider = Arc::new(ThreadStateProvider::<String>::new("identity"));
        let service = identity_service(&provider);

        let source: ManagedFuture<i32> =
            ManagedFuture::pending(service.ambient_executor().unwrap());
        let bridged = service.with_context_capture(&source).unwrap();

        source.fail(anyhow::anyhow!("source broke"));
        let failure = bridged.outcome().await.unwrap_err();
        assert!(failure.to_string().contains("source broke"));
    }
}
