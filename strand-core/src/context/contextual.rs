//! Contextual wrappers around user callables
//!
//! A [`Contextual`] pairs a captured [`ContextDescriptor`] with a delegate.
//! Every invocation pushes the captured context onto the executing thread,
//! runs the delegate, and restores the thread's prior state on the way out,
//! whether the delegate returns or panics. The wrapper never buffers or
//! retries; there is exactly one establish/restore pair per invocation,
//! strictly around the single delegate call.

use super::descriptor::ContextDescriptor;
use std::sync::Arc;

/// A user callable bound to the context captured when it was wrapped.
///
/// Created by [`ContextService::contextual`](crate::context::ContextService::contextual).
/// The same descriptor is reused across invocations; invoking never mutates
/// it, so a wrapper may be called from any number of threads.
pub struct Contextual<F> {
    descriptor: Arc<ContextDescriptor>,
    delegate: F,
}

impl<F> Contextual<F> {
    pub(crate) fn new(descriptor: Arc<ContextDescriptor>, delegate: F) -> Self {
        Self {
            descriptor,
            delegate,
        }
    }

    /// The descriptor captured when this wrapper was created.
    pub fn descriptor(&self) -> &Arc<ContextDescriptor> {
        &self.descriptor
    }

    // Single shared establish/delegate/restore routine; the shape methods
    // below are thin adapters over it.
    fn around<R>(&self, body: impl FnOnce(&F) -> R) -> R {
        let _ctx = self.descriptor.establish();
        body(&self.delegate)
    }

    /// Invoke a zero-argument delegate under the captured context.
    pub fn call<R>(&self) -> R
    where
        F: Fn() -> R,
    {
        self.around(|f| f())
    }

    /// Invoke a one-argument delegate under the captured context.
    pub fn apply<T, R>(&self, value: T) -> R
    where
        F: Fn(T) -> R,
    {
        self.around(|f| f(value))
    }

    /// Invoke a two-argument delegate under the captured context.
    pub fn apply2<T, U, R>(&self, first: T, second: U) -> R
    where
        F: Fn(T, U) -> R,
    {
        self.around(|f| f(first, second))
    }
}

impl<F> std::fmt::Debug for Contextual<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contextual")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
