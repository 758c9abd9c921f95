//! Immutable context snapshots and scoped establishment

use super::provider::{ContextCapture, ContextProvider, PriorContext};
use std::sync::Arc;

/// One resolved entry of a descriptor: a captured value or a clear-marker.
struct DescriptorEntry {
    provider: Arc<dyn ContextProvider>,
    /// `Some` reinstates the captured value; `None` clears the type.
    capture: Option<ContextCapture>,
}

/// Immutable snapshot of resolved context values for every configured
/// context type.
///
/// Built once at capture time and shared read-only (via `Arc`) by every
/// wrapper and executor it is attached to. Context types whose policy is
/// `Unchanged` do not appear; the executing thread's ambient value for those
/// types is left alone.
pub struct ContextDescriptor {
    entries: Vec<DescriptorEntry>,
}

impl ContextDescriptor {
    pub(crate) fn new(
        entries: Vec<(Arc<dyn ContextProvider>, Option<ContextCapture>)>,
    ) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(provider, capture)| DescriptorEntry { provider, capture })
                .collect(),
        }
    }

    /// Number of context types this descriptor carries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the descriptor carries no context types at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the context types this descriptor carries, in capture order.
    pub fn context_types(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.provider.context_type())
    }

    /// Push this descriptor's context onto the current thread.
    ///
    /// Entries are established in capture order; the returned guard restores
    /// the displaced state in reverse order when dropped, on every exit path
    /// including unwinding.
    pub fn establish(&self) -> ContextGuard<'_> {
        let mut saved = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            tracing::trace!(
                context_type = entry.provider.context_type(),
                cleared = entry.capture.is_none(),
                "establishing context"
            );
            let prior = entry.provider.establish(entry.capture.as_ref());
            saved.push((entry.provider.as_ref(), prior));
        }
        ContextGuard { saved }
    }
}

impl std::fmt::Debug for ContextDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextDescriptor")
            .field("context_types", &self.context_types().collect::<Vec<_>>())
            .finish()
    }
}

/// Restores the executing thread's prior context when dropped.
///
/// Holding the guard is what it means for a descriptor's context to be
/// "current" on this thread. Restoration runs in reverse establishment
/// order and cannot be skipped by an early return or a panic in the body.
#[must_use = "dropping the guard immediately restores the prior context"]
pub struct ContextGuard<'a> {
    saved: Vec<(&'a dyn ContextProvider, PriorContext)>,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        for (provider, prior) in self.saved.drain(..).rev() {
            tracing::trace!(context_type = provider.context_type(), "restoring context");
            provider.restore(prior);
        }
    }
}
