use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

/// Hands out acquisition sessions and enforces that at most one is live.
/// Beginning a new session supersedes the previous one: its token goes
/// stale, and every later check unwinds that run without side effects.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    current: AtomicU64,
    running: AtomicBool,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new session, canceling any in-flight one.
    pub fn begin(&self) -> SessionToken {
        let id = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.running.store(true, Ordering::SeqCst);
        SessionToken {
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Invalidates the active session without starting a new one.
    pub fn cancel_active(&self) {
        self.inner.current.fetch_add(1, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

/// Proof of ownership of one acquisition run. Every suspension point checks
/// `is_current` before mutating state or emitting callbacks.
#[derive(Clone)]
pub struct SessionToken {
    id: u64,
    inner: Arc<RegistryInner>,
}

impl SessionToken {
    /// True while this session has not been superseded or canceled.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.inner.current.load(Ordering::SeqCst) == self.id
    }

    /// Marks the session terminal. A stale token cannot clear the flag its
    /// successor set.
    pub fn finish(&self) {
        if self.is_current() {
            self.inner.running.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_supersedes_the_previous_session() {
        let registry = SessionRegistry::new();
        let first = registry.begin();
        assert!(first.is_current());
        assert!(registry.is_active());

        let second = registry.begin();
        assert!(!first.is_current());
        assert!(second.is_current());
        assert!(registry.is_active());
    }

    #[test]
    fn cancel_invalidates_without_starting() {
        let registry = SessionRegistry::new();
        let token = registry.begin();
        registry.cancel_active();
        assert!(!token.is_current());
        assert!(!registry.is_active());
    }

    #[test]
    fn finishing_a_stale_token_leaves_the_successor_running() {
        let registry = SessionRegistry::new();
        let first = registry.begin();
        let _second = registry.begin();

        first.finish();
        assert!(registry.is_active());
    }

    #[test]
    fn finishing_the_current_token_ends_the_session() {
        let registry = SessionRegistry::new();
        let token = registry.begin();
        token.finish();
        assert!(!registry.is_active());
        // the token itself stays current until superseded
        assert!(token.is_current());
    }
}
