//! Reference-counting registry for shared checkpoint state.
//!
//! ## Contract
//!
//! - `register_reference(k, h)` inserts `h` with count 1, or bumps the count
//!   of the handle already registered under `k`. The caller must continue
//!   with the handle in the result: if it differs from `h`, `h` was a
//!   duplicate and has been scheduled for disposal.
//! - `unregister_reference(k)` drops one reference. At zero the entry is
//!   removed and its handle scheduled for disposal. Unregistering an unknown
//!   key is an error.
//! - Placeholders are never handed to the disposal executor.
//!
//! All mutations run under one lock that never does I/O. Disposal is
//! scheduled after the lock is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::composite::CompositeStateHandle;
use super::disposal::{DirectExecutor, DisposalExecutor, DisposalTask};
use super::error::SharedStateError;
use super::handle::{SharedStateRegistryKey, StreamStateHandle};

/// Outcome of a (un)registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    reference: Option<StreamStateHandle>,
    reference_count: u32,
}

impl RegistrationResult {
    /// Handle registered under the key after the call; `None` once the last
    /// reference was released.
    #[must_use]
    pub fn reference(&self) -> Option<&StreamStateHandle> {
        self.reference.as_ref()
    }

    /// Take the registered handle.
    #[must_use]
    pub fn into_reference(self) -> Option<StreamStateHandle> {
        self.reference
    }

    /// Reference count after the call.
    #[must_use]
    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }
}

#[derive(Debug)]
struct SharedStateEntry {
    state: StreamStateHandle,
    reference_count: u32,
}

impl SharedStateEntry {
    fn result(&self) -> RegistrationResult {
        RegistrationResult {
            reference: Some(self.state.clone()),
            reference_count: self.reference_count,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<SharedStateRegistryKey, SharedStateEntry>,
    closed: bool,
}

/// The registry as seen from inside its lock.
///
/// Handed to composite handles during [`SharedStateRegistry::register_all`]
/// and [`SharedStateRegistry::unregister_all`]. Handles it retires are
/// disposed once the lock is released.
pub struct SharedStateRegistration<'a> {
    entries: &'a mut HashMap<SharedStateRegistryKey, SharedStateEntry>,
    disposals: Vec<StreamStateHandle>,
}

impl SharedStateRegistration<'_> {
    /// See [`SharedStateRegistry::register_reference`].
    pub fn register_reference(
        &mut self,
        key: SharedStateRegistryKey,
        state: StreamStateHandle,
    ) -> RegistrationResult {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                if entry.state != state {
                    debug!(%key, duplicate = %state, "deduplicating shared state");
                    self.disposals.push(state);
                }
                entry.reference_count += 1;
                entry.result()
            }
            None => {
                let entry = SharedStateEntry {
                    state,
                    reference_count: 1,
                };
                let result = entry.result();
                self.entries.insert(key, entry);
                result
            }
        }
    }

    /// See [`SharedStateRegistry::unregister_reference`].
    ///
    /// # Errors
    ///
    /// Returns [`SharedStateError::NotRegistered`] for an unknown key.
    pub fn unregister_reference(
        &mut self,
        key: &SharedStateRegistryKey,
    ) -> Result<RegistrationResult, SharedStateError> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Err(SharedStateError::NotRegistered(key.clone()));
        };
        entry.reference_count -= 1;
        if entry.reference_count > 0 {
            return Ok(entry.result());
        }

        if let Some(entry) = self.entries.remove(key) {
            debug!(%key, "last reference released");
            self.disposals.push(entry.state);
        }
        Ok(RegistrationResult {
            reference: None,
            reference_count: 0,
        })
    }
}

/// Process-wide catalog of state shared between incremental checkpoints.
///
/// Construct once per process and share it via `Arc`.
pub struct SharedStateRegistry {
    inner: Mutex<Inner>,
    executor: Arc<dyn DisposalExecutor>,
}

impl SharedStateRegistry {
    /// Create a registry that disposes on the calling thread.
    #[must_use]
    pub fn new() -> Self {
        Self::with_executor(Arc::new(DirectExecutor))
    }

    /// Create a registry that hands disposals to `executor`.
    #[must_use]
    pub fn with_executor(executor: Arc<dyn DisposalExecutor>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            executor,
        }
    }

    /// Register a reference to `state` under `key`.
    ///
    /// Continue with the returned handle, not `state`: if another handle is
    /// already registered under `key`, that one wins and `state` is disposed.
    ///
    /// # Errors
    ///
    /// Returns [`SharedStateError::RegistryClosed`] after [`close`](Self::close).
    pub fn register_reference(
        &self,
        key: SharedStateRegistryKey,
        state: StreamStateHandle,
    ) -> Result<RegistrationResult, SharedStateError> {
        self.with_registration(|r| Ok(r.register_reference(key, state)))
    }

    /// Release one reference to the state under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SharedStateError::NotRegistered`] if nothing is registered
    /// under `key`, and [`SharedStateError::RegistryClosed`] after
    /// [`close`](Self::close).
    pub fn unregister_reference(
        &self,
        key: &SharedStateRegistryKey,
    ) -> Result<RegistrationResult, SharedStateError> {
        self.with_registration(|r| r.unregister_reference(key))
    }

    /// Register the shared parts of every handle under a single lock.
    ///
    /// Each handle's shared state is replaced with the handles the registry
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`SharedStateError::RegistryClosed`] after [`close`](Self::close).
    pub fn register_all<'h, I>(&self, handles: I) -> Result<(), SharedStateError>
    where
        I: IntoIterator<Item = &'h mut CompositeStateHandle>,
    {
        self.with_registration(|r| {
            for handle in handles {
                handle.register_shared_states(r);
            }
            Ok(())
        })
    }

    /// Release the shared parts of every handle under a single lock.
    ///
    /// Used when snapshots are subsumed.
    ///
    /// # Errors
    ///
    /// Stops at the first key that is not registered. References released
    /// before that point stay released.
    pub fn unregister_all<'h, I>(&self, handles: I) -> Result<(), SharedStateError>
    where
        I: IntoIterator<Item = &'h CompositeStateHandle>,
    {
        self.with_registration(|r| {
            for handle in handles {
                handle.unregister_shared_states(r)?;
            }
            Ok(())
        })
    }

    /// Drop every entry without disposing anything.
    ///
    /// Teardown only: state still owned by the registry leaks unless the
    /// caller disposed it already.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        info!(dropped, "shared state registry cleared");
    }

    /// Refuse all further mutations.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            info!(entries = inner.entries.len(), "shared state registry closed");
        }
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no key is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Reference count of `key`, if registered.
    #[must_use]
    pub fn reference_count(&self, key: &SharedStateRegistryKey) -> Option<u32> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|e| e.reference_count)
    }

    /// Handle registered under `key`.
    #[must_use]
    pub fn get(&self, key: &SharedStateRegistryKey) -> Option<StreamStateHandle> {
        self.inner.lock().entries.get(key).map(|e| e.state.clone())
    }

    fn with_registration<R>(
        &self,
        f: impl FnOnce(&mut SharedStateRegistration<'_>) -> Result<R, SharedStateError>,
    ) -> Result<R, SharedStateError> {
        let (result, disposals) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SharedStateError::RegistryClosed);
            }
            let mut registration = SharedStateRegistration {
                entries: &mut inner.entries,
                disposals: Vec::new(),
            };
            let result = f(&mut registration);
            (result, registration.disposals)
        };

        for state in disposals {
            self.schedule_disposal(state);
        }
        result
    }

    fn schedule_disposal(&self, state: StreamStateHandle) {
        if state.is_placeholder() {
            return;
        }
        self.executor.execute(DisposalTask::new(state));
    }
}

impl Default for SharedStateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedStateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SharedStateRegistry")
            .field("entries", &inner.entries.len())
            .field("closed", &inner.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingExecutor(Mutex<Vec<StreamStateHandle>>);

    impl DisposalExecutor for RecordingExecutor {
        fn execute(&self, task: DisposalTask) {
            self.0.lock().push(task.handle().clone());
        }
    }

    fn registry() -> (SharedStateRegistry, Arc<RecordingExecutor>) {
        let executor = Arc::new(RecordingExecutor::default());
        let registry = SharedStateRegistry::with_executor(executor.clone());
        (registry, executor)
    }

    fn mem(name: &str, data: &'static [u8]) -> StreamStateHandle {
        StreamStateHandle::memory(name, data)
    }

    #[test]
    fn test_first_registration() {
        let (registry, executor) = registry();
        let key = SharedStateRegistryKey::new("k");
        let result = registry.register_reference(key.clone(), mem("a", b"1")).unwrap();
        assert_eq!(result.reference_count(), 1);
        assert_eq!(result.reference(), Some(&mem("a", b"1")));
        assert_eq!(registry.reference_count(&key), Some(1));
        assert!(executor.0.lock().is_empty());
    }

    #[test]
    fn test_equal_handle_is_not_disposed() {
        let (registry, executor) = registry();
        let key = SharedStateRegistryKey::new("k");
        registry.register_reference(key.clone(), mem("a", b"1")).unwrap();
        let result = registry.register_reference(key, mem("a", b"1")).unwrap();
        assert_eq!(result.reference_count(), 2);
        assert!(executor.0.lock().is_empty());
    }

    #[test]
    fn test_unregister_unknown_key_fails() {
        let (registry, _) = registry();
        let err = registry
            .unregister_reference(&SharedStateRegistryKey::new("missing"))
            .unwrap_err();
        assert!(matches!(err, SharedStateError::NotRegistered(_)));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_placeholder_never_disposed() {
        let (registry, executor) = registry();
        let key = SharedStateRegistryKey::new("k");
        registry
            .register_reference(key.clone(), StreamStateHandle::placeholder())
            .unwrap();
        let result = registry.unregister_reference(&key).unwrap();
        assert_eq!(result.reference_count(), 0);
        assert!(result.reference().is_none());
        assert!(executor.0.lock().is_empty());
    }

    #[test]
    fn test_clear_does_not_dispose() {
        let (registry, executor) = registry();
        registry.register_reference("a".into(), mem("a", b"1")).unwrap();
        registry.register_reference("b".into(), mem("b", b"2")).unwrap();
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
        assert!(executor.0.lock().is_empty());
    }

    #[test]
    fn test_closed_registry_rejects_mutations() {
        let (registry, _) = registry();
        let key = SharedStateRegistryKey::new("k");
        registry.register_reference(key.clone(), mem("a", b"1")).unwrap();
        registry.close();
        assert!(registry.is_closed());

        assert!(matches!(
            registry.register_reference(key.clone(), mem("a", b"1")),
            Err(SharedStateError::RegistryClosed)
        ));
        assert!(matches!(
            registry.unregister_reference(&key),
            Err(SharedStateError::RegistryClosed)
        ));
        assert_eq!(registry.reference_count(&key), Some(1));
    }

    #[test]
    fn test_get_returns_registered_handle() {
        let registry = SharedStateRegistry::new();
        let key = SharedStateRegistryKey::new("k");
        assert!(registry.get(&key).is_none());
        registry.register_reference(key.clone(), mem("a", b"1")).unwrap();
        assert_eq!(registry.get(&key), Some(mem("a", b"1")));
    }
}
