//! Composite snapshot handles.
//!
//! A composite handle describes everything one subtask wrote for one
//! checkpoint. Parts of it may be shared with other checkpoints; those parts
//! go through the registry, the rest is owned outright.

use std::collections::BTreeMap;

use super::error::SharedStateError;
use super::handle::{KeyGroupRange, SharedStateRegistryKey, StreamStateHandle};
use super::registry::SharedStateRegistration;

/// Keyed state snapshot of an incremental backend.
///
/// Shared files are keyed by their local file name and registered as
/// `"{backend_id}-{file_name}"`, so the same file uploaded by the same
/// backend in two checkpoints is tracked once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalKeyedStateHandle {
    backend_id: String,
    checkpoint_id: u64,
    key_group_range: KeyGroupRange,
    shared_state: BTreeMap<String, StreamStateHandle>,
    private_state: BTreeMap<String, StreamStateHandle>,
    meta_state: StreamStateHandle,
}

impl IncrementalKeyedStateHandle {
    /// Create a handle.
    #[must_use]
    pub fn new(
        backend_id: impl Into<String>,
        checkpoint_id: u64,
        key_group_range: KeyGroupRange,
        shared_state: BTreeMap<String, StreamStateHandle>,
        private_state: BTreeMap<String, StreamStateHandle>,
        meta_state: StreamStateHandle,
    ) -> Self {
        Self {
            backend_id: backend_id.into(),
            checkpoint_id,
            key_group_range,
            shared_state,
            private_state,
            meta_state,
        }
    }

    /// Identity of the backend instance that wrote the snapshot.
    #[must_use]
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Checkpoint the snapshot belongs to.
    #[must_use]
    pub fn checkpoint_id(&self) -> u64 {
        self.checkpoint_id
    }

    /// Key groups covered by the snapshot.
    #[must_use]
    pub fn key_group_range(&self) -> KeyGroupRange {
        self.key_group_range
    }

    /// Shared files by local file name.
    #[must_use]
    pub fn shared_state(&self) -> &BTreeMap<String, StreamStateHandle> {
        &self.shared_state
    }

    /// Files owned by this snapshot alone.
    #[must_use]
    pub fn private_state(&self) -> &BTreeMap<String, StreamStateHandle> {
        &self.private_state
    }

    /// Backend metadata.
    #[must_use]
    pub fn meta_state(&self) -> &StreamStateHandle {
        &self.meta_state
    }

    /// Registry key of the shared file `file_name`.
    #[must_use]
    pub fn registry_key(&self, file_name: &str) -> SharedStateRegistryKey {
        SharedStateRegistryKey::new(format!("{}-{file_name}", self.backend_id))
    }

    /// Total bytes referenced, shared files included.
    #[must_use]
    pub fn state_size(&self) -> u64 {
        self.shared_state
            .values()
            .chain(self.private_state.values())
            .map(StreamStateHandle::state_size)
            .sum::<u64>()
            + self.meta_state.state_size()
    }

    /// Register every shared file and substitute the handles the registry
    /// returns.
    pub fn register_shared_states(&mut self, registry: &mut SharedStateRegistration<'_>) {
        for (file_name, state) in &mut self.shared_state {
            let key = SharedStateRegistryKey::new(format!("{}-{file_name}", self.backend_id));
            let result = registry.register_reference(key, state.clone());
            if let Some(reference) = result.into_reference() {
                *state = reference;
            }
        }
    }

    /// Release one reference to every shared file.
    ///
    /// # Errors
    ///
    /// Returns [`SharedStateError::NotRegistered`] for a file that was never
    /// registered.
    pub fn unregister_shared_states(
        &self,
        registry: &mut SharedStateRegistration<'_>,
    ) -> Result<(), SharedStateError> {
        for file_name in self.shared_state.keys() {
            registry.unregister_reference(&self.registry_key(file_name))?;
        }
        Ok(())
    }

    /// Discard the private files and the metadata. Shared files are left to
    /// the registry.
    ///
    /// # Errors
    ///
    /// Attempts every discard and returns the first failure.
    pub fn discard_private_state(&self) -> Result<(), SharedStateError> {
        let mut first_error = None;
        for state in self.private_state.values().chain([&self.meta_state]) {
            if let Err(e) = state.discard() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// All keyed state one operator subtask wrote for a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorSubtaskState {
    /// Keyed snapshots, one per backend.
    pub keyed_state: Vec<IncrementalKeyedStateHandle>,
}

impl OperatorSubtaskState {
    /// Create from keyed snapshots.
    #[must_use]
    pub fn new(keyed_state: Vec<IncrementalKeyedStateHandle>) -> Self {
        Self { keyed_state }
    }
}

/// The snapshot shapes that can contribute shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositeStateHandle {
    /// A single keyed backend snapshot.
    IncrementalKeyed(IncrementalKeyedStateHandle),
    /// A whole subtask.
    OperatorSubtask(OperatorSubtaskState),
}

impl CompositeStateHandle {
    /// Register the nested shared state.
    pub fn register_shared_states(&mut self, registry: &mut SharedStateRegistration<'_>) {
        match self {
            Self::IncrementalKeyed(h) => h.register_shared_states(registry),
            Self::OperatorSubtask(s) => {
                for h in &mut s.keyed_state {
                    h.register_shared_states(registry);
                }
            }
        }
    }

    /// Release the nested shared state.
    ///
    /// # Errors
    ///
    /// Returns [`SharedStateError::NotRegistered`] for state that was never
    /// registered.
    pub fn unregister_shared_states(
        &self,
        registry: &mut SharedStateRegistration<'_>,
    ) -> Result<(), SharedStateError> {
        match self {
            Self::IncrementalKeyed(h) => h.unregister_shared_states(registry),
            Self::OperatorSubtask(s) => s
                .keyed_state
                .iter()
                .try_for_each(|h| h.unregister_shared_states(registry)),
        }
    }

    /// Total bytes referenced.
    #[must_use]
    pub fn state_size(&self) -> u64 {
        match self {
            Self::IncrementalKeyed(h) => h.state_size(),
            Self::OperatorSubtask(s) => s
                .keyed_state
                .iter()
                .map(IncrementalKeyedStateHandle::state_size)
                .sum(),
        }
    }
}
