//! In-memory [`Backend`] for tests and single-process deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{Backend, BackendError, KeyState, Mutation};

/// A [`Backend`] backed by a process-local map.
///
/// Updates are serialized under a single mutex, which trivially satisfies
/// the per-key atomicity contract.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<String, KeyState>>,
}

impl MemoryBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn update(&self, key: &str, mutation: Mutation<'_>) -> Result<Option<KeyState>, BackendError> {
        let mut records = self.records.lock();
        let current = records.get(key).cloned();
        let next = mutation(current)?;
        match &next {
            Some(state) => {
                records.insert(key.to_string(), state.clone());
            }
            None => {
                records.remove(key);
            }
        }
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<KeyState>, BackendError> {
        Ok(self.records.lock().values().cloned().collect())
    }
}
