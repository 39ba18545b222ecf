use std::collections::BTreeMap;
use std::path::Path;

use crate::store::{keys, StagedWrite, StateStore, StoreResult};

/// Absolute paths already accounted for.
pub type ProcessedFiles = BTreeMap<String, bool>;

pub fn ledger_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[derive(Debug, Clone)]
pub struct DedupLedger {
    state: StateStore,
}

impl DedupLedger {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    pub fn load(&self) -> StoreResult<ProcessedFiles> {
        self.state.get_or(keys::PROCESSED_FILES, ProcessedFiles::new())
    }

    pub fn contains(&self, path: &Path) -> StoreResult<bool> {
        Ok(self
            .load()?
            .get(&ledger_key(path))
            .copied()
            .unwrap_or(false))
    }

    /// Caller must hold the state write guard.
    pub fn stage_mark(&self, path: &Path) -> StoreResult<StagedWrite> {
        let mut processed = self.load()?;
        processed.insert(ledger_key(path), true);
        StagedWrite::new(keys::PROCESSED_FILES, &processed)
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.load()?.values().filter(|marked| **marked).count())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}
