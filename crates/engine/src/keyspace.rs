//! Write path: validation, commit log append, memtable apply, auto-flush.

use anyhow::{ensure, Result};
use model::{Mutation, ReplayPosition, MAX_COLUMN_NAME_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use std::sync::Arc;

use crate::store::ColumnFamilyStore;
use crate::{EngineError, Inner};

impl Inner {
    fn validate(&self, mutation: &Mutation) -> Result<Vec<Arc<ColumnFamilyStore>>> {
        ensure!(!mutation.key.is_empty(), "key must not be empty");
        ensure!(
            mutation.key.len() <= MAX_KEY_SIZE,
            "key too large: {} bytes (max {})",
            mutation.key.len(),
            MAX_KEY_SIZE
        );
        ensure!(!mutation.updates.is_empty(), "mutation has no updates");
        if !self.schema.has_keyspace(&mutation.keyspace) {
            return Err(EngineError::UnknownKeyspace(mutation.keyspace.clone()).into());
        }

        let mut targets: Vec<Arc<ColumnFamilyStore>> = Vec::with_capacity(mutation.updates.len());
        for update in &mutation.updates {
            for (name, cell) in update.row.cells() {
                ensure!(
                    name.len() <= MAX_COLUMN_NAME_SIZE,
                    "column name too large: {} bytes (max {})",
                    name.len(),
                    MAX_COLUMN_NAME_SIZE
                );
                let value_len = cell.value.as_ref().map_or(0, Vec::len);
                ensure!(
                    value_len <= MAX_VALUE_SIZE,
                    "value too large: {} bytes (max {})",
                    value_len,
                    MAX_VALUE_SIZE
                );
            }

            let store = self
                .stores
                .get(&update.cf_id)
                .filter(|s| s.keyspace() == mutation.keyspace)
                .ok_or_else(|| EngineError::UnknownColumnFamily {
                    keyspace: mutation.keyspace.clone(),
                    name: update.cf_id.to_string(),
                })?;
            targets.push(Arc::clone(store));
        }

        targets.sort_by_key(|s| s.cf_id());
        targets.dedup_by_key(|s| s.cf_id());
        Ok(targets)
    }

    /// Appends `mutation` to the commit log and applies it to every column
    /// family it touches. Returns the entry's position.
    ///
    /// Guards are taken in CF-id order: every admission guard first, then
    /// every active-memtable guard, and all are held across the append and
    /// the applies.
    pub(crate) fn apply(&self, mutation: &Mutation) -> Result<ReplayPosition> {
        self.ensure_open()?;
        let targets = self.validate(mutation)?;

        let position = {
            let _admissions: Vec<_> = targets.iter().map(|s| s.admission.read()).collect();
            let actives: Vec<_> = targets.iter().map(|s| s.active.read()).collect();

            let position = self.commit_log.add(mutation)?;
            for update in &mutation.updates {
                if let Some(idx) = targets.iter().position(|s| s.cf_id() == update.cf_id) {
                    actives[idx].apply(&mutation.key, &update.row);
                }
            }
            position
        };

        tracing::trace!(
            keyspace = %mutation.keyspace,
            position = %position,
            cfs = targets.len(),
            "applied mutation"
        );

        for store in &targets {
            if store.needs_flush() {
                self.flush_store(store)?;
            }
        }
        Ok(position)
    }
}
