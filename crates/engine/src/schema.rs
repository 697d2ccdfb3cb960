//! Keyspace and column family registry.

use anyhow::{ensure, Result};
use model::CfId;
use std::collections::BTreeMap;

use crate::EngineError;

/// One column family as declared in the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFamilyDef {
    pub keyspace: String,
    pub name: String,
    pub id: CfId,
}

/// Declared keyspaces and their column families.
///
/// Column family ids are global (unique across keyspaces) and must stay
/// stable across restarts: they are what the commit log and the metadata
/// store record.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    keyspaces: BTreeMap<String, BTreeMap<String, CfId>>,
    by_id: BTreeMap<CfId, ColumnFamilyDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Keyspace1` with `Standard1` (id 1) and `Standard2` (id 2).
    pub fn default_schema() -> Self {
        let mut schema = Self::new();
        schema.add_keyspace("Keyspace1");
        // ids are fixed and distinct
        let _ = schema.add_column_family("Keyspace1", "Standard1", 1);
        let _ = schema.add_column_family("Keyspace1", "Standard2", 2);
        schema
    }

    pub fn add_keyspace(&mut self, name: &str) -> &mut Self {
        self.keyspaces.entry(name.to_string()).or_default();
        self
    }

    /// Declares `keyspace.name` with id `id`.
    ///
    /// # Errors
    ///
    /// Fails if the keyspace is unknown, id 0 is used, or the name or the id
    /// is already taken.
    pub fn add_column_family(&mut self, keyspace: &str, name: &str, id: CfId) -> Result<()> {
        ensure!(id != 0, "column family id 0 is reserved");
        ensure!(
            !self.by_id.contains_key(&id),
            "column family id {} already in use",
            id
        );
        let cfs = self
            .keyspaces
            .get_mut(keyspace)
            .ok_or_else(|| EngineError::UnknownKeyspace(keyspace.to_string()))?;
        ensure!(
            !cfs.contains_key(name),
            "column family {}.{} already exists",
            keyspace,
            name
        );

        cfs.insert(name.to_string(), id);
        self.by_id.insert(
            id,
            ColumnFamilyDef {
                keyspace: keyspace.to_string(),
                name: name.to_string(),
                id,
            },
        );
        Ok(())
    }

    pub fn has_keyspace(&self, keyspace: &str) -> bool {
        self.keyspaces.contains_key(keyspace)
    }

    /// Resolves `keyspace.name` to its id.
    pub fn cf_id(&self, keyspace: &str, name: &str) -> Result<CfId> {
        let cfs = self
            .keyspaces
            .get(keyspace)
            .ok_or_else(|| EngineError::UnknownKeyspace(keyspace.to_string()))?;
        let id = cfs.get(name).ok_or_else(|| EngineError::UnknownColumnFamily {
            keyspace: keyspace.to_string(),
            name: name.to_string(),
        })?;
        Ok(*id)
    }

    pub fn column_family(&self, id: CfId) -> Option<&ColumnFamilyDef> {
        self.by_id.get(&id)
    }

    /// All column families ordered by id.
    pub fn column_families(&self) -> impl Iterator<Item = &ColumnFamilyDef> {
        self.by_id.values()
    }
}
