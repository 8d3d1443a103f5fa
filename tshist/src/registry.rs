//! Registry & metadata.
//!
//! Maps external series names to storage table names and carries the
//! per-series typing metadata. Lookups go through in-process caches behind
//! one mutex, invalidated globally and eagerly by rename, delete, and
//! metadata updates.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{CResult, Error};
use crate::keys;
use crate::series::{Series, ValueKind};
use crate::storage::engine::Engine;
use crate::storage::txn::Txn;
use crate::tsio::Tsio;

/// Metadata keys managed by the engine itself. Immutable after creation;
/// user extension keys must not collide with them.
pub const META_KEYS: &[&str] =
    &["tzaware", "index_type", "index_names", "index_dtype", "value_dtype", "value_type"];

/// Storage table names mirror series names up to this many bytes; longer
/// names get a digest instead.
const MAX_TABLENAME_BYTES: usize = 63;

/// Per-series typing metadata, stored as JSON in the registry row. The
/// type tags keep the names of the dtypes they describe upstream, so
/// registries written by either implementation read the same.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesMeta {
    pub tzaware: bool,
    pub index_type: String,
    pub index_names: Vec<String>,
    pub index_dtype: String,
    pub value_dtype: String,
    pub value_type: String,
    /// User extension keys.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SeriesMeta {
    pub fn for_series(ts: &Series) -> Self {
        Self {
            tzaware: ts.tzaware(),
            index_type: if ts.tzaware() {
                "datetime64[ns, UTC]".to_string()
            } else {
                "datetime64[ns]".to_string()
            },
            index_names: vec![],
            index_dtype: "<M8[ns]".to_string(),
            value_dtype: ts.kind().value_dtype().to_string(),
            value_type: ts.kind().value_type().to_string(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn value_kind(&self) -> ValueKind {
        if self.value_type == "object" {
            ValueKind::Text
        } else {
            ValueKind::Float
        }
    }
}

/// A registry row, one per series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RegistryRow {
    pub id: u64,
    pub seriename: String,
    pub table_name: String,
    /// JSON-encoded [`SeriesMeta`].
    pub meta: String,
}

impl RegistryRow {
    pub fn meta(&self) -> CResult<SeriesMeta> {
        serde_json::from_str(&self.meta)
            .map_err(|err| Error::Corrupt(format!("metadata of {}: {}", self.seriename, err)))
    }
}

/// Write-through snapshots of registry state, all behind one lock.
#[derive(Default)]
pub(crate) struct Caches {
    pub metadata: HashMap<String, SeriesMeta>,
    pub registry_ids: HashMap<String, u64>,
    pub tablenames: HashMap<String, String>,
}

impl<E: Engine> Tsio<E> {
    /// The storage table name of a series, None if it does not exist.
    pub(crate) fn serie_tablename(
        &self,
        txn: &mut Txn<E>,
        name: &str,
    ) -> CResult<Option<String>> {
        if let Some(table) = self.caches.lock()?.tablenames.get(name) {
            return Ok(Some(table.clone()));
        }
        let Some(row) = self.registry_row(txn, name)? else {
            return Ok(None);
        };
        self.caches.lock()?.tablenames.insert(name.to_string(), row.table_name.clone());
        Ok(Some(row.table_name))
    }

    pub(crate) fn name_to_regid(&self, txn: &mut Txn<E>, name: &str) -> CResult<Option<u64>> {
        if let Some(&id) = self.caches.lock()?.registry_ids.get(name) {
            return Ok(Some(id));
        }
        let Some(row) = self.registry_row(txn, name)? else {
            return Ok(None);
        };
        self.caches.lock()?.registry_ids.insert(name.to_string(), row.id);
        Ok(Some(row.id))
    }

    pub(crate) fn registry_row(
        &self,
        txn: &mut Txn<E>,
        name: &str,
    ) -> CResult<Option<RegistryRow>> {
        let ns = &self.opts.namespace;
        let Some(raw) = txn.get(&keys::regname(ns, name))? else {
            return Ok(None);
        };
        if raw.len() != 8 {
            return Err(Error::Corrupt(format!("bad registry index entry for {}", name)));
        }
        let id = u64::from_be_bytes(raw.try_into().expect("length checked"));
        let raw = txn
            .get(&keys::registry(ns, id))?
            .ok_or_else(|| Error::Corrupt(format!("dangling registry id {} for {}", id, name)))?;
        let row: RegistryRow = bincode::deserialize(&raw)
            .map_err(|err| Error::Corrupt(format!("registry row of {}: {}", name, err)))?;
        Ok(Some(row))
    }

    pub(crate) fn all_registry_rows(&self, txn: &mut Txn<E>) -> CResult<Vec<RegistryRow>> {
        txn.scan_prefix(&keys::registry_prefix(&self.opts.namespace))?
            .into_iter()
            .map(|(_, raw)| {
                bincode::deserialize(&raw)
                    .map_err(|err| Error::Corrupt(format!("registry row: {}", err)))
            })
            .collect()
    }

    /// Computes the storage table name for a new series: the name itself
    /// when short enough, else a digest, and a fresh uuid if the candidate
    /// is already taken (which can happen after a rename).
    pub(crate) fn make_tablename(&self, txn: &mut Txn<E>, name: &str) -> CResult<String> {
        let mut tablename = name.to_string();
        if name.len() > MAX_TABLENAME_BYTES {
            tablename = hex::encode(Sha1::digest(name.as_bytes()));
        }
        let taken =
            self.all_registry_rows(txn)?.iter().any(|row| row.table_name == tablename);
        if taken {
            tablename = uuid::Uuid::new_v4().to_string();
        }
        Ok(tablename)
    }

    /// Inserts the registry row of a new series and returns its id.
    pub(crate) fn register_serie(
        &self,
        txn: &mut Txn<E>,
        name: &str,
        table: &str,
        meta: &SeriesMeta,
    ) -> CResult<u64> {
        let ns = &self.opts.namespace;
        let id = txn.next_id(&keys::seq(ns, "registry"))?;
        let row = RegistryRow {
            id,
            seriename: name.to_string(),
            table_name: table.to_string(),
            meta: serde_json::to_string(meta)?,
        };
        txn.set(&keys::registry(ns, id), bincode::serialize(&row)?)?;
        txn.set(&keys::regname(ns, name), id.to_be_bytes().to_vec())?;
        Ok(id)
    }

    /// The metadata of a series, None if it does not exist.
    pub fn metadata(&self, txn: &mut Txn<E>, name: &str) -> CResult<Option<SeriesMeta>> {
        if let Some(meta) = self.caches.lock()?.metadata.get(name) {
            return Ok(Some(meta.clone()));
        }
        let Some(row) = self.registry_row(txn, name)? else {
            return Ok(None);
        };
        let meta = row.meta()?;
        self.caches.lock()?.metadata.insert(name.to_string(), meta.clone());
        Ok(Some(meta))
    }

    /// Merges user metadata into a series' record. The engine-managed keys
    /// are preserved and may not appear in `update` unless `internal` is
    /// set.
    pub fn update_metadata(
        &self,
        txn: &mut Txn<E>,
        name: &str,
        update: &serde_json::Map<String, serde_json::Value>,
        internal: bool,
    ) -> CResult<()> {
        if !internal {
            if let Some(key) = update.keys().find(|key| META_KEYS.contains(&key.as_str())) {
                return Err(Error::BadInput(format!("{} is a reserved metadata key", key)));
            }
        }
        let Some(mut row) = self.registry_row(txn, name)? else {
            return Err(Error::UnknownSeries(name.to_string()));
        };
        let mut meta = row.meta()?;
        for (key, value) in update {
            if META_KEYS.contains(&key.as_str()) {
                continue; // internal callers still cannot clobber the typing
            }
            meta.extra.insert(key.clone(), value.clone());
        }
        row.meta = serde_json::to_string(&meta)?;
        txn.set(&keys::registry(&self.opts.namespace, row.id), bincode::serialize(&row)?)?;
        self.reset_caches()?;
        Ok(())
    }

    /// Renames a series. The storage table name does not change.
    pub fn rename(&self, txn: &mut Txn<E>, oldname: &str, newname: &str) -> CResult<()> {
        let Some(mut row) = self.registry_row(txn, oldname)? else {
            return Err(Error::UnknownSeries(oldname.to_string()));
        };
        if self.registry_row(txn, newname)?.is_some() {
            return Err(Error::BadInput(format!("{} already exists", newname)));
        }
        let ns = &self.opts.namespace;
        row.seriename = newname.to_string();
        txn.set(&keys::registry(ns, row.id), bincode::serialize(&row)?)?;
        txn.delete(&keys::regname(ns, oldname))?;
        txn.set(&keys::regname(ns, newname), row.id.to_be_bytes().to_vec())?;
        self.reset_caches()?;
        Ok(())
    }

    pub(crate) fn reset_caches(&self) -> CResult<()> {
        let mut caches = self.caches.lock()?;
        caches.metadata.clear();
        caches.registry_ids.clear();
        caches.tablenames.clear();
        Ok(())
    }
}
