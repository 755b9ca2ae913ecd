//! RocksDB database implementation.

use crate::batch::BatchOp;
use crate::{Storage, StorageError, StorageResult, WriteBatch};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode,
    MultiThreaded, Options,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Column families for organizing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    /// State rows indexed by row id.
    States,
    /// Header hash -> row id.
    StateIds,
    /// height BE || row id -> (), for by-height scans.
    HeightIndex,
    /// Perishable block part (offset, inputs, outputs) by row id.
    Perishable,
    /// Eternal block part (kernels) by row id.
    Eternal,
    /// Txo id -> serialized output.
    Txos,
    /// Txo id -> spend height (absent = unspent).
    TxoSpend,
    /// Kernel id || height -> (), multiset of visible kernels.
    Kernels,
    /// height BE || seq -> event body.
    Events,
    /// Event dedup key -> height BE || seq.
    EventKeys,
    /// Uniqueness table for the shielded pool (key -> value blob).
    Unique,
    /// Shielded pool commitment list (index -> compressed point).
    ShieldedElems,
    /// States MMR node stream.
    StatesMmr,
    /// Shielded MMR node stream.
    ShieldedMmr,
    /// Assets MMR node stream.
    AssetsMmr,
    /// Asset id -> asset record.
    Assets,
    /// Asset owner key -> asset id.
    AssetOwners,
    /// Well-known parameters.
    Params,
    /// Default column family (required by RocksDB).
    Default,
}

impl ColumnFamily {
    /// Get the string name of the column family.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::States => "states",
            ColumnFamily::StateIds => "state_ids",
            ColumnFamily::HeightIndex => "height_index",
            ColumnFamily::Perishable => "perishable",
            ColumnFamily::Eternal => "eternal",
            ColumnFamily::Txos => "txos",
            ColumnFamily::TxoSpend => "txo_spend",
            ColumnFamily::Kernels => "kernels",
            ColumnFamily::Events => "events",
            ColumnFamily::EventKeys => "event_keys",
            ColumnFamily::Unique => "unique",
            ColumnFamily::ShieldedElems => "shielded_elems",
            ColumnFamily::StatesMmr => "states_mmr",
            ColumnFamily::ShieldedMmr => "shielded_mmr",
            ColumnFamily::AssetsMmr => "assets_mmr",
            ColumnFamily::Assets => "assets",
            ColumnFamily::AssetOwners => "asset_owners",
            ColumnFamily::Params => "params",
            ColumnFamily::Default => "default",
        }
    }

    /// Get all column families.
    pub fn all() -> &'static [ColumnFamily] {
        &[
            ColumnFamily::States,
            ColumnFamily::StateIds,
            ColumnFamily::HeightIndex,
            ColumnFamily::Perishable,
            ColumnFamily::Eternal,
            ColumnFamily::Txos,
            ColumnFamily::TxoSpend,
            ColumnFamily::Kernels,
            ColumnFamily::Events,
            ColumnFamily::EventKeys,
            ColumnFamily::Unique,
            ColumnFamily::ShieldedElems,
            ColumnFamily::StatesMmr,
            ColumnFamily::ShieldedMmr,
            ColumnFamily::AssetsMmr,
            ColumnFamily::Assets,
            ColumnFamily::AssetOwners,
            ColumnFamily::Params,
            ColumnFamily::Default,
        ]
    }
}

/// RocksDB database wrapper.
pub struct Database {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Database {
            db: Arc::clone(&self.db),
        }
    }
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();
        info!("Opening database at {:?}", path);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(256);
        opts.set_keep_log_file_num(1);
        opts.set_max_total_wal_size(64 * 1024 * 1024);
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.set_max_background_jobs(2);

        // one shared block cache so memory stays bounded across CFs
        let block_cache = Cache::new_lru_cache(128 * 1024 * 1024);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ColumnFamily::all()
            .iter()
            .map(|cf| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

                let mut block_opts = BlockBasedOptions::default();
                block_opts.set_block_cache(&block_cache);
                cf_opts.set_block_based_table_factory(&block_opts);

                ColumnFamilyDescriptor::new(cf.name(), cf_opts)
            })
            .collect();

        let db =
            DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&opts, path, cf_descriptors)?;

        debug!("Database opened successfully");

        Ok(Self { db: Arc::new(db) })
    }

    fn cf_handle(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(cf.name())
            .ok_or(StorageError::ColumnFamilyNotFound(cf.name()))
    }
}

impl Storage for Database {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let handle = self.cf_handle(cf)?;
        Ok(self.db.get_cf(&handle, key)?)
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let handle = self.cf_handle(cf)?;
        self.db.put_cf(&handle, key, value)?;
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()> {
        let handle = self.cf_handle(cf)?;
        self.db.delete_cf(&handle, key)?;
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut inner = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { cf, key, value } => {
                    let handle = self.cf_handle(cf)?;
                    inner.put_cf(&handle, key, value);
                }
                BatchOp::Delete { cf, key } => {
                    let handle = self.cf_handle(cf)?;
                    inner.delete_cf(&handle, key);
                }
            }
        }
        self.db.write(inner)?;
        Ok(())
    }

    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let handle = self.cf_handle(cf)?;
        let iter = self.db.iterator_cf(&handle, IteratorMode::Start);
        Ok(Box::new(iter.filter_map(|res| {
            res.ok().map(|(k, v)| (k.to_vec(), v.to_vec()))
        })))
    }

    fn iter_from(
        &self,
        cf: ColumnFamily,
        start: &[u8],
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let handle = self.cf_handle(cf)?;
        let iter = self.db.iterator_cf(
            &handle,
            IteratorMode::From(start, rocksdb::Direction::Forward),
        );
        Ok(Box::new(iter.filter_map(|res| {
            res.ok().map(|(k, v)| (k.to_vec(), v.to_vec()))
        })))
    }

    fn compact(&self) -> StorageResult<()> {
        for cf in ColumnFamily::all() {
            let handle = self.cf_handle(*cf)?;
            self.db
                .compact_range_cf(&handle, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_put_get() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path()).unwrap();

        db.put(ColumnFamily::Params, b"k", b"v").unwrap();
        assert_eq!(db.get(ColumnFamily::Params, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(db.get(ColumnFamily::Params, b"missing").unwrap(), None);
    }

    #[test]
    fn batch_is_atomic_per_cf() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Txos, b"a".to_vec(), b"1".to_vec());
        batch.put(ColumnFamily::Kernels, b"b".to_vec(), b"2".to_vec());
        batch.delete(ColumnFamily::Txos, b"missing".to_vec());
        db.write_batch(batch).unwrap();

        assert_eq!(db.get(ColumnFamily::Txos, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(ColumnFamily::Kernels, b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn iter_from_respects_start() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path()).unwrap();

        for i in 0u8..5 {
            db.put(ColumnFamily::Txos, &[i], &[i]).unwrap();
        }
        let keys: Vec<_> = db
            .iter_from(ColumnFamily::Txos, &[2])
            .unwrap()
            .map(|(k, _)| k[0])
            .collect();
        assert_eq!(keys, vec![2, 3, 4]);
    }
}
