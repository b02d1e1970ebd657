//! Optimized storage layer using RocksDB

use crate::config::{CompressionType, StorageConfig};
use rocksdb::{DBCompressionType, Direction, IteratorMode, Options, Snapshot, WriteBatch, WriteOptions, DB};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct OptimizedStorage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl OptimizedStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, rocksdb::Error> {
        Self::open(path, &StorageConfig::default())
    }

    pub fn new_with_config(config: &StorageConfig) -> Result<Self, rocksdb::Error> {
        if config.clear_on_start {
            tracing::warn!(path = %config.data_directory, "Clearing ledger database on start");
            DB::destroy(&Options::default(), &config.data_directory)?;
        }
        Self::open(&config.data_directory, config)
    }

    fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self, rocksdb::Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_max_write_buffer_number(config.max_write_buffer_number as i32);
        opts.set_compression_type(match config.compression_type {
            CompressionType::None => DBCompressionType::None,
            CompressionType::Snappy => DBCompressionType::Snappy,
            CompressionType::Lz4 => DBCompressionType::Lz4,
            CompressionType::Zstd => DBCompressionType::Zstd,
        });

        let db = DB::open(&opts, path)?;
        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.sync_writes,
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, rocksdb::Error> {
        self.db.get(key)
    }

    /// Apply puts (`Some`) and deletes (`None`) as one atomic batch
    pub fn commit<I>(&self, ops: I) -> Result<(), rocksdb::Error>
    where
        I: IntoIterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
    {
        let mut batch = WriteBatch::default();
        for (key, value) in ops {
            match value {
                Some(value) => batch.put(key, value),
                None => batch.delete(key),
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)
    }

    /// All rows whose key starts with `prefix`, in key order
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, rocksdb::Error> {
        collect_prefix(self.db.iterator(IteratorMode::From(prefix, Direction::Forward)), prefix)
    }

    /// Point-in-time view; reads through it ignore later commits
    pub fn snapshot(&self) -> StorageSnapshot<'_> {
        StorageSnapshot {
            snapshot: self.db.snapshot(),
        }
    }
}

pub struct StorageSnapshot<'a> {
    snapshot: Snapshot<'a>,
}

impl StorageSnapshot<'_> {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, rocksdb::Error> {
        self.snapshot.get(key)
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, rocksdb::Error> {
        collect_prefix(self.snapshot.iterator(IteratorMode::From(prefix, Direction::Forward)), prefix)
    }
}

type RawRow = (Box<[u8]>, Box<[u8]>);

fn collect_prefix<I>(rows: I, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, rocksdb::Error>
where
    I: Iterator<Item = Result<RawRow, rocksdb::Error>>,
{
    let mut out = Vec::new();
    for item in rows {
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        out.push((key.to_vec(), value.to_vec()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_commit_and_scan_prefix() {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();

        storage
            .commit(vec![
                (b"a:1".to_vec(), Some(b"one".to_vec())),
                (b"a:2".to_vec(), Some(b"two".to_vec())),
                (b"b:1".to_vec(), Some(b"other".to_vec())),
            ])
            .unwrap();
        storage.commit(vec![(b"a:1".to_vec(), None)]).unwrap();

        let rows = storage.scan_prefix(b"a:").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, b"two".to_vec());
        assert_eq!(storage.get(b"b:1").unwrap(), Some(b"other".to_vec()));
    }

    #[test]
    fn test_snapshot_ignores_later_commits() {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();
        storage.commit(vec![(b"a:1".to_vec(), Some(b"one".to_vec()))]).unwrap();

        let snapshot = storage.snapshot();
        storage
            .commit(vec![
                (b"a:1".to_vec(), Some(b"changed".to_vec())),
                (b"a:2".to_vec(), Some(b"two".to_vec())),
            ])
            .unwrap();

        assert_eq!(snapshot.get(b"a:1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(snapshot.get(b"a:2").unwrap(), None);
        assert_eq!(snapshot.scan_prefix(b"a:").unwrap().len(), 1);
        assert_eq!(storage.scan_prefix(b"a:").unwrap().len(), 2);
    }
}
