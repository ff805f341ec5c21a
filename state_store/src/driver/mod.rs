//! The driver module centralizes the logic for reading and writing data in
//! the state store.
//!
//! It defines the traits a database driver implements and the `Transaction`
//! wrapper the state machine writes through.

use ::rocksdb::ReadOptions;

pub mod rocksdb;
pub use self::rocksdb::{RocksDBConfig, RocksDBDriver, RocksDBTransaction};

pub type KVBytes = (Box<[u8]>, Box<[u8]>);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to decode a serialized record. error: {}", source)]
    JsonDecoderFailed { source: anyhow::Error },

    #[error("Failed to encode a new serialized record. error: {}", source)]
    JsonEncoderFailed { source: anyhow::Error },

    #[error("Column family {} does not exist", name)]
    MissingColumnFamily { name: String },

    #[error(transparent)]
    RocksDBFailure {
        #[from]
        source: self::rocksdb::Error,
    },
}

/// Writer defines the write operations of a driver.
pub trait Writer {
    /// Start a new Transaction in the database.
    fn transaction(&self) -> Transaction<'_>;

    fn put<N, K, V>(&self, cf: N, key: K, value: V) -> Result<(), Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>;
}

/// Reader defines the read operations of a driver.
pub trait Reader {
    fn get<N, K>(&self, cf: N, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>;

    /// Iterate over the Key/Value pairs of a column family.
    fn iter<N>(
        &self,
        cf: N,
        options: IterOptions,
    ) -> Result<impl Iterator<Item = Result<KVBytes, Error>> + '_, Error>
    where
        N: AsRef<str>;
}

/// Options that you can provide to iterate over Key/Value pairs.
pub struct IterOptions {
    read_options: ReadOptions,
    start: Option<Vec<u8>>,
}

impl IterOptions {
    /// 4MB
    pub const DEFAULT_BLOCK_SIZE: usize = 4_194_304;

    pub fn starting_at(mut self, key: &[u8]) -> Self {
        self.start = Some(key.to_vec());
        self
    }

    pub(crate) fn into_parts(self) -> (ReadOptions, Option<Vec<u8>>) {
        (self.read_options, self.start)
    }
}

impl Default for IterOptions {
    fn default() -> Self {
        let mut read_options = ReadOptions::default();
        read_options.set_readahead_size(Self::DEFAULT_BLOCK_SIZE);
        Self {
            read_options,
            start: None,
        }
    }
}

/// Transaction is a wrapper around driver specific transactions, so callers
/// never see the semantics of a given database.
pub enum Transaction<'db> {
    RocksDB(RocksDBTransaction<'db>),
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transaction::RocksDB(_) => write!(f, "Transaction::RocksDB"),
        }
    }
}

impl Transaction<'_> {
    pub fn commit(self) -> Result<(), Error> {
        let Self::RocksDB(tx) = self;
        tx.commit()
    }

    /// Reads a key and locks it until the transaction ends.
    pub fn get<N, K>(&self, cf: N, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
    {
        let Self::RocksDB(tx) = self;
        tx.get(cf.as_ref(), key)
    }

    pub fn put<N, K, V>(&self, cf: N, key: K, value: V) -> Result<(), Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let Self::RocksDB(tx) = self;
        tx.put(cf.as_ref(), key, value)
    }

    pub fn delete<N, K>(&self, cf: N, key: K) -> Result<(), Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
    {
        let Self::RocksDB(tx) = self;
        tx.delete(cf.as_ref(), key)
    }

    /// Every Key/Value pair whose key starts with `prefix`, in key order.
    pub fn scan_prefix<N>(&self, cf: N, prefix: &[u8]) -> Result<Vec<KVBytes>, Error>
    where
        N: AsRef<str>,
    {
        let Self::RocksDB(tx) = self;
        tx.iter(cf.as_ref(), prefix.to_vec())?.collect()
    }
}

#[cfg(test)]
mod tests {
    use ::rocksdb::ColumnFamilyDescriptor;

    use super::*;

    fn open(path: &std::path::Path) -> RocksDBDriver {
        RocksDBDriver::open(self::rocksdb::Options {
            path: path.to_path_buf(),
            config: RocksDBConfig::default(),
            column_families: vec![ColumnFamilyDescriptor::new(
                "items",
                ::rocksdb::Options::default(),
            )],
        })
        .unwrap()
    }

    #[test]
    fn test_transaction_commit_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());

        let tx = db.transaction();
        tx.put("items", b"a|1", b"one").unwrap();
        tx.put("items", b"a|2", b"two").unwrap();
        tx.put("items", b"b|1", b"other").unwrap();
        // Uncommitted writes are visible inside the transaction.
        assert_eq!(tx.scan_prefix("items", b"a|").unwrap().len(), 2);
        tx.commit().unwrap();

        assert_eq!(db.get("items", b"a|2").unwrap(), Some(b"two".to_vec()));
        let all: Vec<_> = db
            .iter("items", IterOptions::default())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());

        {
            let tx = db.transaction();
            tx.put("items", b"k", b"v").unwrap();
        }
        assert_eq!(db.get("items", b"k").unwrap(), None);
    }

    #[test]
    fn test_missing_column_family() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        assert!(matches!(
            db.get("nope", b"k"),
            Err(Error::MissingColumnFamily { .. })
        ));
    }
}
