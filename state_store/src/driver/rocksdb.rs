use std::{fmt, path::PathBuf};

use ::rocksdb::{
    ColumnFamily,
    ColumnFamilyDescriptor,
    Direction,
    Error as RocksDBError,
    IteratorMode,
    Options as RocksDBOptions,
    Transaction,
    TransactionDB,
    TransactionDBOptions,
};
use serde::{Deserialize, Serialize};

use super::{Error as DriverError, IterOptions, KVBytes, Reader, Writer};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to open RocksDB database. error: {}", source)]
    OpenDatabaseFailed { source: RocksDBError },

    #[error(transparent)]
    GenericRocksDBFailure { source: RocksDBError },
}

impl Error {
    fn into_generic(source: RocksDBError) -> DriverError {
        Self::GenericRocksDBFailure { source }.into()
    }
}

/// Tuning knobs applied when the database is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Threads used for flushing and compaction.
    pub thread_count: i32,
    /// Maximum concurrent background jobs.
    pub max_background_jobs: i32,
    pub max_write_buffer_number: i32,
    pub write_buffer_size: usize,
    pub target_file_size_base: u64,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            max_background_jobs: 2,
            max_write_buffer_number: 2,
            write_buffer_size: 32 * 1024 * 1024,
            target_file_size_base: 64 * 1024 * 1024,
        }
    }
}

impl fmt::Display for RocksDBConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "thread_count={} max_background_jobs={} max_write_buffer_number={} write_buffer_size={} target_file_size_base={}",
            self.thread_count,
            self.max_background_jobs,
            self.max_write_buffer_number,
            self.write_buffer_size,
            self.target_file_size_base
        )
    }
}

/// Options to start a connection with RocksDB.
pub struct Options {
    pub path: PathBuf,
    pub config: RocksDBConfig,
    pub column_families: Vec<ColumnFamilyDescriptor>,
}

/// Driver to connect with a RocksDB database.
pub struct RocksDBDriver {
    db: TransactionDB,
}

impl RocksDBDriver {
    /// Open a new connection with a RocksDB database.
    pub fn open(driver_options: Options) -> Result<RocksDBDriver, DriverError> {
        let config = &driver_options.config;
        let mut db_opts = RocksDBOptions::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        db_opts.increase_parallelism(config.thread_count);
        db_opts.set_max_background_jobs(config.max_background_jobs);
        db_opts.set_max_write_buffer_number(config.max_write_buffer_number);
        db_opts.set_write_buffer_size(config.write_buffer_size);
        db_opts.set_target_file_size_base(config.target_file_size_base);

        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &TransactionDBOptions::default(),
            &driver_options.path,
            driver_options.column_families,
        )
        .map_err(|source| Error::OpenDatabaseFailed { source })?;

        Ok(RocksDBDriver { db })
    }

    fn column_family(&self, name: &str) -> Result<&ColumnFamily, DriverError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| DriverError::MissingColumnFamily {
                name: name.to_string(),
            })
    }
}

impl Writer for RocksDBDriver {
    fn transaction(&self) -> super::Transaction<'_> {
        let tx = self.db.transaction();
        super::Transaction::RocksDB(RocksDBTransaction { db: self, tx })
    }

    fn put<N, K, V>(&self, cf: N, key: K, value: V) -> Result<(), DriverError>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let cf = self.column_family(cf.as_ref())?;
        self.db.put_cf(cf, key, value).map_err(Error::into_generic)
    }
}

impl Reader for RocksDBDriver {
    fn get<N, K>(&self, cf: N, key: K) -> Result<Option<Vec<u8>>, DriverError>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
    {
        let cf = self.column_family(cf.as_ref())?;
        self.db.get_cf(cf, key).map_err(Error::into_generic)
    }

    fn iter<N>(
        &self,
        cf: N,
        options: IterOptions,
    ) -> Result<impl Iterator<Item = Result<KVBytes, DriverError>> + '_, DriverError>
    where
        N: AsRef<str>,
    {
        let cf = self.column_family(cf.as_ref())?;
        let (read_options, start) = options.into_parts();
        let mode = match &start {
            Some(start) => IteratorMode::From(start, Direction::Forward),
            None => IteratorMode::Start,
        };
        let iter = self.db.iterator_cf_opt(cf, read_options, mode);
        Ok(iter.map(|item| item.map_err(Error::into_generic)))
    }
}

pub struct RocksDBTransaction<'db> {
    db: &'db RocksDBDriver,
    tx: Transaction<'db, TransactionDB>,
}

impl<'db> RocksDBTransaction<'db> {
    pub fn commit(self) -> Result<(), DriverError> {
        self.tx.commit().map_err(Error::into_generic)
    }

    pub fn get<K: AsRef<[u8]>>(&self, table: &str, key: K) -> Result<Option<Vec<u8>>, DriverError> {
        let cf = self.db.column_family(table)?;
        self.tx
            .get_for_update_cf(cf, key, true)
            .map_err(Error::into_generic)
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        table: &str,
        key: K,
        value: V,
    ) -> Result<(), DriverError> {
        let cf = self.db.column_family(table)?;
        self.tx.put_cf(cf, key, value).map_err(Error::into_generic)
    }

    pub fn delete<K: AsRef<[u8]>>(&self, table: &str, key: K) -> Result<(), DriverError> {
        let cf = self.db.column_family(table)?;
        self.tx.delete_cf(cf, key).map_err(Error::into_generic)
    }

    pub fn iter(
        &self,
        table: &str,
        prefix: Vec<u8>,
    ) -> Result<impl Iterator<Item = Result<KVBytes, DriverError>> + '_, DriverError> {
        let cf = self.db.column_family(table)?;
        let (read_options, _) = IterOptions::default().into_parts();
        let iter = self.tx.iterator_cf_opt(
            cf,
            read_options,
            IteratorMode::From(&prefix, Direction::Forward),
        );

        Ok(iter
            .map(|item| item.map_err(Error::into_generic))
            .take_while(move |item| match item {
                Ok((key, _)) => key.starts_with(&prefix),
                Err(_) => true,
            }))
    }
}
