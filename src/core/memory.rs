// In-process ordered engine plus the ordered table shared with the file engine.
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::core::bytes::ByteString;
use crate::core::engine::{RecordChange, StorageEngine};
use crate::core::error::{Error, ErrorKind};
use crate::core::mode::OpenMode;

/// Ordered record set with a running byte total.
#[derive(Clone, Debug, Default)]
pub(crate) struct Table {
    records: BTreeMap<ByteString, ByteString>,
    bytes: u64,
}

impl Table {
    pub(crate) fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ByteString, &ByteString)> {
        self.records.iter()
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<&ByteString> {
        self.records.get(key)
    }

    pub(crate) fn insert(&mut self, key: ByteString, value: ByteString) {
        let added = (key.len() + value.len()) as u64;
        if let Some(old) = self.records.insert(key.clone(), value) {
            self.bytes -= (key.len() + old.len()) as u64;
        }
        self.bytes += added;
    }

    pub(crate) fn remove(&mut self, key: &[u8]) -> bool {
        match self.records.remove(key) {
            Some(old) => {
                self.bytes -= (key.len() + old.len()) as u64;
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.bytes = 0;
    }

    /// Applies a decided change; returns whether the table was modified.
    pub(crate) fn apply(&mut self, key: &[u8], change: RecordChange) -> bool {
        match change {
            RecordChange::Keep => false,
            RecordChange::Put(value) => {
                self.insert(ByteString::copy_from_slice(key), value);
                true
            }
            RecordChange::Delete => self.remove(key),
        }
    }

    pub(crate) fn first_from(&self, key: Option<&[u8]>) -> Option<ByteString> {
        let lower = key.map_or(Bound::Unbounded, Bound::Included);
        self.records
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()
            .map(|(key, _)| key.clone())
    }

    pub(crate) fn last_to(&self, key: Option<&[u8]>) -> Option<ByteString> {
        let upper = key.map_or(Bound::Unbounded, Bound::Included);
        self.records
            .range::<[u8], _>((Bound::Unbounded, upper))
            .next_back()
            .map(|(key, _)| key.clone())
    }

    pub(crate) fn after(&self, key: &[u8]) -> Option<ByteString> {
        self.records
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(key, _)| key.clone())
    }

    pub(crate) fn before(&self, key: &[u8]) -> Option<ByteString> {
        self.records
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(key, _)| key.clone())
    }
}

pub(crate) fn poisoned() -> Error {
    Error::new(ErrorKind::Internal).with_message("engine lock poisoned")
}

pub(crate) fn read_only(path: &Path) -> Error {
    Error::new(ErrorKind::PermissionDenied)
        .with_message("database is opened read-only")
        .with_path(path)
}

/// Volatile engine. Handles opened on the same path share one table for the
/// lifetime of the engine instance.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    tables: Mutex<HashMap<PathBuf, Arc<RwLock<Table>>>>,
}

#[derive(Debug)]
pub struct MemoryHandle {
    path: PathBuf,
    writable: bool,
    table: Arc<RwLock<Table>>,
}

impl MemoryHandle {
    fn read(&self) -> Result<RwLockReadGuard<'_, Table>, Error> {
        self.table.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Table>, Error> {
        if !self.writable {
            return Err(read_only(&self.path));
        }
        self.table.write().map_err(|_| poisoned())
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for MemoryEngine {
    type Handle = MemoryHandle;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<MemoryHandle, Error> {
        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        let table = match tables.get(path) {
            Some(table) => Arc::clone(table),
            None if mode.contains(OpenMode::CREATE) => {
                let table = Arc::new(RwLock::new(Table::default()));
                tables.insert(path.to_path_buf(), Arc::clone(&table));
                table
            }
            None => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("no such in-memory database")
                    .with_path(path)
                    .with_hint("Open with create to start a new database."));
            }
        };
        if mode.contains(OpenMode::TRUNCATE) {
            table.write().map_err(|_| poisoned())?.clear();
        }
        debug!(path = %path.display(), %mode, "memory engine opened");
        Ok(MemoryHandle {
            path: path.to_path_buf(),
            writable: mode.is_writer(),
            table,
        })
    }

    fn close(&self, handle: MemoryHandle) -> Result<(), Error> {
        debug!(path = %handle.path.display(), "memory engine closed");
        Ok(())
    }

    fn get(&self, handle: &MemoryHandle, key: &[u8]) -> Result<Option<ByteString>, Error> {
        Ok(handle.read()?.get(key).cloned())
    }

    fn set(&self, handle: &MemoryHandle, key: &[u8], value: &[u8]) -> Result<(), Error> {
        handle.write()?.insert(
            ByteString::copy_from_slice(key),
            ByteString::copy_from_slice(value),
        );
        Ok(())
    }

    fn remove(&self, handle: &MemoryHandle, key: &[u8]) -> Result<bool, Error> {
        Ok(handle.write()?.remove(key))
    }

    fn update(
        &self,
        handle: &MemoryHandle,
        key: &[u8],
        decide: &mut dyn FnMut(Option<&[u8]>) -> Result<RecordChange, Error>,
    ) -> Result<(), Error> {
        if !handle.writable {
            let table = handle.read()?;
            return match decide(table.get(key).map(ByteString::as_bytes))? {
                RecordChange::Keep => Ok(()),
                _ => Err(read_only(&handle.path)),
            };
        }
        let mut table = handle.write()?;
        let change = decide(table.get(key).map(ByteString::as_bytes))?;
        table.apply(key, change);
        Ok(())
    }

    fn view(
        &self,
        handle: &MemoryHandle,
        key: &[u8],
        inspect: &mut dyn FnMut(Option<&[u8]>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let table = handle.read()?;
        inspect(table.get(key).map(ByteString::as_bytes))
    }

    fn occupy(
        &self,
        handle: &MemoryHandle,
        writable: bool,
        f: &mut dyn FnMut(u64, u64) -> Result<(), Error>,
    ) -> Result<(), Error> {
        if writable {
            let table = handle.write()?;
            f(table.len(), table.bytes())
        } else {
            let table = handle.read()?;
            f(table.len(), table.bytes())
        }
    }

    fn first_key_from(
        &self,
        handle: &MemoryHandle,
        key: Option<&[u8]>,
    ) -> Result<Option<ByteString>, Error> {
        Ok(handle.read()?.first_from(key))
    }

    fn last_key_to(
        &self,
        handle: &MemoryHandle,
        key: Option<&[u8]>,
    ) -> Result<Option<ByteString>, Error> {
        Ok(handle.read()?.last_to(key))
    }

    fn next_key(&self, handle: &MemoryHandle, key: &[u8]) -> Result<Option<ByteString>, Error> {
        Ok(handle.read()?.after(key))
    }

    fn prev_key(&self, handle: &MemoryHandle, key: &[u8]) -> Result<Option<ByteString>, Error> {
        Ok(handle.read()?.before(key))
    }

    fn count(&self, handle: &MemoryHandle) -> Result<u64, Error> {
        Ok(handle.read()?.len())
    }

    fn size(&self, handle: &MemoryHandle) -> Result<u64, Error> {
        Ok(handle.read()?.bytes())
    }

    fn clear(&self, handle: &MemoryHandle) -> Result<(), Error> {
        handle.write()?.clear();
        Ok(())
    }

    fn synchronize(&self, _handle: &MemoryHandle, _hard: bool) -> Result<(), Error> {
        Ok(())
    }
}
