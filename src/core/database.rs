//! Purpose: Database handle lifecycle and visitor dispatch over a storage engine.
//! Exports: `Database`, `MergeMode`, `Status`.
//! Role: Every record operation funnels through `accept`/`iterate`-style dispatch.
//! Invariants: Record operations require the Open state; otherwise `NotOpened`.
//! Invariants: Each public operation overwrites the handle's last-error slot.
//! Invariants: Closing bumps the session epoch, which disables every cursor.
//! Invariants: Visitors run while the session is read-locked; they must not close it.
//! Invariants: Read-only visits hold only shared engine locks, so they may read the same handle.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, warn};

use crate::core::bytes::{ByteString, Record};
use crate::core::cursor::Cursor;
use crate::core::engine::{RecordChange, StorageEngine};
use crate::core::error::{Error, ErrorKind};
use crate::core::matching::{compile_pattern, key_distance};
use crate::core::mode::OpenMode;
use crate::core::runtime;
use crate::core::visitor::{Getter, NOP, Remover, Setter, Visitor, VisitorAction, visit_fn};

pub(crate) struct OpenSession<H> {
    pub(crate) handle: H,
    pub(crate) path: PathBuf,
    pub(crate) mode: OpenMode,
}

pub(crate) struct SessionState<H> {
    pub(crate) open: Option<OpenSession<H>>,
    pub(crate) epoch: u64,
}

/// State shared between a database handle and the cursors it created.
pub(crate) struct Session<E: StorageEngine> {
    state: RwLock<SessionState<E::Handle>>,
    last_error: Mutex<Error>,
}

impl<E: StorageEngine> Session<E> {
    fn new() -> Self {
        Self {
            state: RwLock::new(SessionState {
                open: None,
                epoch: 0,
            }),
            last_error: Mutex::new(Error::success()),
        }
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, SessionState<E::Handle>>, Error> {
        self.state.read().map_err(|_| session_poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, SessionState<E::Handle>>, Error> {
        self.state.write().map_err(|_| session_poisoned())
    }

    /// Stores the outcome in the last-error slot and passes it through.
    pub(crate) fn record<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        let outcome = match &result {
            Ok(_) => Error::success(),
            Err(err) => err.clone(),
        };
        match self.last_error.lock() {
            Ok(mut slot) => *slot = outcome,
            Err(poisoned) => *poisoned.into_inner() = outcome,
        }
        result
    }

    fn last_error(&self) -> Error {
        match self.last_error.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn session_poisoned() -> Error {
    Error::new(ErrorKind::Internal).with_message("session lock poisoned")
}

pub(crate) fn not_opened() -> Error {
    Error::new(ErrorKind::NotOpened).with_message("database is not opened")
}

/// Runs one visitor against one key. Writable visits go through one engine
/// update; read-only visits only take the engine's shared lock.
/// Returns `true` when the visitor asked to stop.
pub(crate) fn visit_record<E, V>(
    engine: &E,
    session: &OpenSession<E::Handle>,
    key: &[u8],
    visitor: &mut V,
    allow_write: bool,
    visit_missing: bool,
) -> Result<bool, Error>
where
    E: StorageEngine,
    V: Visitor + ?Sized,
{
    let mut stopped = false;
    let mut decide = |current: Option<&[u8]>| -> Result<RecordChange, Error> {
        let action = match current {
            Some(value) => visitor.visit_existing(key, value),
            None if visit_missing => visitor.visit_missing(key),
            None => NOP,
        };
        if action.is_write() {
            if !allow_write {
                warn!(key = ?bstr::BStr::new(key), "visitor requested a write during a read-only visit");
                return Err(Error::new(ErrorKind::PermissionDenied)
                    .with_message("write requested during a read-only visit")
                    .with_key(key));
            }
            if !session.mode.is_writer() {
                return Err(Error::new(ErrorKind::PermissionDenied)
                    .with_message("database is opened read-only")
                    .with_key(key)
                    .with_path(&session.path));
            }
        }
        Ok(match action {
            VisitorAction::NoOperation => RecordChange::Keep,
            VisitorAction::Stop => {
                stopped = true;
                RecordChange::Keep
            }
            VisitorAction::Replace(value) => RecordChange::Put(value),
            VisitorAction::Remove if current.is_some() => RecordChange::Delete,
            VisitorAction::Remove => RecordChange::Keep,
        })
    };
    if allow_write {
        engine.update(&session.handle, key, &mut decide)?;
    } else {
        engine.view(&session.handle, key, &mut |current| decide(current).map(|_| ()))?;
    }
    Ok(stopped)
}

/// How `merge` writes each source record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergeMode {
    Set,
    Add,
    Replace,
    Append,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Status {
    pub path: PathBuf,
    pub mode: OpenMode,
    pub count: u64,
    pub size: u64,
}

/// Caller session against one engine database.
pub struct Database<E: StorageEngine> {
    engine: Arc<E>,
    session: Arc<Session<E>>,
}

impl<E: StorageEngine> Database<E> {
    pub fn new(engine: E) -> Self {
        Self::with_engine(Arc::new(engine))
    }

    /// Builds a handle over an engine shared with other handles.
    pub fn with_engine(engine: Arc<E>) -> Self {
        Self {
            engine,
            session: Arc::new(Session::new()),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn open(&self, path: impl AsRef<Path>, mode: OpenMode) -> Result<(), Error> {
        let result = self.open_inner(path.as_ref(), mode);
        self.session.record(result)
    }

    fn open_inner(&self, path: &Path, mode: OpenMode) -> Result<(), Error> {
        let mut state = self.session.write()?;
        if state.open.is_some() {
            return Err(Error::new(ErrorKind::AlreadyOpen)
                .with_message("database is already opened")
                .with_path(path));
        }
        mode.validate().map_err(|err| err.with_path(path))?;
        runtime::init();
        let handle = self.engine.open(path, mode).map_err(|err| match err.path() {
            Some(_) => err,
            None => err.with_path(path),
        })?;
        runtime::handle_opened();
        state.open = Some(OpenSession {
            handle,
            path: path.to_path_buf(),
            mode,
        });
        debug!(path = %path.display(), %mode, "database opened");
        Ok(())
    }

    pub fn close(&self) -> Result<(), Error> {
        let result = self.close_inner();
        self.session.record(result)
    }

    fn close_inner(&self) -> Result<(), Error> {
        let mut state = self.session.write()?;
        let open = state.open.take().ok_or_else(not_opened)?;
        state.epoch += 1;
        runtime::handle_closed();
        debug!(path = %open.path.display(), "database closed");
        self.engine.close(open.handle)
    }

    /// A poisoned session counts as open so `Drop` still attempts the close.
    pub fn is_open(&self) -> bool {
        match self.session.read() {
            Ok(state) => state.open.is_some(),
            Err(err) => {
                warn!(error = %err, "session lock poisoned; treating database as open");
                true
            }
        }
    }

    /// Most recent outcome recorded on this handle; `Success` after a
    /// successful operation.
    pub fn last_error(&self) -> Error {
        self.session.last_error()
    }

    /// Runs `f` against the open session and records the outcome.
    fn run<T>(
        &self,
        f: impl FnOnce(&E, &OpenSession<E::Handle>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let result = match self.session.read() {
            Ok(state) => match state.open.as_ref() {
                Some(open) => f(self.engine.as_ref(), open),
                None => Err(not_opened()),
            },
            Err(err) => Err(err),
        };
        self.session.record(result)
    }

    pub fn accept<V: Visitor + ?Sized>(
        &self,
        key: &[u8],
        visitor: &mut V,
        allow_write: bool,
    ) -> Result<(), Error> {
        self.run(|engine, open| {
            visit_record(engine, open, key, visitor, allow_write, true).map(|_| ())
        })
    }

    /// Visits `keys` in the given order, one atomic visit per key.
    pub fn accept_bulk<K, V>(&self, keys: &[K], visitor: &mut V, allow_write: bool) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: Visitor + ?Sized,
    {
        self.run(|engine, open| {
            for key in keys {
                visit_record(engine, open, key.as_ref(), visitor, allow_write, true)?;
            }
            Ok(())
        })
    }

    /// Visits every record in key order. Stops at the first error, keeping
    /// actions already applied, or successfully on `VisitorAction::Stop`.
    pub fn iterate<V: Visitor + ?Sized>(&self, visitor: &mut V, allow_write: bool) -> Result<(), Error> {
        self.run(|engine, open| {
            let mut next = engine.first_key_from(&open.handle, None)?;
            while let Some(key) = next {
                if visit_record(engine, open, &key, visitor, allow_write, false)? {
                    debug!("iteration stopped by visitor");
                    break;
                }
                next = engine.next_key(&open.handle, &key)?;
            }
            Ok(())
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<ByteString>, Error> {
        let mut getter = Getter::default();
        self.accept(key, &mut getter, false)?;
        Ok(getter.value)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut setter = Setter {
            value: ByteString::copy_from_slice(value),
        };
        self.accept(key, &mut setter, true)
    }

    pub fn remove(&self, key: &[u8]) -> Result<bool, Error> {
        let mut remover = Remover::default();
        self.accept(key, &mut remover, true)?;
        Ok(remover.existed)
    }

    /// Writable visit of `key` driven by a closure over the current value.
    fn accept_fn(
        &self,
        key: &[u8],
        mut visit: impl FnMut(Option<&[u8]>) -> VisitorAction,
    ) -> Result<(), Error> {
        let mut visitor = visit_fn(|_key: &[u8], current: Option<&[u8]>| visit(current));
        self.accept(key, &mut visitor, true)
    }

    /// Inserts only when `key` is absent.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut duplicate = false;
        self.accept_fn(key, |current| match current {
            Some(_) => {
                duplicate = true;
                NOP
            }
            None => VisitorAction::replace(value),
        })?;
        if duplicate {
            return self.session.record(Err(Error::new(ErrorKind::DuplicateRecord)
                .with_message("record already exists")
                .with_key(key)));
        }
        Ok(())
    }

    /// Overwrites only when `key` is present.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut missing = false;
        self.accept_fn(key, |current| match current {
            Some(_) => VisitorAction::replace(value),
            None => {
                missing = true;
                NOP
            }
        })?;
        if missing {
            return self.session.record(Err(no_record(key)));
        }
        Ok(())
    }

    /// Concatenates `value` onto the stored value, creating it when absent.
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.accept_fn(key, |current| match current {
            Some(existing) => VisitorAction::replace([existing, value].concat()),
            None => VisitorAction::replace(value),
        })
    }

    /// Compare-and-swap. `old == None` requires absence; `new == None` removes.
    pub fn cas(&self, key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>) -> Result<(), Error> {
        let mut matched = false;
        self.accept_fn(key, |current| {
            if current != old {
                return NOP;
            }
            matched = true;
            match new {
                Some(value) => VisitorAction::replace(value),
                None => VisitorAction::Remove,
            }
        })?;
        if !matched {
            return self.session.record(Err(Error::new(ErrorKind::Logic)
                .with_message("status conflict")
                .with_key(key)));
        }
        Ok(())
    }

    /// Adds `num` to an 8-byte big-endian counter, starting from `orig` when
    /// the key is absent. Returns the new value.
    pub fn increment(&self, key: &[u8], num: i64, orig: i64) -> Result<i64, Error> {
        let mut outcome: Result<i64, Error> = Err(Error::new(ErrorKind::Internal));
        self.accept_fn(key, |current| {
            let base = match current {
                None => Ok(orig),
                Some(bytes) => counter_bytes(bytes, key).map(i64::from_be_bytes),
            };
            outcome = base.and_then(|base| {
                base.checked_add(num).ok_or_else(|| {
                    Error::new(ErrorKind::Logic)
                        .with_message("counter overflow")
                        .with_key(key)
                })
            });
            match &outcome {
                Ok(value) => VisitorAction::replace(&value.to_be_bytes()),
                Err(_) => NOP,
            }
        })?;
        self.session.record(outcome)
    }

    /// Floating-point counterpart of `increment`, stored as big-endian IEEE-754.
    pub fn increment_double(&self, key: &[u8], num: f64, orig: f64) -> Result<f64, Error> {
        let mut outcome: Result<f64, Error> = Err(Error::new(ErrorKind::Internal));
        self.accept_fn(key, |current| {
            outcome = match current {
                None => Ok(orig + num),
                Some(bytes) => counter_bytes(bytes, key).map(|raw| f64::from_be_bytes(raw) + num),
            };
            match &outcome {
                Ok(value) => VisitorAction::replace(&value.to_be_bytes()),
                Err(_) => NOP,
            }
        })?;
        self.session.record(outcome)
    }

    /// Length of the stored value, without copying it out.
    pub fn check(&self, key: &[u8]) -> Result<Option<usize>, Error> {
        let mut len = None;
        let mut visitor = visit_fn(|_key: &[u8], current: Option<&[u8]>| {
            len = current.map(<[u8]>::len);
            NOP
        });
        self.accept(key, &mut visitor, false)?;
        Ok(len)
    }

    /// Returns and removes the value in one visit.
    pub fn seize(&self, key: &[u8]) -> Result<ByteString, Error> {
        let mut taken = None;
        let mut visitor = visit_fn(|_key: &[u8], current: Option<&[u8]>| match current {
            Some(value) => {
                taken = Some(ByteString::copy_from_slice(value));
                VisitorAction::Remove
            }
            None => NOP,
        });
        self.accept(key, &mut visitor, true)?;
        match taken {
            Some(value) => Ok(value),
            None => self.session.record(Err(no_record(key))),
        }
    }

    /// Present records among `keys`, in the order requested.
    pub fn get_bulk<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<Vec<Record>, Error> {
        let mut found = Vec::new();
        let mut visitor = visit_fn(|key: &[u8], current: Option<&[u8]>| {
            if let Some(value) = current {
                found.push(Record::new(key, value));
            }
            NOP
        });
        self.accept_bulk(keys, &mut visitor, false)?;
        Ok(found)
    }

    pub fn set_bulk<K, V>(&self, records: &[(K, V)]) -> Result<usize, Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.run(|engine, open| {
            for (key, value) in records {
                let mut setter = Setter {
                    value: ByteString::copy_from_slice(value.as_ref()),
                };
                visit_record(engine, open, key.as_ref(), &mut setter, true, true)?;
            }
            Ok(records.len())
        })
    }

    /// Removes each present key; returns how many existed.
    pub fn remove_bulk<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<usize, Error> {
        let mut removed = 0usize;
        let mut visitor = visit_fn(|_key: &[u8], current: Option<&[u8]>| match current {
            Some(_) => {
                removed += 1;
                VisitorAction::Remove
            }
            None => NOP,
        });
        self.accept_bulk(keys, &mut visitor, true)?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), Error> {
        self.run(|engine, open| {
            if !open.mode.is_writer() {
                return Err(Error::new(ErrorKind::PermissionDenied)
                    .with_message("database is opened read-only")
                    .with_path(&open.path));
            }
            engine.clear(&open.handle)
        })
    }

    pub fn count(&self) -> Result<u64, Error> {
        self.run(|engine, open| engine.count(&open.handle))
    }

    pub fn size(&self) -> Result<u64, Error> {
        self.run(|engine, open| engine.size(&open.handle))
    }

    pub fn path(&self) -> Result<PathBuf, Error> {
        self.run(|_, open| Ok(open.path.clone()))
    }

    pub fn mode(&self) -> Result<OpenMode, Error> {
        self.run(|_, open| Ok(open.mode))
    }

    pub fn status(&self) -> Result<Status, Error> {
        self.run(|engine, open| {
            Ok(Status {
                path: open.path.clone(),
                mode: open.mode,
                count: engine.count(&open.handle)?,
                size: engine.size(&open.handle)?,
            })
        })
    }

    /// Flushes engine state; `hard` also forces it to stable storage.
    pub fn synchronize(&self, hard: bool) -> Result<(), Error> {
        self.run(|engine, open| {
            debug!(path = %open.path.display(), hard, "synchronize");
            engine.synchronize(&open.handle, hard)
        })
    }

    /// Keys starting with `prefix`, in order, up to `max` of them.
    pub fn match_prefix(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<ByteString>, Error> {
        self.run(|engine, open| {
            let limit = max.unwrap_or(usize::MAX);
            let mut keys = Vec::new();
            let mut next = engine.first_key_from(&open.handle, Some(prefix))?;
            while let Some(key) = next {
                if keys.len() >= limit || !key.starts_with(prefix) {
                    break;
                }
                next = engine.next_key(&open.handle, &key)?;
                keys.push(key);
            }
            Ok(keys)
        })
    }

    /// Keys the regular expression matches, in order, up to `max` of them.
    pub fn match_regex(&self, pattern: &str, max: Option<usize>) -> Result<Vec<ByteString>, Error> {
        self.run(|engine, open| {
            let regex = compile_pattern(pattern)?;
            let limit = max.unwrap_or(usize::MAX);
            let mut keys = Vec::new();
            let mut next = engine.first_key_from(&open.handle, None)?;
            while let Some(key) = next {
                if keys.len() >= limit {
                    break;
                }
                next = engine.next_key(&open.handle, &key)?;
                if regex.is_match(&key) {
                    keys.push(key);
                }
            }
            Ok(keys)
        })
    }

    /// Keys within edit distance `range` of `origin`, nearest first and then
    /// in key order. `utf` measures distance in characters instead of bytes.
    pub fn match_similar(
        &self,
        origin: &[u8],
        range: usize,
        utf: bool,
        max: Option<usize>,
    ) -> Result<Vec<ByteString>, Error> {
        self.run(|engine, open| {
            let mut found = Vec::new();
            let mut next = engine.first_key_from(&open.handle, None)?;
            while let Some(key) = next {
                next = engine.next_key(&open.handle, &key)?;
                let distance = key_distance(origin, &key, utf);
                if distance <= range {
                    found.push((distance, key));
                }
            }
            // Scan order is key order, so a stable sort keeps keys ordered within a distance.
            found.sort_by_key(|(distance, _)| *distance);
            found.truncate(max.unwrap_or(usize::MAX));
            Ok(found.into_iter().map(|(_, key)| key).collect())
        })
    }

    /// Runs `f(path, count, size)` with the whole database locked, exclusively
    /// when `writable`. Only a non-writable `f` may read this handle.
    pub fn occupy<T>(&self, writable: bool, f: impl FnOnce(&Path, u64, u64) -> T) -> Result<T, Error> {
        self.run(|engine, open| {
            let mut f = Some(f);
            let mut output = None;
            engine.occupy(&open.handle, writable, &mut |count, size| {
                if let Some(f) = f.take() {
                    output = Some(f(&open.path, count, size));
                }
                Ok(())
            })?;
            output.ok_or_else(|| {
                Error::new(ErrorKind::Internal).with_message("engine did not run the occupy callback")
            })
        })
    }

    /// Read-only scan over every record.
    pub fn each(&self, mut f: impl FnMut(&[u8], &[u8])) -> Result<(), Error> {
        let mut visitor = visit_fn(|key: &[u8], value: Option<&[u8]>| {
            if let Some(value) = value {
                f(key, value);
            }
            NOP
        });
        self.iterate(&mut visitor, false)
    }

    pub fn each_key(&self, mut f: impl FnMut(&[u8])) -> Result<(), Error> {
        self.each(|key, _| f(key))
    }

    pub fn each_value(&self, mut f: impl FnMut(&[u8])) -> Result<(), Error> {
        self.each(|_, value| f(value))
    }

    /// Copies every record of `sources` into this database, one record at a
    /// time through a cursor on each source.
    pub fn merge<S: StorageEngine>(
        &self,
        sources: &[&Database<S>],
        mode: MergeMode,
    ) -> Result<(), Error> {
        let result = sources.iter().try_for_each(|source| {
            source.cursor_process(|cursor| {
                cursor.jump(None)?;
                while let Some(record) = cursor.get(false)? {
                    let outcome = match mode {
                        MergeMode::Set => self.set(&record.key, &record.value),
                        MergeMode::Add => self.add(&record.key, &record.value),
                        MergeMode::Replace => self.replace(&record.key, &record.value),
                        MergeMode::Append => self.append(&record.key, &record.value),
                    };
                    match outcome {
                        Err(err)
                            if matches!(
                                err.kind(),
                                ErrorKind::DuplicateRecord | ErrorKind::KeyNotFound
                            ) => {}
                        other => other?,
                    }
                    cursor.step()?;
                }
                Ok(())
            })
        });
        self.session.record(result)
    }

    pub fn cursor(&self) -> Cursor<E> {
        Cursor::new(Arc::clone(&self.engine), Arc::clone(&self.session))
    }

    /// Runs `f` with a fresh cursor, disabling it on every exit path.
    pub fn cursor_process<T>(&self, f: impl FnOnce(&mut Cursor<E>) -> Result<T, Error>) -> Result<T, Error> {
        let mut cursor = self.cursor();
        let result = f(&mut cursor);
        cursor.disable();
        result
    }
}

impl<E: StorageEngine> Drop for Database<E> {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close_inner() {
                warn!(error = %err, "failed to close database on drop");
            }
        }
    }
}

fn no_record(key: &[u8]) -> Error {
    Error::new(ErrorKind::KeyNotFound)
        .with_message("no record")
        .with_key(key)
}

fn counter_bytes(bytes: &[u8], key: &[u8]) -> Result<[u8; 8], Error> {
    <[u8; 8]>::try_from(bytes).map_err(|_| {
        Error::new(ErrorKind::Logic)
            .with_message("stored value is not an 8-byte counter")
            .with_key(key)
    })
}

#[cfg(test)]
mod tests {
    use super::{Database, MergeMode};
    use crate::core::bytes::{ByteString, Record};
    use crate::core::error::ErrorKind;
    use crate::core::memory::MemoryEngine;
    use crate::core::mode::OpenMode;
    use crate::core::visitor::{NOP, Visitor, VisitorAction, visit_fn};

    fn writer() -> Database<MemoryEngine> {
        let db = Database::new(MemoryEngine::new());
        db.open("casket", OpenMode::WRITER | OpenMode::CREATE)
            .expect("open");
        db
    }

    #[derive(Default)]
    struct Recorder {
        existing: Vec<(Vec<u8>, Vec<u8>)>,
        missing: Vec<Vec<u8>>,
    }

    impl Visitor for Recorder {
        fn visit_existing(&mut self, key: &[u8], value: &[u8]) -> VisitorAction {
            self.existing.push((key.to_vec(), value.to_vec()));
            NOP
        }

        fn visit_missing(&mut self, key: &[u8]) -> VisitorAction {
            self.missing.push(key.to_vec());
            NOP
        }
    }

    #[test]
    fn closed_handle_rejects_record_operations() {
        let db = writer();
        db.close().expect("close");
        assert_eq!(db.get(b"k").expect_err("get").kind(), ErrorKind::NotOpened);
        assert_eq!(db.set(b"k", b"v").expect_err("set").kind(), ErrorKind::NotOpened);
        assert_eq!(db.remove(b"k").expect_err("remove").kind(), ErrorKind::NotOpened);
        assert_eq!(db.count().expect_err("count").kind(), ErrorKind::NotOpened);
        let mut recorder = Recorder::default();
        assert_eq!(
            db.iterate(&mut recorder, false).expect_err("iterate").kind(),
            ErrorKind::NotOpened
        );
        assert_eq!(db.last_error().kind(), ErrorKind::NotOpened);
    }

    #[test]
    fn double_open_and_double_close() {
        let db = writer();
        let err = db.open("casket", OpenMode::READER).expect_err("already open");
        assert_eq!(err.kind(), ErrorKind::AlreadyOpen);
        db.close().expect("first close");
        assert_eq!(db.close().expect_err("second close").kind(), ErrorKind::NotOpened);
    }

    #[test]
    fn invalid_mode_is_rejected_before_engine() {
        let db = Database::new(MemoryEngine::new());
        let err = db
            .open("casket", OpenMode::READER | OpenMode::CREATE)
            .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::InvalidMode);
        assert!(!db.is_open());
    }

    #[test]
    fn last_error_resets_on_success() {
        let db = writer();
        db.replace(b"absent", b"v").expect_err("replace missing");
        assert_eq!(db.last_error().kind(), ErrorKind::KeyNotFound);
        db.set(b"k", b"v").expect("set");
        assert!(db.last_error().is_success());
    }

    #[test]
    fn last_error_is_per_handle() {
        let engine = std::sync::Arc::new(MemoryEngine::new());
        let first = Database::with_engine(engine.clone());
        let second = Database::with_engine(engine);
        first
            .open("shared", OpenMode::WRITER | OpenMode::CREATE)
            .expect("open first");
        second.open("shared", OpenMode::READER).expect("open second");

        second.set(b"k", b"v").expect_err("reader cannot write");
        assert_eq!(second.last_error().kind(), ErrorKind::PermissionDenied);
        assert!(first.last_error().is_success());
    }

    #[test]
    fn replace_on_missing_key_inserts() {
        let db = writer();
        let mut visitor = visit_fn(|_, _| VisitorAction::replace("fresh"));
        db.accept(b"new", &mut visitor, true).expect("accept");
        assert_eq!(db.get(b"new").expect("get"), Some(ByteString::from("fresh")));

        let mut visitor = visit_fn(|_, _| NOP);
        db.accept(b"other", &mut visitor, true).expect("accept");
        assert_eq!(db.get(b"other").expect("get"), None);
    }

    #[test]
    fn read_only_visit_refuses_writes() {
        let db = writer();
        db.set(b"k", b"v").expect("set");
        for action in [VisitorAction::replace("w"), VisitorAction::Remove] {
            let mut visitor = visit_fn(|_, _| action.clone());
            let err = db.accept(b"k", &mut visitor, false).expect_err("read-only");
            assert_eq!(err.kind(), ErrorKind::PermissionDenied);
            assert_eq!(db.get(b"k").expect("get"), Some(ByteString::from("v")));
        }
    }

    #[test]
    fn remove_on_missing_key_is_noop() {
        let db = writer();
        let mut visitor = visit_fn(|_, _| VisitorAction::Remove);
        db.accept(b"ghost", &mut visitor, true).expect("accept");
        assert_eq!(db.count().expect("count"), 0);
        assert!(!db.remove(b"ghost").expect("remove"));
    }

    #[test]
    fn iterate_applies_actions_in_key_order() {
        let db = writer();
        db.set_bulk(&[("b", "2"), ("a", "1"), ("c", "3")]).expect("set bulk");
        let mut order = Vec::new();
        let mut visitor = visit_fn(|key, value| {
            order.push(key.to_vec());
            match (key, value) {
                (b"b", _) => VisitorAction::Remove,
                (_, Some(value)) => VisitorAction::replace([value, &b"!"[..]].concat()),
                (_, None) => NOP,
            }
        });
        db.iterate(&mut visitor, true).expect("iterate");
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(db.get(b"a").expect("get"), Some(ByteString::from("1!")));
        assert_eq!(db.get(b"b").expect("get"), None);
        assert_eq!(db.get(b"c").expect("get"), Some(ByteString::from("3!")));
    }

    #[test]
    fn iterate_stops_on_sentinel() {
        let db = writer();
        db.set_bulk(&[("a", "1"), ("b", "2"), ("c", "3")]).expect("set bulk");
        let mut seen = 0;
        let mut visitor = visit_fn(|key, _| {
            seen += 1;
            if key == b"b" { VisitorAction::Stop } else { NOP }
        });
        db.iterate(&mut visitor, false).expect("stop is success");
        assert_eq!(seen, 2);
    }

    #[test]
    fn iterate_stops_at_first_error() {
        let db = writer();
        db.set_bulk(&[("a", "1"), ("b", "2"), ("c", "3")]).expect("set bulk");
        let mut seen = Vec::new();
        let mut visitor = visit_fn(|key, _| {
            seen.push(key.to_vec());
            if key == b"b" { VisitorAction::Remove } else { NOP }
        });
        let err = db.iterate(&mut visitor, false).expect_err("write in read-only scan");
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(db.count().expect("count"), 3);
    }

    #[test]
    fn counters_and_conditional_writes() {
        let db = writer();
        assert_eq!(db.increment(b"n", 5, 10).expect("inc"), 15);
        assert_eq!(db.increment(b"n", -3, 0).expect("inc"), 12);
        db.set(b"text", b"abc").expect("set");
        assert_eq!(db.increment(b"text", 1, 0).expect_err("not a counter").kind(), ErrorKind::Logic);
        assert_eq!(db.get(b"text").expect("get"), Some(ByteString::from("abc")));

        assert_eq!(db.increment_double(b"d", 1.5, 0.0).expect("incd"), 1.5);
        assert_eq!(db.increment_double(b"d", 1.0, 0.0).expect("incd"), 2.5);

        db.add(b"a", b"1").expect("add");
        assert_eq!(db.add(b"a", b"2").expect_err("dup").kind(), ErrorKind::DuplicateRecord);
        db.append(b"a", b"23").expect("append");
        assert_eq!(db.get(b"a").expect("get"), Some(ByteString::from("123")));

        db.cas(b"a", Some(&b"123"[..]), Some(&b"x"[..])).expect("cas");
        assert_eq!(
            db.cas(b"a", Some(&b"123"[..]), None).expect_err("stale").kind(),
            ErrorKind::Logic
        );
        db.cas(b"a", Some(&b"x"[..]), None).expect("cas remove");
        db.cas(b"a", None, Some(&b"y"[..])).expect("cas insert");
        assert_eq!(db.check(b"a").expect("check"), Some(1));
        assert_eq!(db.check(b"zz").expect("check"), None);

        assert_eq!(db.seize(b"a").expect("seize"), ByteString::from("y"));
        assert_eq!(db.seize(b"a").expect_err("gone").kind(), ErrorKind::KeyNotFound);
    }

    #[test]
    fn bulk_operations_and_prefix_scan() {
        let db = writer();
        db.set_bulk(&[("user:1", "a"), ("user:2", "b"), ("post:1", "c")]).expect("set bulk");
        let found = db.get_bulk(&["user:2", "nope", "post:1"]).expect("get bulk");
        assert_eq!(found, vec![Record::new("user:2", "b"), Record::new("post:1", "c")]);

        let keys = db.match_prefix(b"user:", None).expect("prefix");
        assert_eq!(keys, vec![ByteString::from("user:1"), ByteString::from("user:2")]);
        assert_eq!(db.match_prefix(b"user:", Some(1)).expect("prefix").len(), 1);

        assert_eq!(db.remove_bulk(&["user:1", "nope"]).expect("remove bulk"), 1);
        assert_eq!(db.count().expect("count"), 2);
        assert_eq!(db.size().expect("size"), 7 + 1 + 6 + 1);

        db.clear().expect("clear");
        assert_eq!(db.count().expect("count"), 0);
    }

    #[test]
    fn merge_modes() {
        let engine = std::sync::Arc::new(MemoryEngine::new());
        let target = Database::with_engine(engine.clone());
        target
            .open("target", OpenMode::WRITER | OpenMode::CREATE)
            .expect("open target");
        target.set(b"shared", b"old").expect("set");

        let source = Database::with_engine(engine);
        source
            .open("source", OpenMode::WRITER | OpenMode::CREATE)
            .expect("open source");
        source.set(b"shared", b"new").expect("set");
        source.set(b"only", b"src").expect("set");

        target.merge(&[&source], MergeMode::Add).expect("merge add");
        assert_eq!(target.get(b"shared").expect("get"), Some(ByteString::from("old")));
        assert_eq!(target.get(b"only").expect("get"), Some(ByteString::from("src")));

        target.merge(&[&source], MergeMode::Set).expect("merge set");
        assert_eq!(target.get(b"shared").expect("get"), Some(ByteString::from("new")));
    }

    #[test]
    fn poisoned_session_still_counts_as_open() {
        let db = writer();
        let session = std::sync::Arc::clone(&db.session);
        let _ = std::thread::spawn(move || {
            let _guard = session.state.write().expect("session lock");
            panic!("poison the session lock");
        })
        .join();
        assert!(db.is_open());
        assert_eq!(db.count().expect_err("poisoned").kind(), ErrorKind::Internal);
    }

    #[test]
    fn read_only_visits_can_read_the_same_handle() {
        let db = writer();
        db.set_bulk(&[("a", "1"), ("b", "2")]).expect("set bulk");
        let mut copied = Vec::new();
        db.each(|key, _| {
            copied.push(db.get(key).expect("nested get"));
        })
        .expect("each");
        assert_eq!(
            copied,
            vec![Some(ByteString::from("1")), Some(ByteString::from("2"))]
        );
        assert_eq!(db.check(b"a").expect("check"), Some(1));
    }

    #[test]
    fn concurrent_reads_share_the_engine() {
        let db = std::sync::Arc::new(writer());
        db.set(b"k", b"v").expect("set");
        let (tx, rx) = std::sync::mpsc::channel();
        let mut visitor = visit_fn(|_, _| {
            let reader = std::sync::Arc::clone(&db);
            let tx = tx.clone();
            std::thread::spawn(move || {
                let _ = tx.send(reader.get(b"k").map(|value| value.is_some()));
            });
            let seen = rx
                .recv_timeout(std::time::Duration::from_secs(5))
                .expect("reader thread finished while visit was running");
            assert!(seen.expect("get"));
            NOP
        });
        db.accept(b"k", &mut visitor, false).expect("accept");
    }

    #[test]
    fn regex_and_similarity_scans() {
        let db = writer();
        db.set_bulk(&[
            ("apple", "1"),
            ("apply", "2"),
            ("ample", "3"),
            ("user:10", "4"),
            ("user:7", "5"),
            ("zebra", "6"),
        ])
        .expect("set bulk");

        let keys = db.match_regex("^user:[0-9]+$", None).expect("regex");
        assert_eq!(keys, vec![ByteString::from("user:10"), ByteString::from("user:7")]);
        assert_eq!(db.match_regex("pl", Some(1)).expect("regex"), vec![ByteString::from("ample")]);
        assert_eq!(
            db.match_regex("[", None).expect_err("bad pattern").kind(),
            ErrorKind::Logic
        );
        assert_eq!(db.last_error().kind(), ErrorKind::Logic);

        let similar = db.match_similar(b"apple", 1, false, None).expect("similar");
        assert_eq!(
            similar,
            vec![
                ByteString::from("apple"),
                ByteString::from("ample"),
                ByteString::from("apply"),
            ]
        );
        let nearest = db.match_similar(b"appl", 2, true, Some(2)).expect("similar");
        assert_eq!(nearest, vec![ByteString::from("apple"), ByteString::from("apply")]);
    }

    #[test]
    fn occupy_locks_whole_database() {
        let db = writer();
        db.set_bulk(&[("a", "1"), ("bb", "22")]).expect("set bulk");
        let (count, size) = db
            .occupy(false, |path, count, size| {
                assert_eq!(path, std::path::Path::new("casket"));
                assert_eq!(db.get(b"a").expect("read inside"), Some(ByteString::from("1")));
                (count, size)
            })
            .expect("occupy");
        assert_eq!((count, size), (2, 6));
        assert_eq!(db.occupy(true, |_, count, _| count).expect("occupy"), 2);

        let engine = db.engine().clone();
        let reader = Database::with_engine(engine);
        reader.open("casket", OpenMode::READER).expect("open reader");
        let err = reader.occupy(true, |_, _, _| ()).expect_err("reader");
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn each_helpers_do_not_mutate() {
        let db = writer();
        db.set_bulk(&[("k1", "v1"), ("k2", "v2")]).expect("set bulk");
        let mut keys = Vec::new();
        db.each_key(|key| keys.push(key.to_vec())).expect("each key");
        let mut values = Vec::new();
        db.each_value(|value| values.push(value.to_vec())).expect("each value");
        assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec()]);
        assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec()]);
    }
}
