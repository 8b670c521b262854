// Single-file ordered engine: snapshot format, advisory locking, and repair.
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use fs2::FileExt;
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::bytes::ByteString;
use crate::core::engine::{RecordChange, StorageEngine};
use crate::core::error::{Error, ErrorKind};
use crate::core::memory::{Table, poisoned, read_only};
use crate::core::mode::OpenMode;

const MAGIC: [u8; 4] = *b"KCTB";
const VERSION: u32 = 1;
const ENDIANNESS_LE: u8 = 1;
const HEADER_SIZE: usize = 64;
const RECORD_PREFIX: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct TreeHeader {
    count: u64,
    payload_len: u64,
    digest: [u8; 32],
}

impl TreeHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8] = ENDIANNESS_LE;
        write_u64(&mut buf, 16, self.count);
        write_u64(&mut buf, 24, self.payload_len);
        buf[32..64].copy_from_slice(&self.digest);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corruption).with_message("header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corruption).with_message("bad magic"));
        }
        let version = u32::from_le_bytes(read_4(buf, 4));
        if version != VERSION {
            return Err(Error::new(ErrorKind::Corruption).with_message("unsupported version"));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corruption).with_message("unsupported endianness"));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&buf[32..64]);
        Ok(Self {
            count: read_u64(buf, 16),
            payload_len: read_u64(buf, 24),
            digest,
        })
    }
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn encode_table(table: &Table) -> Vec<u8> {
    let capacity = table.bytes() as usize + table.len() as usize * RECORD_PREFIX;
    let mut payload = Vec::with_capacity(capacity);
    for (key, value) in table.iter() {
        payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        payload.extend_from_slice(key);
        payload.extend_from_slice(value);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(&payload));
    let header = TreeHeader {
        count: table.len(),
        payload_len: payload.len() as u64,
        digest,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&payload);
    out
}

/// Result of decoding a file image: the records recovered and whether the
/// payload was damaged past them.
#[derive(Debug)]
struct Decoded {
    table: Table,
    damaged: Option<&'static str>,
}

fn decode_table(buf: &[u8]) -> Result<Decoded, Error> {
    let header = TreeHeader::decode(buf)?;
    let available = &buf[HEADER_SIZE..];
    let mut damaged = None;
    let payload = match usize::try_from(header.payload_len) {
        Ok(len) if len <= available.len() => &available[..len],
        _ => {
            damaged = Some("payload truncated");
            available
        }
    };
    if damaged.is_none() && Sha256::digest(payload).as_slice() != &header.digest[..] {
        damaged = Some("payload digest mismatch");
    }

    let mut table = Table::default();
    let mut offset = 0usize;
    while offset < payload.len() {
        let Some((key, value, next)) = read_record(payload, offset) else {
            damaged.get_or_insert("malformed record");
            break;
        };
        table.insert(key, value);
        offset = next;
    }
    if damaged.is_none() && table.len() != header.count {
        damaged = Some("record count mismatch");
    }
    Ok(Decoded { table, damaged })
}

fn read_record(payload: &[u8], offset: usize) -> Option<(ByteString, ByteString, usize)> {
    let prefix = payload.get(offset..offset.checked_add(RECORD_PREFIX)?)?;
    let key_len = u32::from_le_bytes(read_4(prefix, 0)) as usize;
    let value_len = u32::from_le_bytes(read_4(prefix, 4)) as usize;
    let key_start = offset + RECORD_PREFIX;
    let value_start = key_start.checked_add(key_len)?;
    let end = value_start.checked_add(value_len)?;
    let key = payload.get(key_start..value_start)?;
    let value = payload.get(value_start..end)?;
    Some((
        ByteString::copy_from_slice(key),
        ByteString::copy_from_slice(value),
        end,
    ))
}

/// Open file plus the advisory lock held for the handle's lifetime.
#[derive(Debug)]
struct LockedFile {
    file: File,
    locked: bool,
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if self.locked {
            let _ = FileExt::unlock(&self.file);
        }
    }
}

fn acquire(file: File, mode: OpenMode, path: &Path) -> Result<LockedFile, Error> {
    if mode.contains(OpenMode::NO_LOCK) {
        return Ok(LockedFile {
            file,
            locked: false,
        });
    }
    // Qualified calls: std's inherent `File` locks shadow fs2 under method syntax.
    let result = match (mode.is_writer(), mode.contains(OpenMode::TRY_LOCK)) {
        (true, false) => FileExt::lock_exclusive(&file),
        (true, true) => FileExt::try_lock_exclusive(&file),
        (false, false) => FileExt::lock_shared(&file),
        (false, true) => FileExt::try_lock_shared(&file),
    };
    result.map_err(|err| {
        Error::from_io(err, path).with_message("failed to lock database file")
    })?;
    Ok(LockedFile { file, locked: true })
}

#[derive(Debug)]
struct FileState {
    table: Table,
    dirty: bool,
}

#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    mode: OpenMode,
    file: LockedFile,
    state: RwLock<FileState>,
}

impl FileHandle {
    fn read(&self) -> Result<RwLockReadGuard<'_, FileState>, Error> {
        self.state.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, FileState>, Error> {
        if !self.mode.is_writer() {
            return Err(read_only(&self.path));
        }
        self.state.write().map_err(|_| poisoned())
    }

    fn persist(&self, state: &mut FileState, hard: bool) -> Result<(), Error> {
        let image = encode_table(&state.table);
        let mut file = &self.file.file;
        let io = |err: std::io::Error| {
            Error::from_io(err, &self.path).with_message("failed to write database file")
        };
        file.seek(SeekFrom::Start(0)).map_err(io)?;
        file.write_all(&image).map_err(io)?;
        file.set_len(image.len() as u64).map_err(io)?;
        file.flush().map_err(io)?;
        if hard {
            file.sync_all().map_err(io)?;
        }
        state.dirty = false;
        Ok(())
    }

    /// Marks a mutation and writes it through when the mode asks for it.
    fn after_write(&self, state: &mut FileState) -> Result<(), Error> {
        state.dirty = true;
        let sync = self.mode.contains(OpenMode::AUTO_SYNC);
        if sync || self.mode.contains(OpenMode::AUTO_TRANSACTION) {
            self.persist(state, sync)?;
        }
        Ok(())
    }
}

/// Engine persisting each database as one `.kct` snapshot file.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileEngine;

impl FileEngine {
    pub fn new() -> Self {
        FileEngine
    }
}

impl StorageEngine for FileEngine {
    type Handle = FileHandle;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<FileHandle, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode.is_writer())
            .create(mode.contains(OpenMode::CREATE))
            .open(path)
            .map_err(|err| Error::from_io(err, path).with_message("failed to open database file"))?;
        let file = acquire(file, mode, path)?;
        // Truncation happens under the lock so readers never see a half-empty file.
        if mode.contains(OpenMode::TRUNCATE) {
            file.file
                .set_len(0)
                .map_err(|err| Error::from_io(err, path).with_message("failed to truncate"))?;
        }

        let len = file
            .file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::from_io(err, path))?;

        let (table, dirty) = if len == 0 {
            (Table::default(), mode.is_writer())
        } else {
            let mmap = unsafe { Mmap::map(&file.file).map_err(|err| Error::from_io(err, path))? };
            let decoded = decode_table(&mmap).map_err(|err| err.with_path(path))?;
            match decoded.damaged {
                None => (decoded.table, false),
                Some(reason) if mode.contains(OpenMode::NO_REPAIR) => {
                    return Err(Error::new(ErrorKind::Corruption)
                        .with_message(reason)
                        .with_path(path)
                        .with_hint("Reopen without norepair to keep the intact records."));
                }
                Some(reason) => {
                    warn!(
                        path = %path.display(),
                        reason,
                        recovered = decoded.table.len(),
                        "repaired damaged database file"
                    );
                    (decoded.table, mode.is_writer())
                }
            }
        };

        let handle = FileHandle {
            path: path.to_path_buf(),
            mode,
            file,
            state: RwLock::new(FileState { table, dirty }),
        };
        if dirty {
            let mut state = handle.write()?;
            handle.persist(&mut state, false)?;
        }
        debug!(path = %path.display(), %mode, "file engine opened");
        Ok(handle)
    }

    fn close(&self, handle: FileHandle) -> Result<(), Error> {
        let result = if handle.mode.is_writer() {
            match handle.state.write() {
                Ok(mut state) if state.dirty => handle.persist(&mut state, false),
                Ok(_) => Ok(()),
                Err(_) => Err(poisoned()),
            }
        } else {
            Ok(())
        };
        debug!(path = %handle.path.display(), ok = result.is_ok(), "file engine closed");
        drop(handle);
        result
    }

    fn get(&self, handle: &FileHandle, key: &[u8]) -> Result<Option<ByteString>, Error> {
        Ok(handle.read()?.table.get(key).cloned())
    }

    fn set(&self, handle: &FileHandle, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut state = handle.write()?;
        state.table.insert(
            ByteString::copy_from_slice(key),
            ByteString::copy_from_slice(value),
        );
        handle.after_write(&mut state)
    }

    fn remove(&self, handle: &FileHandle, key: &[u8]) -> Result<bool, Error> {
        let mut state = handle.write()?;
        if !state.table.remove(key) {
            return Ok(false);
        }
        handle.after_write(&mut state)?;
        Ok(true)
    }

    fn update(
        &self,
        handle: &FileHandle,
        key: &[u8],
        decide: &mut dyn FnMut(Option<&[u8]>) -> Result<RecordChange, Error>,
    ) -> Result<(), Error> {
        if !handle.mode.is_writer() {
            let state = handle.read()?;
            return match decide(state.table.get(key).map(ByteString::as_bytes))? {
                RecordChange::Keep => Ok(()),
                _ => Err(read_only(&handle.path)),
            };
        }
        let mut state = handle.write()?;
        let change = decide(state.table.get(key).map(ByteString::as_bytes))?;
        if state.table.apply(key, change) {
            handle.after_write(&mut state)?;
        }
        Ok(())
    }

    fn view(
        &self,
        handle: &FileHandle,
        key: &[u8],
        inspect: &mut dyn FnMut(Option<&[u8]>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let state = handle.read()?;
        inspect(state.table.get(key).map(ByteString::as_bytes))
    }

    fn occupy(
        &self,
        handle: &FileHandle,
        writable: bool,
        f: &mut dyn FnMut(u64, u64) -> Result<(), Error>,
    ) -> Result<(), Error> {
        if writable {
            let mut state = handle.write()?;
            f(state.table.len(), state.table.bytes())?;
            if state.dirty {
                handle.persist(&mut state, false)?;
            }
            Ok(())
        } else {
            let state = handle.read()?;
            f(state.table.len(), state.table.bytes())
        }
    }

    fn first_key_from(
        &self,
        handle: &FileHandle,
        key: Option<&[u8]>,
    ) -> Result<Option<ByteString>, Error> {
        Ok(handle.read()?.table.first_from(key))
    }

    fn last_key_to(
        &self,
        handle: &FileHandle,
        key: Option<&[u8]>,
    ) -> Result<Option<ByteString>, Error> {
        Ok(handle.read()?.table.last_to(key))
    }

    fn next_key(&self, handle: &FileHandle, key: &[u8]) -> Result<Option<ByteString>, Error> {
        Ok(handle.read()?.table.after(key))
    }

    fn prev_key(&self, handle: &FileHandle, key: &[u8]) -> Result<Option<ByteString>, Error> {
        Ok(handle.read()?.table.before(key))
    }

    fn count(&self, handle: &FileHandle) -> Result<u64, Error> {
        Ok(handle.read()?.table.len())
    }

    fn size(&self, handle: &FileHandle) -> Result<u64, Error> {
        Ok(handle.read()?.table.bytes())
    }

    fn clear(&self, handle: &FileHandle) -> Result<(), Error> {
        let mut state = handle.write()?;
        state.table.clear();
        handle.after_write(&mut state)
    }

    fn synchronize(&self, handle: &FileHandle, hard: bool) -> Result<(), Error> {
        if !handle.mode.is_writer() {
            return Ok(());
        }
        let mut state = handle.write()?;
        if state.dirty || hard {
            handle.persist(&mut state, hard)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FileEngine, HEADER_SIZE, decode_table, encode_table};
    use crate::core::bytes::ByteString;
    use crate::core::engine::StorageEngine;
    use crate::core::error::ErrorKind;
    use crate::core::memory::Table;
    use crate::core::mode::OpenMode;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    fn sample() -> Table {
        let mut table = Table::default();
        table.insert(ByteString::from("bar"), ByteString::from("step"));
        table.insert(ByteString::from("baz"), ByteString::from("jump"));
        table.insert(ByteString::from("foo"), ByteString::from("hop"));
        table
    }

    #[test]
    fn image_decodes_cleanly() {
        let image = encode_table(&sample());
        let decoded = decode_table(&image).expect("decode");
        assert!(decoded.damaged.is_none());
        assert_eq!(decoded.table.len(), 3);
        assert_eq!(decoded.table.get(b"baz"), Some(&ByteString::from("jump")));
    }

    #[test]
    fn truncated_image_keeps_intact_prefix() {
        let image = encode_table(&sample());
        let cut = &image[..image.len() - 2];
        let decoded = decode_table(cut).expect("decode");
        assert_eq!(decoded.damaged, Some("payload truncated"));
        assert_eq!(decoded.table.len(), 2);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut image = encode_table(&sample());
        image[0..4].copy_from_slice(b"NOPE");
        let err = decode_table(&image).expect_err("bad magic");
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("casket.kct");
        let engine = FileEngine::new();
        let handle = engine
            .open(&path, OpenMode::WRITER | OpenMode::CREATE)
            .expect("create");
        engine.set(&handle, b"foo", b"hop").expect("set");
        engine.set(&handle, b"bar", b"step").expect("set");
        engine.close(handle).expect("close");

        let handle = engine.open(&path, OpenMode::READER).expect("reopen");
        assert_eq!(engine.count(&handle).expect("count"), 2);
        assert_eq!(
            engine.get(&handle, b"foo").expect("get"),
            Some(ByteString::from("hop"))
        );
        engine.close(handle).expect("close");
    }

    #[test]
    fn damaged_payload_respects_norepair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("casket.kct");
        let engine = FileEngine::new();
        let handle = engine
            .open(&path, OpenMode::WRITER | OpenMode::CREATE)
            .expect("create");
        engine.set(&handle, b"foo", b"hop").expect("set");
        engine.close(handle).expect("close");

        let mut file = OpenOptions::new().write(true).open(&path).expect("open raw");
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 8)).expect("seek");
        file.write_all(b"X").expect("scribble");
        file.flush().expect("flush");
        drop(file);

        let err = engine
            .open(&path, OpenMode::WRITER | OpenMode::NO_REPAIR)
            .expect_err("norepair");
        assert_eq!(err.kind(), ErrorKind::Corruption);

        let handle = engine.open(&path, OpenMode::WRITER).expect("repair");
        assert_eq!(engine.count(&handle).expect("count"), 1);
        engine.close(handle).expect("close");

        let handle = engine
            .open(&path, OpenMode::READER | OpenMode::NO_REPAIR)
            .expect("repaired file is clean");
        engine.close(handle).expect("close");
    }

    #[test]
    fn try_lock_reports_contention() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("casket.kct");
        let engine = FileEngine::new();
        let writer = engine
            .open(&path, OpenMode::WRITER | OpenMode::CREATE)
            .expect("writer");

        let err = engine
            .open(&path, OpenMode::READER | OpenMode::TRY_LOCK)
            .expect_err("locked");
        assert_eq!(err.kind(), ErrorKind::LockContention);

        engine.close(writer).expect("close");
        let reader = engine
            .open(&path, OpenMode::READER | OpenMode::TRY_LOCK)
            .expect("unlocked");
        engine.close(reader).expect("close");
    }

    #[test]
    fn missing_file_without_create_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = FileEngine::new()
            .open(&dir.path().join("absent.kct"), OpenMode::READER)
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
