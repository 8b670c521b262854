//! Purpose: Define the storage capability consumed by databases and cursors.
//! Exports: `StorageEngine`, `RecordChange`.
//! Role: The only seam to persistence; the access layer never touches files itself.
//! Invariants: `update` runs lookup, decision, and write-back under one engine lock.
//! Invariants: `view` runs under a shared lock, so nested reads never block on it.
//! Invariants: Key navigation is by value, so callers re-resolve positions each call.
use std::path::Path;

use crate::core::bytes::ByteString;
use crate::core::error::Error;
use crate::core::mode::OpenMode;

/// Write-back selected while an engine holds a record locked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordChange {
    Keep,
    Put(ByteString),
    Delete,
}

pub trait StorageEngine: Send + Sync {
    type Handle: Send + Sync;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Handle, Error>;

    /// Releases engine resources; the handle is consumed even on failure.
    fn close(&self, handle: Self::Handle) -> Result<(), Error>;

    fn get(&self, handle: &Self::Handle, key: &[u8]) -> Result<Option<ByteString>, Error>;

    fn set(&self, handle: &Self::Handle, key: &[u8], value: &[u8]) -> Result<(), Error>;

    fn remove(&self, handle: &Self::Handle, key: &[u8]) -> Result<bool, Error>;

    /// Atomically looks up `key`, asks `decide` what to do, and applies it.
    /// When `decide` fails nothing is written and its error is returned.
    fn update(
        &self,
        handle: &Self::Handle,
        key: &[u8],
        decide: &mut dyn FnMut(Option<&[u8]>) -> Result<RecordChange, Error>,
    ) -> Result<(), Error>;

    /// Shows the current value of `key` to `inspect` under a shared lock.
    fn view(
        &self,
        handle: &Self::Handle,
        key: &[u8],
        inspect: &mut dyn FnMut(Option<&[u8]>) -> Result<(), Error>,
    ) -> Result<(), Error>;

    /// Holds the whole database locked (exclusively when `writable`) while `f`
    /// runs with the record count and byte size.
    fn occupy(
        &self,
        handle: &Self::Handle,
        writable: bool,
        f: &mut dyn FnMut(u64, u64) -> Result<(), Error>,
    ) -> Result<(), Error>;

    /// First key `>= key`, or the first key overall.
    fn first_key_from(
        &self,
        handle: &Self::Handle,
        key: Option<&[u8]>,
    ) -> Result<Option<ByteString>, Error>;

    /// Last key `<= key`, or the last key overall.
    fn last_key_to(
        &self,
        handle: &Self::Handle,
        key: Option<&[u8]>,
    ) -> Result<Option<ByteString>, Error>;

    /// Smallest key strictly greater than `key`.
    fn next_key(&self, handle: &Self::Handle, key: &[u8]) -> Result<Option<ByteString>, Error>;

    /// Largest key strictly less than `key`.
    fn prev_key(&self, handle: &Self::Handle, key: &[u8]) -> Result<Option<ByteString>, Error>;

    fn count(&self, handle: &Self::Handle) -> Result<u64, Error>;

    /// Sum of key and value lengths.
    fn size(&self, handle: &Self::Handle) -> Result<u64, Error>;

    fn clear(&self, handle: &Self::Handle) -> Result<(), Error>;

    fn synchronize(&self, handle: &Self::Handle, hard: bool) -> Result<(), Error>;
}
