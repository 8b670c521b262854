//! Purpose: Resolve CLI database refs to `.kct` file paths.
//! Exports: `default_db_dir` and `resolve_db_path`.
//! Role: Keep name-to-path semantics in one place for every command.
//! Invariants: Default directory is `$CABINET_DIR`, else `~/.cabinet`.
//! Invariants: Bare names gain the `.kct` extension; refs with a separator are paths.

use std::path::{Path, PathBuf};

pub(crate) const DB_EXTENSION: &str = "kct";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum DbRefError {
    Empty,
}

pub(crate) fn default_db_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CABINET_DIR").filter(|dir| !dir.is_empty()) {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".cabinet")
}

pub(crate) fn resolve_db_path(db_ref: &str, db_dir: &Path) -> Result<PathBuf, DbRefError> {
    if db_ref.trim().is_empty() {
        return Err(DbRefError::Empty);
    }
    if db_ref.contains(std::path::MAIN_SEPARATOR) || db_ref.contains('/') {
        return Ok(PathBuf::from(db_ref));
    }
    if Path::new(db_ref).extension().is_some_and(|ext| ext == DB_EXTENSION) {
        return Ok(db_dir.join(db_ref));
    }
    Ok(db_dir.join(format!("{db_ref}.{DB_EXTENSION}")))
}
