// Structured error type shared by databases, cursors, engines, and the CLI.
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bstr::ByteSlice;
use libc::{EACCES, EPERM};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Success,
    NotOpened,
    AlreadyOpen,
    InvalidMode,
    PermissionDenied,
    CursorInvalid,
    KeyNotFound,
    DuplicateRecord,
    Logic,
    Usage,
    Io,
    Corruption,
    LockContention,
    Internal,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Success => "Success",
            ErrorKind::NotOpened => "NotOpened",
            ErrorKind::AlreadyOpen => "AlreadyOpen",
            ErrorKind::InvalidMode => "InvalidMode",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::CursorInvalid => "CursorInvalid",
            ErrorKind::KeyNotFound => "KeyNotFound",
            ErrorKind::DuplicateRecord => "DuplicateRecord",
            ErrorKind::Logic => "Logic",
            ErrorKind::Usage => "Usage",
            ErrorKind::Io => "Io",
            ErrorKind::Corruption => "Corruption",
            ErrorKind::LockContention => "LockContention",
            ErrorKind::Internal => "Internal",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    key: Option<Vec<u8>>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            key: None,
            source: None,
        }
    }

    pub fn success() -> Self {
        Self::new(ErrorKind::Success)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_success(&self) -> bool {
        self.kind == ErrorKind::Success
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.key = Some(key.as_ref().to_vec());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Wraps an I/O failure, classifying lock and permission errors.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        Error::new(io_error_kind(&err))
            .with_path(path)
            .with_source(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.name())?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(key) = &self.key {
            write!(f, " (key: {:?})", key.as_bstr())?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub(crate) fn io_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::PermissionDenied;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::LockContention,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => ErrorKind::Io,
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Success => 0,
        ErrorKind::Internal => 1,
        ErrorKind::Usage | ErrorKind::InvalidMode => 2,
        ErrorKind::KeyNotFound => 3,
        ErrorKind::DuplicateRecord => 4,
        ErrorKind::LockContention => 5,
        ErrorKind::PermissionDenied => 6,
        ErrorKind::Corruption => 7,
        ErrorKind::Io => 8,
        ErrorKind::NotOpened | ErrorKind::AlreadyOpen | ErrorKind::CursorInvalid => 9,
        ErrorKind::Logic => 10,
    }
}
