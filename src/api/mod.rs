//! Purpose: Define the stable public Rust API boundary for Cabinet.
//! Exports: Database and cursor handles, the visitor protocol, engines, and errors.
//! Role: Public, additive-only surface; hides internal storage modules.
//! Invariants: This module is the only public path to storage primitives.
//! Invariants: Internal modules remain private and are not directly exposed.

pub use crate::core::bytes::{ByteString, Record};
pub use crate::core::cursor::{Cursor, CursorPosition};
pub use crate::core::database::{Database, MergeMode, Status};
pub use crate::core::engine::{RecordChange, StorageEngine};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::memory::{MemoryEngine, MemoryHandle};
pub use crate::core::mode::OpenMode;
pub use crate::core::runtime;
pub use crate::core::tree_file::{FileEngine, FileHandle};
pub use crate::core::visitor::{FnVisitor, NOP, Visitor, VisitorAction, visit_fn};

/// Database over a `.kct` file.
pub type FileDatabase = Database<FileEngine>;

/// Volatile database; contents live as long as the engine instance.
pub type MemoryDatabase = Database<MemoryEngine>;
