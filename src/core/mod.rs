// Core modules: record types, visitor dispatch, cursors, engines, and errors.
pub mod bytes;
pub mod cursor;
pub mod database;
pub mod engine;
pub mod error;
mod matching;
pub mod memory;
pub mod mode;
pub mod runtime;
pub mod tree_file;
pub mod visitor;
