//! Purpose: Shared library crate used by the `cabinet` CLI and tests.
//! Exports: `api` (databases, cursors, visitors, engines, errors).
//! Role: Visitor-based access layer over pluggable ordered key-value engines.
//! Invariants: `api` is the only public path; `core` stays crate-private.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
mod core;
