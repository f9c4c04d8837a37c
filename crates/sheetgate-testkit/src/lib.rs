//! Test doubles for sheetgate.
//!
//! - [`InMemorySheets`]: a [`SheetsBackend`](sheetgate::SheetsBackend) holding
//!   objects in memory, recording every call and failing on demand
//! - [`MemorySnapshots`]: a [`SnapshotService`](sheetgate::SnapshotService)
//!   that copies objects out of an [`InMemorySheets`] and back
//! - [`ObjectBuilder`] and grid helpers for fixtures

#![allow(clippy::missing_panics_doc)]

pub mod backend;
pub mod fixtures;
pub mod snapshots;

pub use backend::{Fault, FaultScope, InMemorySheets, MemoryObject, MemorySheet, RecordedCall};
pub use fixtures::{ObjectBuilder, grid, ints, row, text};
pub use snapshots::MemorySnapshots;
