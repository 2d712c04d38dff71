//! Infrastructure implementations for bakeoff.
//!
//! sqlx/SQLite persistence, the append-only WAL file, the background replay
//! loop, and the concrete provider adaptors. Everything here implements trait
//! seams defined in `bakeoff-core`.

pub mod llm;
pub mod persist;
pub mod replay;
pub mod sqlite;
pub mod wal;
