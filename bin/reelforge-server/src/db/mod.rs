//! Database layer.
//!
//! Session snapshots are persisted through the core's
//! [`reelforge_core::SessionStore`] trait; [`sqlite::SqliteStore`] is the
//! implementation the server uses.

pub mod sqlite;
