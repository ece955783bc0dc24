//! # nearhelp-store
//!
//! Durable storage for the coordination engine: help requests and their
//! chat messages, backed by SQLite.  Lifecycle transitions are exposed as
//! atomic conditional updates keyed on the current status, which is the
//! per-record mutual-exclusion primitive the accept/expire race relies on.
//!
//! The crate exposes a synchronous `Database` handle wrapping a
//! `rusqlite::Connection` with typed CRUD helpers; the server holds it
//! behind an async mutex.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod requests;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
