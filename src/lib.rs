//! # monodb - Embedded Single-File Document Database
//!
//! monodb stores schemaless documents in one on-disk file with crash-safe
//! durability. It targets mobile and constrained devices: no external
//! process, a bounded memory footprint, and a binary layout that is stable
//! across independent implementations.
//!
//! ## Quick Start
//!
//! ```ignore
//! use monodb::{doc, Database};
//!
//! let mut db = Database::open("./app.mono")?;
//! let mut users = db.collection("users")?;
//!
//! users.insert_one(doc! { "name" => "Alice", "age" => 30 })?;
//! let alice = users.find_one(&doc! { "name" => "Alice" })?;
//!
//! users.create_index(&doc! { "age" => 1 }, false)?;
//! db.flush()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------+
//! |        Public API (Database)        |
//! +-------------------------------------+
//! |  Collections  |  Filter / Update    |
//! +---------------+---------------------+
//! |  Catalog  |  Index Manager (B+Tree) |
//! +-------------------------------------+
//! |     Document Codec (Value model)    |
//! +-------------------------------------+
//! |  Slotted Pages  |  Page Cache       |
//! +-------------------------------------+
//! |      Pager + Write-Ahead Log        |
//! +-------------------------------------+
//! ```
//!
//! ## File Layout
//!
//! ```text
//! app.mono       # 64-byte header + contiguous 4096-byte pages
//! app.mono.wal   # append-only redo log, checkpointed and truncated
//! ```
//!
//! ## Durability Model
//!
//! Every mutation is logged before the data file is touched; structural
//! mutations sync the log first. A crash at any point is healed on the
//! next open by replaying log records past the last checkpoint. `flush`
//! makes everything durable and checkpoints the log.
//!
//! ## Concurrency
//!
//! The engine is single-threaded cooperative: one logical owner per
//! database handle, one mutation in flight at a time. Collection handles
//! borrow the database exclusively, so the borrow checker enforces the
//! ownership model at compile time.
//!
//! ## Module Overview
//!
//! - [`storage`]: pages, slotted records, WAL, pager, cache
//! - [`btree`]: persistent B+Tree with unique and non-unique variants
//! - [`document`]: value model, ordered documents, codec, ObjectId
//! - [`query`]: filter and update interpreters
//! - [`catalog`]: persisted collection and index directory
//! - [`collection`] / [`database`]: the user-facing surface

pub mod btree;
pub mod catalog;
pub mod collection;
pub mod database;
pub mod document;
pub mod error;
pub mod index;
pub mod query;
pub mod storage;

pub use collection::{Collection, UpdateResult, MAX_BATCH_SIZE, MAX_DOCUMENT_SIZE};
pub use database::{Database, DatabaseBuilder};
pub use document::{Document, ObjectId, Value};
pub use error::DbError;
