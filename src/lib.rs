//! Versioned object-storage metadata engine.
//!
//! Buckets hold keyed objects whose every write becomes a new version; a
//! version references an immutable file instance whose bytes live under a
//! registered location. Metadata is kept in SQLite.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod mimetype;
pub mod models;
pub mod routes;
pub mod services;
pub mod storage;
