//! Core data records of the metadata engine.
//!
//! These are plain rows: relationships are foreign-key fields resolved
//! through the corresponding service, never live object graphs. They map
//! to database tables via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod bucket;
pub mod bucket_tag;
pub mod file_instance;
pub mod location;
pub mod object_version;
