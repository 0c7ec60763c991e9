//! Services implementing the metadata engine.
//!
//! Each component is a repository over `&mut SqliteConnection`, so callers
//! decide the transaction boundaries. [`storage_service::StorageService`]
//! wraps them for the HTTP layer, one transaction per request.

pub mod bucket_manager;
pub mod bucket_tag_store;
pub mod file_instance_store;
pub mod location_registry;
pub mod object_version_index;
pub mod storage_service;

#[cfg(test)]
pub(crate) mod testing;
