//! Shared setup for integration tests: a file-backed SQLite database and a
//! default location, both inside one temporary directory. The pool is sized
//! and tuned like the server's, so concurrent requests contend for real.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::sync::Arc;
use tempfile::TempDir;

use versioned_store::{
    config::StorageClassConfig, db, services::storage_service::StorageService,
    storage::LocalFsBackend,
};

pub struct TestService {
    pub service: StorageService,
    pub _dir: TempDir,
}

pub async fn service() -> TestService {
    let dir = tempfile::tempdir().expect("create temp dir");
    let objects = dir.path().join("objects");
    std::fs::create_dir_all(&objects).expect("create objects dir");

    let options = SqliteConnectOptions::new().filename(dir.path().join("meta.db"));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(db::connect_options(options))
        .await
        .expect("open sqlite pool");
    {
        let mut conn = pool.acquire().await.expect("acquire connection");
        db::run_migrations(&mut conn).await.expect("apply schema");
    }

    let service = StorageService::new(
        Arc::new(pool),
        objects.clone(),
        Arc::new(LocalFsBackend::new()),
        StorageClassConfig::default(),
    );
    service
        .ensure_default_location("local", &format!("file://{}", objects.display()))
        .await
        .expect("register default location");

    TestService { service, _dir: dir }
}
