use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use versioned_store::{
    config::AppConfig, db, routes, services::storage_service::StorageService,
    storage::LocalFsBackend,
};

/// Name under which `--migrate` registers the storage directory.
const DEFAULT_LOCATION_NAME: &str = "local";

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting versioned-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }
    let storage_dir = fs::canonicalize(&cfg.storage_dir)
        .with_context(|| format!("resolving storage directory {}", cfg.storage_dir))?;

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let options = db::connect_options(
        SqliteConnectOptions::from_str(&cfg.database_url)
            .with_context(|| format!("parsing database URL {}", cfg.database_url))?,
    );

    // Create parent directory if needed
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    // --- Initialize core service ---
    let storage = StorageService::new(
        db.clone(),
        storage_dir.clone(),
        Arc::new(LocalFsBackend::new()),
        cfg.storage_classes.clone(),
    );

    // --- Handle migration mode ---
    if migrate {
        let mut conn = db.acquire().await?;
        db::run_migrations(&mut conn).await?;
        drop(conn);

        let root = format!("file://{}", storage_dir.display());
        let location = storage
            .ensure_default_location(DEFAULT_LOCATION_NAME, &root)
            .await?;
        tracing::info!(
            "Database migration complete; default location {} at {}",
            location.name,
            location.uri
        );
        return Ok(()); // exit after migration
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
