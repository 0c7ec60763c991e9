use anyhow::{Context, Result};
use clap::Parser;
use std::{collections::BTreeSet, env};

use crate::errors::{StorageError, StorageResult};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub storage_classes: StorageClassConfig,
}

/// Storage classes buckets may be created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageClassConfig {
    pub allowed: BTreeSet<String>,
    pub default: String,
}

impl StorageClassConfig {
    /// Build a config, rejecting a default that is not itself allowed.
    pub fn new<I, S>(allowed: I, default: impl Into<String>) -> StorageResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: BTreeSet<String> = allowed.into_iter().map(Into::into).collect();
        let default = default.into();
        if !allowed.contains(&default) {
            return Err(StorageError::Validation(format!(
                "default storage class `{}` is not one of {:?}",
                default, allowed
            )));
        }
        Ok(Self { allowed, default })
    }

    pub fn is_allowed(&self, class: &str) -> bool {
        self.allowed.contains(class)
    }
}

impl Default for StorageClassConfig {
    /// `S` (standard) and `A` (archive), defaulting to `S`.
    fn default() -> Self {
        Self {
            allowed: ["S", "A"].into_iter().map(String::from).collect(),
            default: "S".into(),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Versioned object-storage metadata service")]
pub struct Args {
    /// Host to bind to (overrides VSTORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides VSTORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory backing the default location (overrides VSTORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides VSTORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Comma-separated allowed storage classes (overrides VSTORE_STORAGE_CLASSES)
    #[arg(long)]
    pub storage_classes: Option<String>,

    /// Storage class for buckets created without one (overrides VSTORE_DEFAULT_STORAGE_CLASS)
    #[arg(long)]
    pub default_storage_class: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("VSTORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("VSTORE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing VSTORE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading VSTORE_PORT"),
        };
        let env_storage =
            env::var("VSTORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("VSTORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/versioned_store.db".into());
        let env_classes = env::var("VSTORE_STORAGE_CLASSES").unwrap_or_else(|_| "S,A".into());
        let env_default_class =
            env::var("VSTORE_DEFAULT_STORAGE_CLASS").unwrap_or_else(|_| "S".into());

        // --- Merge ---
        let classes = args.storage_classes.unwrap_or(env_classes);
        let storage_classes = StorageClassConfig::new(
            parse_class_list(&classes),
            args.default_storage_class.unwrap_or(env_default_class),
        )
        .context("validating storage class configuration")?;

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            storage_classes,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_class_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
