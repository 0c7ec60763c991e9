//! Registry of named storage roots.

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::{
    errors::{StorageError, StorageResult, map_unique},
    models::location::Location,
};

const LOCATION_NAME_MAX_LEN: usize = 20;

const LOCATION_COLUMNS: &str = "name, uri, is_default, created, updated";

/// Creates and resolves [`Location`]s.
#[derive(Clone, Debug, Default)]
pub struct LocationRegistry;

impl LocationRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Validate location name format.
    ///
    /// A lowercase letter followed by up to 19 lowercase letters, digits or
    /// underscores.
    fn ensure_name_valid(name: &str) -> StorageResult<()> {
        let mut chars = name.chars();
        let starts_with_letter = matches!(chars.next(), Some('a'..='z'));
        if !starts_with_letter
            || name.len() > LOCATION_NAME_MAX_LEN
            || !chars.all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
        {
            return Err(StorageError::Validation(format!(
                "invalid location name `{}`",
                name
            )));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        uri: &str,
        default: bool,
    ) -> StorageResult<Location> {
        Self::ensure_name_valid(name)?;
        let now = Utc::now();
        let location = Location {
            name: name.to_string(),
            uri: uri.to_string(),
            default,
            created: now,
            updated: now,
        };

        sqlx::query(
            "INSERT INTO locations (name, uri, is_default, created, updated)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&location.name)
        .bind(&location.uri)
        .bind(location.default)
        .bind(location.created)
        .bind(location.updated)
        .execute(&mut *conn)
        .await
        .map_err(|err| map_unique(err, format!("location `{}` already exists", name)))?;

        tracing::info!("registered location {} at {}", location.name, location.uri);
        Ok(location)
    }

    pub async fn get_by_name(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> StorageResult<Option<Location>> {
        let location = sqlx::query_as::<_, Location>(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(location)
    }

    /// The single location flagged as default.
    ///
    /// Returns `None` when no location, or more than one, claims the flag.
    pub async fn get_default(
        &self,
        conn: &mut SqliteConnection,
    ) -> StorageResult<Option<Location>> {
        let mut candidates = sqlx::query_as::<_, Location>(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations WHERE is_default = 1 LIMIT 2"
        ))
        .fetch_all(&mut *conn)
        .await?;

        if candidates.len() == 1 {
            Ok(candidates.pop())
        } else {
            Ok(None)
        }
    }

    /// All locations ordered by name.
    pub async fn all(&self, conn: &mut SqliteConnection) -> StorageResult<Vec<Location>> {
        let locations = sqlx::query_as::<_, Location>(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations ORDER BY name ASC"
        ))
        .fetch_all(&mut *conn)
        .await?;
        Ok(locations)
    }

    /// Resolve `name`, falling back to the default location.
    pub async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        name: Option<&str>,
    ) -> StorageResult<Location> {
        match name {
            Some(name) => self
                .get_by_name(conn, name)
                .await?
                .ok_or_else(|| StorageError::LocationNotFound(name.to_string())),
            None => self
                .get_default(conn)
                .await?
                .ok_or_else(|| StorageError::LocationNotFound("<default>".into())),
        }
    }
}
