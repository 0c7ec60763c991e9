//! Named storage roots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// A named storage root content is written beneath.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Location {
    /// Identity: lowercase letter followed by up to 19 lowercase letters, digits or underscores.
    pub name: String,

    /// Storage root URI (e.g. `file:///var/data`).
    pub uri: String,

    /// Whether this location claims to be the default one.
    #[sqlx(rename = "is_default")]
    pub default: bool,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
