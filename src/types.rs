/// Shared types used across the codebase

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an organization's data physically lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatastoreKind {
    Shared,
    Dedicated,
}

impl DatastoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatastoreKind::Shared => "shared",
            DatastoreKind::Dedicated => "dedicated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "shared" => Some(DatastoreKind::Shared),
            "dedicated" => Some(DatastoreKind::Dedicated),
            _ => None,
        }
    }
}

/// Direction of a tenant migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationDirection {
    SharedToDedicated,
    DedicatedToShared,
}

impl MigrationDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationDirection::SharedToDedicated => "shared_to_dedicated",
            MigrationDirection::DedicatedToShared => "dedicated_to_shared",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "shared_to_dedicated" => Some(MigrationDirection::SharedToDedicated),
            "dedicated_to_shared" => Some(MigrationDirection::DedicatedToShared),
            _ => None,
        }
    }

    /// Direction implied by the kind of datastore being moved to
    pub fn towards(target: DatastoreKind) -> Self {
        match target {
            DatastoreKind::Dedicated => MigrationDirection::SharedToDedicated,
            DatastoreKind::Shared => MigrationDirection::DedicatedToShared,
        }
    }

    pub fn source_kind(&self) -> DatastoreKind {
        match self {
            MigrationDirection::SharedToDedicated => DatastoreKind::Shared,
            MigrationDirection::DedicatedToShared => DatastoreKind::Dedicated,
        }
    }

    pub fn target_kind(&self) -> DatastoreKind {
        match self {
            MigrationDirection::SharedToDedicated => DatastoreKind::Dedicated,
            MigrationDirection::DedicatedToShared => DatastoreKind::Shared,
        }
    }
}

/// Physical location of a datastore. When `db_name` is set it replaces the
/// database path of `uri`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreLocation {
    pub kind: DatastoreKind,
    pub uri: String,
    pub db_name: Option<String>,
}

impl DatastoreLocation {
    pub fn new(kind: DatastoreKind, uri: impl Into<String>, db_name: Option<String>) -> Self {
        Self {
            kind,
            uri: uri.into(),
            db_name,
        }
    }

    /// Full connection URL with the database name applied
    pub fn connection_url(&self) -> Result<String, url::ParseError> {
        let mut url = url::Url::parse(&self.uri)?;
        if let Some(db_name) = self.db_name.as_deref().filter(|name| !name.is_empty()) {
            url.set_path(&format!("/{}", db_name));
        }
        Ok(url.into())
    }

    /// Two locations address the same physical database
    pub fn same_database(&self, other: &DatastoreLocation) -> bool {
        match (self.connection_url(), other.connection_url()) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.uri == other.uri && self.db_name == other.db_name,
        }
    }
}

impl fmt::Display for DatastoreLocation {
    // Never prints credentials embedded in the URI
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = url::Url::parse(&self.uri)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "?".to_string());
        let db = self.db_name.as_deref().unwrap_or("-");
        write!(f, "{}://{}/{}", self.kind.as_str(), host, db)
    }
}

/// Capabilities checked by the authorization gate in front of the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    MigrateTenants,
}

/// The authenticated caller, as far as the migration service cares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Option<String>,
    pub role: Option<String>,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            id: None,
            role: Some("system".to_string()),
        }
    }
}
