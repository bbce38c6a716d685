use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::manager::DatabaseError;
use crate::types::{DatastoreKind, DatastoreLocation};

/// The organization fields the migration workflow reads and writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub legal_hold: bool,
    pub archived_at: Option<DateTime<Utc>>,
    /// Active datastore pointer consulted by the tenant routing layer
    pub datastore: DatastoreLocation,
    /// Set while a cutover is in flight; the routing layer refuses writes
    pub write_frozen: bool,
    pub last_migrated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
pub struct OrganizationRow {
    pub id: String,
    pub name: String,
    pub legal_hold: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub datastore_kind: String,
    pub database_uri: Option<String>,
    pub database_name: Option<String>,
    pub write_frozen: bool,
    pub last_migrated_at: Option<DateTime<Utc>>,
}

impl OrganizationRow {
    /// Shared organizations usually have no uri of their own and inherit the shared location
    pub fn into_organization(self, shared: &DatastoreLocation) -> Result<Organization, DatabaseError> {
        let kind = DatastoreKind::parse(&self.datastore_kind).ok_or_else(|| {
            DatabaseError::QueryError(format!("invalid datastore_kind '{}'", self.datastore_kind))
        })?;
        let datastore = match (kind, self.database_uri) {
            (DatastoreKind::Shared, None) => shared.clone(),
            (kind, Some(uri)) => DatastoreLocation::new(kind, uri, self.database_name),
            (DatastoreKind::Dedicated, None) => {
                return Err(DatabaseError::QueryError(format!(
                    "organization {} is dedicated but has no database_uri",
                    self.id
                )))
            }
        };
        Ok(Organization {
            id: self.id,
            name: self.name,
            legal_hold: self.legal_hold,
            archived_at: self.archived_at,
            datastore,
            write_frozen: self.write_frozen,
            last_migrated_at: self.last_migrated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(kind: &str, uri: Option<&str>) -> OrganizationRow {
        OrganizationRow {
            id: "42".into(),
            name: "Acme Co".into(),
            legal_hold: false,
            archived_at: None,
            datastore_kind: kind.into(),
            database_uri: uri.map(String::from),
            database_name: Some("tenant_42".into()),
            write_frozen: false,
            last_migrated_at: None,
        }
    }

    #[test]
    fn shared_org_without_uri_inherits_shared_location() {
        let shared = DatastoreLocation::new(DatastoreKind::Shared, "postgres://db/x", Some("shared_main".into()));
        let org = row("shared", None).into_organization(&shared).unwrap();
        assert_eq!(org.datastore, shared);
    }

    #[test]
    fn dedicated_org_requires_uri() {
        let shared = DatastoreLocation::new(DatastoreKind::Shared, "postgres://db/x", None);
        assert!(row("dedicated", None).into_organization(&shared).is_err());
        let org = row("dedicated", Some("postgres://tenant-db/x")).into_organization(&shared).unwrap();
        assert_eq!(org.datastore.kind, DatastoreKind::Dedicated);
        assert_eq!(org.datastore.db_name.as_deref(), Some("tenant_42"));
    }
}
