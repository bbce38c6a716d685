use serde::{Deserialize, Serialize};

use crate::config::MigrationConfig;
use crate::database::manager::{DatabaseError, DatabaseManager};

/// One logical collection (entity type) copied during a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub table: String,
    /// Column holding the owning organization id
    pub org_column: String,
}

impl CollectionSpec {
    pub fn new(name: &str, table: &str, org_column: &str) -> Result<Self, DatabaseError> {
        for ident in [name, table, org_column] {
            if !DatabaseManager::is_valid_db_name(ident) {
                return Err(DatabaseError::InvalidIdentifier(ident.to_string()));
            }
        }
        Ok(Self {
            name: name.to_string(),
            table: table.to_string(),
            org_column: org_column.to_string(),
        })
    }
}

/// Ordered set of collections that make up an organization's data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionCatalog {
    collections: Vec<CollectionSpec>,
}

const DEFAULT_COLLECTIONS: &[(&str, &str, &str)] = &[
    ("users", "users", "org_id"),
    ("persons", "persons", "org_id"),
    ("invites", "invites", "org_id"),
    ("contacts", "contacts", "org_id"),
    ("companies", "companies", "org_id"),
    ("offices", "offices", "org_id"),
    ("projects", "projects", "org_id"),
    ("estimates", "estimates", "org_id"),
    ("cost_codes", "cost_codes", "org_id"),
    ("crews", "crews", "org_id"),
    ("legal_acceptances", "legal_acceptances", "org_id"),
    ("event_logs", "event_logs", "org_id"),
];

impl CollectionCatalog {
    pub fn new(collections: Vec<CollectionSpec>) -> Self {
        Self { collections }
    }

    pub fn builtin() -> Self {
        let collections = DEFAULT_COLLECTIONS
            .iter()
            .map(|(name, table, org)| CollectionSpec {
                name: name.to_string(),
                table: table.to_string(),
                org_column: org.to_string(),
            })
            .collect();
        Self { collections }
    }

    /// Parse "name[:table[:org_column]]" entries separated by commas
    pub fn parse(spec: &str) -> Result<Self, DatabaseError> {
        let mut collections = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.split(':');
            let name = parts.next().unwrap_or_default();
            let table = parts.next().unwrap_or(name);
            let org_column = parts.next().unwrap_or("org_id");
            let spec = CollectionSpec::new(name, table, org_column)?;
            if collections.iter().any(|c: &CollectionSpec| c.name == spec.name) {
                return Err(DatabaseError::InvalidIdentifier(format!("duplicate collection '{}'", spec.name)));
            }
            collections.push(spec);
        }
        if collections.is_empty() {
            return Err(DatabaseError::InvalidIdentifier("empty collection catalog".to_string()));
        }
        Ok(Self { collections })
    }

    pub fn from_config(config: &MigrationConfig) -> Result<Self, DatabaseError> {
        match config.collections.as_deref() {
            Some(spec) => Self::parse(spec),
            None => Ok(Self::builtin()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollectionSpec> {
        self.collections.iter()
    }

    pub fn get(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}
