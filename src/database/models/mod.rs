pub mod migration;
pub mod organization;

pub use migration::{CollectionProgress, MigrationOptions, MigrationRecord, MigrationRow, MigrationStatus};
pub use organization::{Organization, OrganizationRow};
