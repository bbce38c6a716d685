pub mod catalog;
pub mod datastore;
pub mod manager;
pub mod models;
pub mod postgres;
pub mod store;

pub use catalog::{CollectionCatalog, CollectionSpec};
pub use datastore::{Datastore, DatastoreProvider, PgDatastore, PgDatastoreProvider, SourceRow};
pub use manager::{DatabaseError, DatabaseManager};
pub use postgres::PgSystemStore;
pub use store::{MigrationStore, OrganizationDirectory, ProgressAck};
