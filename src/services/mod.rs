pub mod audit;
pub mod copier;
pub mod cutover;
pub mod error;
pub mod locks;
pub mod orchestrator;

pub use audit::{AuditEntry, AuditSink, PgAuditSink};
pub use copier::{ChunkOutcome, CollectionCopier};
pub use cutover::CutoverController;
pub use error::MigrationError;
pub use locks::TenantLocks;
pub use orchestrator::{MigrationOrchestrator, StartMigration};
