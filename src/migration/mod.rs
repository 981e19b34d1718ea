//! Versioned SQL migrations: checksummed scripts, a ledger table, explicit rollback,
//! and an advisory lock so only one process migrates a schema at a time.

mod ledger;
mod lock;
mod migrator;
mod script;

/// Ledger table name; never described or exposed as a CRUD table.
pub const LEDGER_TABLE: &str = "schema_migrations";

pub use ledger::MigrationRecord;
pub use lock::MigrationLock;
pub use migrator::{ApplyReport, MigrationStatus, Migrator, PendingMigration};
pub use script::{checksum, discover, MigrationScript};
