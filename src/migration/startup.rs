//! In-process migration execution helpers

use crate::config::MigrationConfig;
use crate::migration::{MigrationError, MigrationReport, MigrationRunner, MigrationStore};
use crate::transaction::TransactionService;
use uuid::Uuid;

/// A fresh instance identifier: `<hostname-or-"schemaguard">-<uuid v4>`.
pub fn generate_instance_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "schemaguard".to_string());
    format!("{host}-{}", Uuid::new_v4())
}

/// Run migrations on application startup
///
/// Creates the bookkeeping tables if needed, then applies every pending script
/// from `config.scripts_dir` as `config.instance_id` (or a generated
/// identifier). Call it once before serving traffic and abort startup on
/// error: a failure means the schema may be behind the code.
///
/// Scripts deferred because another instance holds the lock are reported in
/// [`MigrationReport::deferred`]; they are not an error.
///
/// # Example
///
/// ```rust,no_run
/// use schemaguard::backend::postgres::PgTransactionService;
/// use schemaguard::config::GuardConfig;
/// use schemaguard::migration::startup_migrations;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = GuardConfig::load()?;
///     let service = PgTransactionService::new(config.database.url.clone());
///
///     startup_migrations(&service, &config.migrations)?;
///
///     // Continue with application startup...
///     Ok(())
/// }
/// ```
pub fn startup_migrations<S>(
    service: S,
    config: &MigrationConfig,
) -> Result<MigrationReport, MigrationError>
where
    S: TransactionService,
    S::Native: MigrationStore,
{
    let instance_id = config
        .instance_id
        .clone()
        .unwrap_or_else(generate_instance_id);

    let runner = MigrationRunner::new(service, &config.scripts_dir);
    runner.ensure_schema()?;
    let report = runner.apply_pending(&instance_id)?;

    if !report.applied.is_empty() {
        log::info!(
            "{instance_id} applied {} migration(s) on startup",
            report.applied.len()
        );
    } else if report.is_complete() {
        log::debug!("no pending migrations to apply");
    }
    if !report.is_complete() {
        log::warn!(
            "{} migration(s) deferred while another instance holds the migration lock: {}",
            report.deferred.len(),
            report.deferred.join(", ")
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDatabase;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_startup_bootstraps_and_applies() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("001_init.sql"), "CREATE TABLE t (id INT);").unwrap();
        let db = MemoryDatabase::new();
        let config = MigrationConfig {
            scripts_dir: dir.path().to_path_buf(),
            instance_id: Some("web-1".to_string()),
        };

        let report = startup_migrations(&db, &config).unwrap();

        assert!(db.schema_created());
        assert_eq!(report.applied_names(), vec!["001_init.sql"]);
        assert_eq!(db.ledger()[0].applied_by, "web-1");
    }

    #[test]
    fn test_startup_generates_instance_id() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("001_init.sql"), "SELECT 1;").unwrap();
        let db = MemoryDatabase::new();
        let config = MigrationConfig {
            scripts_dir: dir.path().to_path_buf(),
            instance_id: None,
        };

        startup_migrations(&db, &config).unwrap();

        let applied_by = db.ledger()[0].applied_by.clone();
        assert!(applied_by.len() > 37);
        let (_, tail) = applied_by.split_at(applied_by.len() - 36);
        assert!(Uuid::parse_str(tail).is_ok());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_instance_id(), generate_instance_id());
    }
}
