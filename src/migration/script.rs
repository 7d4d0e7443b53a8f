//! Migration script discovery

use crate::migration::MigrationError;
use std::fs;
use std::path::{Path, PathBuf};

/// A `*.sql` file in the migrations directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    /// File name, the script's identity in the ledger
    pub name: String,
    pub path: PathBuf,
}

impl MigrationScript {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }

    /// Read the script's SQL text.
    pub fn read_sql(&self) -> Result<String, MigrationError> {
        fs::read_to_string(&self.path).map_err(|source| MigrationError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Discover all migration scripts in a directory
///
/// Returns every regular file whose extension is `sql` (any case), sorted by
/// file name using byte-wise string ordering. Subdirectories are ignored.
/// Numeric prefixes are compared as text, so `10_x.sql` sorts before
/// `2_y.sql`; zero-pad them.
///
/// # Errors
///
/// Returns `MigrationError::Io` if the directory cannot be read and
/// `MigrationError::InvalidScriptName` for a file name that is not UTF-8.
pub fn discover_scripts(dir: &Path) -> Result<Vec<MigrationScript>, MigrationError> {
    let io_err = |source: std::io::Error| MigrationError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut scripts = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();

        let is_sql = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"));
        if !is_sql || !entry.file_type().map_err(io_err)?.is_file() {
            continue;
        }

        let name = entry
            .file_name()
            .into_string()
            .map_err(|raw| MigrationError::InvalidScriptName(raw.to_string_lossy().into_owned()))?;
        scripts.push(MigrationScript::new(name, path));
    }

    scripts.sort_by(|a, b| a.name.cmp(&b.name));
    log::debug!("discovered {} migration script(s) in {}", scripts.len(), dir.display());
    Ok(scripts)
}
