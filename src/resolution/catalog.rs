// 🗂️ Master Catalog - one SQLite file per normalized column
//
// Holds one row per cluster: its block key values and its representative.
// Read at the start of a resolution call, rewritten in full at the end of
// it inside a single transaction.

use crate::error::Result;
use crate::run::RunInfo;
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Blocking column → value
    pub block: BTreeMap<String, String>,

    /// Representative canon value of the cluster
    pub representative: String,
}

pub struct Catalog {
    conn: Connection,
    path: PathBuf,
}

impl Catalog {
    /// Open (or create) `<dir>/<column>.sqlite`, creating `dir` if needed
    pub fn open(dir: &Path, column: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.sqlite", file_stem(column)));
        let conn = Connection::open(&path)?;
        setup_catalog(&conn)?;
        Ok(Catalog { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored cluster, in stored order
    pub fn load(&self) -> Result<Vec<CatalogEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT block_keys, representative FROM clusters ORDER BY position")?;

        let entries = stmt
            .query_map([], |row| {
                let block_json: String = row.get(0)?;
                let block = serde_json::from_str(&block_json)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
                Ok(CatalogEntry {
                    block,
                    representative: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Replace the whole catalog with `entries` atomically
    pub fn replace_all(&mut self, entries: &[CatalogEntry], run: &RunInfo) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM clusters", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO clusters (position, block_keys, representative, run_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let updated_at = run.started_at.to_rfc3339();
            let run_id = run.run_id.to_string();
            for (position, entry) in entries.iter().enumerate() {
                let block_json = serde_json::to_string(&entry.block)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                stmt.execute(params![
                    position as i64,
                    block_json,
                    entry.representative,
                    run_id,
                    updated_at
                ])?;
            }
        }
        tx.commit()?;

        debug!("catalog {} rewritten with {} clusters", self.path.display(), entries.len());
        Ok(entries.len())
    }
}

fn setup_catalog(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS clusters (
            position INTEGER PRIMARY KEY,
            block_keys TEXT NOT NULL,
            representative TEXT NOT NULL,
            run_id TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Column name made safe for use as a file name
fn file_stem(column: &str) -> String {
    column
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
