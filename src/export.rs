// 📤 Exporter - final table and auxiliary tables to delimited files
//
// Auxiliary outputs sit next to the main file and share its stem:
//   <stem>.csv, <stem>_counts.csv, <stem>_<builder>_<side>.csv, <stem>_matches.csv …

use crate::error::Result;
use crate::table::Table;
use csv::WriterBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write `table` to `path` (`.tsv` → tab, otherwise comma), creating parent dirs
pub fn write_table(path: &Path, table: &Table) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
        _ => b',',
    };

    let mut writer = WriterBuilder::new().delimiter(delimiter).from_path(path)?;
    writer.write_record(table.headers())?;
    for row in table.rows() {
        writer.write_record(row.values())?;
    }
    writer.flush()?;
    Ok(())
}

/// Sibling of `main` named `<stem>_<suffix>.<ext>`
pub fn aux_path(main: &Path, suffix: &str) -> PathBuf {
    let stem = main.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let ext = main.extension().and_then(|e| e.to_str()).unwrap_or("csv");
    main.with_file_name(format!("{stem}_{suffix}.{ext}"))
}

/// `<column>,num_rows` per distinct value, `None` when the column is absent
pub fn counts_table(table: &Table, column: &str) -> Result<Option<Table>> {
    let Some(counts) = table.count_by(column) else {
        return Ok(None);
    };
    let rows = counts.into_iter().map(|(value, n)| vec![value, n.to_string()]);
    Ok(Some(Table::from_rows([column.to_string(), "num_rows".to_string()], rows)?))
}

/// Collects every file a run writes so the caller can report them
#[derive(Debug, Default)]
pub struct Exporter {
    main: PathBuf,
    written: Vec<PathBuf>,
}

impl Exporter {
    pub fn new(main: PathBuf) -> Self {
        Exporter {
            main,
            written: Vec::new(),
        }
    }

    pub fn main_path(&self) -> &Path {
        &self.main
    }

    pub fn write_main(&mut self, table: &Table) -> Result<PathBuf> {
        let path = self.main.clone();
        self.write(path, table)
    }

    pub fn write_aux(&mut self, suffix: &str, table: &Table) -> Result<PathBuf> {
        let path = aux_path(&self.main, suffix);
        self.write(path, table)
    }

    fn write(&mut self, path: PathBuf, table: &Table) -> Result<PathBuf> {
        write_table(&path, table)?;
        info!("💾 {} rows → {}", table.nrows(), path.display());
        self.written.push(path.clone());
        Ok(path)
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

// ============================================================================
// TESTS
// ============================================================================
