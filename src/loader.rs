// 📂 Dataset Loader - directory + glob → one projected, renamed Table
//
// Files are sorted lexically before concatenation so the row order of a
// dataset never depends on directory listing order.

use crate::config::{ColumnMap, ColumnsMode, DatasetSpec, PipelineConfig, SequenceSpec};
use crate::error::{PipelineError, Result};
use crate::table::{natural_cmp, Table};
use csv::ReaderBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Load every dataset declared in the config, keyed by dataset name
pub fn load_all(cfg: &PipelineConfig) -> Result<HashMap<String, Table>> {
    let mut tables = HashMap::new();
    for (name, spec) in &cfg.datasets {
        let table = load_dataset(name, spec, cfg.column_map(name), cfg.columns_mode, &cfg.base_dir)?;
        info!("📂 {}: {} rows after projection", name, table.nrows());
        tables.insert(name.clone(), table);
    }
    Ok(tables)
}

/// Resolve, read, concatenate, project/rename and (optionally) sequence one dataset
pub fn load_dataset(
    name: &str,
    spec: &DatasetSpec,
    columns: Option<&ColumnMap>,
    mode: ColumnsMode,
    base_dir: &Path,
) -> Result<Table> {
    let dir = if spec.dir.is_absolute() {
        spec.dir.clone()
    } else {
        base_dir.join(&spec.dir)
    };

    let files = resolve_files(&dir, &spec.pattern)?;
    if files.is_empty() {
        return Err(PipelineError::DatasetNotFound {
            dataset: name.to_string(),
            dir: dir.display().to_string(),
            pattern: spec.pattern.clone(),
        });
    }

    let mut parts = Vec::with_capacity(files.len());
    for file in &files {
        debug!("reading {} for dataset {}", file.display(), name);
        parts.push(read_table(file)?);
    }
    let table = Table::concat(parts);

    let table = match columns {
        Some(map) if !map.is_empty() => apply_column_mapping(name, &table, map, mode)?,
        _ => table,
    };

    match &spec.sequence {
        Some(seq) => add_sequence(name, table, seq),
        None => Ok(table),
    }
}

/// Files in `dir` matching `pattern`, sorted lexically
pub fn resolve_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!("{}/{}", glob::Pattern::escape(&dir.to_string_lossy()), pattern);
    let paths = glob::glob(&full)
        .map_err(|e| PipelineError::config(format!("invalid pattern '{pattern}': {e}")))?;

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| PipelineError::Io(e.into_error()))?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Read a delimited file as strings (`.tsv` → tab, otherwise comma).
/// Short rows are padded with ""; cells beyond the header are dropped with a warning.
pub fn read_table(path: &Path) -> Result<Table> {
    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
        _ => b',',
    };

    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(file);

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let width = headers.len();
    let mut table = Table::new(headers)?;

    let mut long_rows = 0;
    for result in reader.records() {
        let record = result?;
        if record.len() > width {
            long_rows += 1;
        }
        let mut row: Vec<String> = record.iter().take(width).map(str::to_string).collect();
        row.resize(width, String::new());
        table.push_row(row)?;
    }

    if long_rows > 0 {
        warn!(
            "⚠️  {}: {} rows with more cells than the {} headers, extra cells dropped",
            path.display(),
            long_rows,
            width
        );
    }
    Ok(table)
}

/// Keep only mapped source columns, renamed to their targets, in mapping order
pub fn apply_column_mapping(dataset: &str, table: &Table, map: &ColumnMap, mode: ColumnsMode) -> Result<Table> {
    let mut kept: Vec<(String, Vec<String>)> = Vec::new();

    for (src, target) in map.pairs() {
        if let Some(values) = table.column(src) {
            kept.push((target.to_string(), values.to_vec()));
        } else if mode == ColumnsMode::Strict {
            return Err(PipelineError::Schema {
                dataset: dataset.to_string(),
                column: src.to_string(),
            });
        } else {
            warn!("⚠️  dataset '{}': mapped column '{}' not found, skipped", dataset, src);
        }
    }

    Ok(Table::from_columns(kept)?)
}

/// Stable sort by `seq.by`, then number the rows of each group 1, 2, 3…
pub fn add_sequence(dataset: &str, table: Table, seq: &SequenceSpec) -> Result<Table> {
    let by = table.column(&seq.by).ok_or_else(|| PipelineError::Schema {
        dataset: dataset.to_string(),
        column: seq.by.clone(),
    })?;

    let mut order: Vec<usize> = (0..table.nrows()).collect();
    order.sort_by(|&a, &b| natural_cmp(&by[a], &by[b]));

    let mut sorted = table.select_rows(&order);
    let mut counters: HashMap<String, usize> = HashMap::new();
    let numbers: Vec<String> = sorted
        .column(&seq.by)
        .unwrap_or_default()
        .iter()
        .map(|key| {
            let n = counters.entry(key.clone()).or_insert(0);
            *n += 1;
            n.to_string()
        })
        .collect();
    sorted.set_column(&seq.as_, numbers)?;
    Ok(sorted)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn create_test_map(yaml: &str) -> ColumnMap {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn spec(dir: &Path, pattern: &str) -> DatasetSpec {
        DatasetSpec {
            dir: dir.to_path_buf(),
            pattern: pattern.to_string(),
            sequence: None,
        }
    }

    #[test]
    fn test_concat_in_sorted_file_order() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "b.csv", "ID,NAME\n3,c\n");
        write(tmp.path(), "a.csv", "ID,NAME\n1,a\n2,\n");
        write(tmp.path(), "notes.txt", "ignored");

        let t = load_dataset("ds", &spec(tmp.path(), "*.csv"), None, ColumnsMode::KeepExisting, Path::new("")).unwrap();
        assert_eq!(t.column("ID").unwrap(), &["1", "2", "3"]);
        assert_eq!(t.get(1, "NAME"), "");
    }

    #[test]
    fn test_no_match_is_dataset_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_dataset("bien", &spec(tmp.path(), "*.csv"), None, ColumnsMode::KeepExisting, Path::new(""))
            .unwrap_err();
        assert!(matches!(err, PipelineError::DatasetNotFound { ref dataset, .. } if dataset == "bien"));
    }

    #[test]
    fn test_projection_lenient_and_strict() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.csv", "ID,NAME,EXTRA\n1,a,x\n");
        let map = create_test_map("{ NAME: { as: nombre }, ID: { as: id }, GONE: { as: gone } }");

        let t = load_dataset("ds", &spec(tmp.path(), "a.csv"), Some(&map), ColumnsMode::KeepExisting, Path::new(""))
            .unwrap();
        assert_eq!(t.headers(), &["nombre".to_string(), "id".to_string()]);

        let err = load_dataset("ds", &spec(tmp.path(), "a.csv"), Some(&map), ColumnsMode::Strict, Path::new(""))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Schema { ref column, .. } if column == "GONE"));
    }

    #[test]
    fn test_tsv_and_short_rows() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.tsv", "A\tB\nx\n");
        let t = read_table(&tmp.path().join("a.tsv")).unwrap();
        assert_eq!(t.nrows(), 1);
        assert_eq!(t.get(0, "B"), "");
    }

    #[test]
    fn test_long_rows_keep_header_width() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.csv", "A,B\n1,2,3\n4,5\n");
        let t = read_table(&tmp.path().join("a.csv")).unwrap();
        assert_eq!(t.ncols(), 2);
        assert_eq!(t.column("B").unwrap(), &["2", "5"]);
    }

    #[test]
    fn test_sequence_numbers_members_per_group() {
        let t = Table::from_columns(vec![
            ("id_parcela", vec!["P2".to_string(), "P1".to_string(), "P2".to_string()]),
            ("n", vec!["a".to_string(), "b".to_string(), "c".to_string()]),
        ])
        .unwrap();
        let seq = SequenceSpec { by: "id_parcela".into(), as_: "miembro".into() };
        let t = add_sequence("ds", t, &seq).unwrap();

        assert_eq!(t.column("id_parcela").unwrap(), &["P1", "P2", "P2"]);
        assert_eq!(t.column("n").unwrap(), &["b", "a", "c"]);
        assert_eq!(t.column("miembro").unwrap(), &["1", "1", "2"]);
    }
}
