// 📋 Table - ordered string columns, the unit every stage passes along
//
// Every cell is a String; "" represents a missing value.
// Row order is insertion order from the source files.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ShapeError {
    #[error("column '{column}' has {got} values but the table has {expected} rows")]
    LengthMismatch {
        column: String,
        expected: usize,
        got: usize,
    },

    #[error("row has {got} cells but the table has {expected} columns")]
    RowWidth { expected: usize, got: usize },

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("unknown column '{0}'")]
    UnknownColumn(String),
}

// ============================================================================
// TABLE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    headers: Vec<String>,
    /// Column-major storage, `data[c][r]`
    data: Vec<Vec<String>>,
    rows: usize,
}

impl Table {
    /// Empty table with the given columns and zero rows
    pub fn new<S: Into<String>>(headers: impl IntoIterator<Item = S>) -> Result<Self, ShapeError> {
        let mut table = Table::default();
        for h in headers {
            table.add_column(h.into(), Vec::new())?;
        }
        Ok(table)
    }

    pub fn from_columns<S: Into<String>>(
        columns: impl IntoIterator<Item = (S, Vec<String>)>,
    ) -> Result<Self, ShapeError> {
        let mut table = Table::default();
        let mut first = true;
        for (name, values) in columns {
            if first {
                table.rows = values.len();
                first = false;
            }
            table.add_column(name.into(), values)?;
        }
        Ok(table)
    }

    pub fn from_rows<S: Into<String>>(
        headers: impl IntoIterator<Item = S>,
        rows: impl IntoIterator<Item = Vec<String>>,
    ) -> Result<Self, ShapeError> {
        let mut table = Table::new(headers)?;
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column(&self, name: &str) -> Option<&[String]> {
        self.column_index(name).map(|i| self.data[i].as_slice())
    }

    /// Cell value, "" when the column does not exist
    pub fn get(&self, row: usize, column: &str) -> &str {
        self.column_index(column)
            .and_then(|c| self.data[c].get(row))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn row(&self, index: usize) -> Row<'_> {
        Row { table: self, index }
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        (0..self.rows).map(move |index| Row { table: self, index })
    }

    /// Append a new column (fails if it already exists)
    pub fn add_column(&mut self, name: String, values: Vec<String>) -> Result<(), ShapeError> {
        if self.has_column(&name) {
            return Err(ShapeError::DuplicateColumn(name));
        }
        if !self.headers.is_empty() && values.len() != self.rows {
            return Err(ShapeError::LengthMismatch {
                column: name,
                expected: self.rows,
                got: values.len(),
            });
        }
        if self.headers.is_empty() {
            self.rows = values.len();
        }
        self.headers.push(name);
        self.data.push(values);
        Ok(())
    }

    /// Replace a column in place, or append it when absent
    pub fn set_column(&mut self, name: &str, values: Vec<String>) -> Result<(), ShapeError> {
        match self.column_index(name) {
            Some(i) => {
                if values.len() != self.rows {
                    return Err(ShapeError::LengthMismatch {
                        column: name.to_string(),
                        expected: self.rows,
                        got: values.len(),
                    });
                }
                self.data[i] = values;
                Ok(())
            }
            None => self.add_column(name.to_string(), values),
        }
    }

    pub fn drop_column(&mut self, name: &str) -> Option<Vec<String>> {
        let i = self.column_index(name)?;
        self.headers.remove(i);
        Some(self.data.remove(i))
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<(), ShapeError> {
        if from == to {
            return Ok(());
        }
        if self.has_column(to) {
            return Err(ShapeError::DuplicateColumn(to.to_string()));
        }
        let i = self
            .column_index(from)
            .ok_or_else(|| ShapeError::UnknownColumn(from.to_string()))?;
        self.headers[i] = to.to_string();
        Ok(())
    }

    pub fn push_row(&mut self, row: Vec<String>) -> Result<(), ShapeError> {
        if row.len() != self.headers.len() {
            return Err(ShapeError::RowWidth {
                expected: self.headers.len(),
                got: row.len(),
            });
        }
        for (col, value) in self.data.iter_mut().zip(row) {
            col.push(value);
        }
        self.rows += 1;
        Ok(())
    }

    /// New table with the given rows, in the given order
    pub fn select_rows(&self, indices: &[usize]) -> Table {
        Table {
            headers: self.headers.clone(),
            data: self
                .data
                .iter()
                .map(|col| indices.iter().map(|&i| col[i].clone()).collect())
                .collect(),
            rows: indices.len(),
        }
    }

    /// Concatenate tables top to bottom. Columns are the union in first-seen
    /// order; cells of columns a part lacks are filled with "".
    pub fn concat(parts: Vec<Table>) -> Table {
        let mut headers: Vec<String> = Vec::new();
        for part in &parts {
            for h in &part.headers {
                if !headers.contains(h) {
                    headers.push(h.clone());
                }
            }
        }

        let total: usize = parts.iter().map(|p| p.rows).sum();
        let mut data: Vec<Vec<String>> = headers.iter().map(|_| Vec::with_capacity(total)).collect();
        for part in parts {
            for (c, name) in headers.iter().enumerate() {
                match part.column_index(name) {
                    Some(i) => data[c].extend(part.data[i].iter().cloned()),
                    None => data[c].extend(std::iter::repeat(String::new()).take(part.rows)),
                }
            }
        }

        Table { headers, data, rows: total }
    }

    /// Stable sort by the given key columns (absent columns are ignored).
    /// Values that both parse as integers compare numerically.
    pub fn sort_by_columns(&mut self, keys: &[String]) {
        let key_idx: Vec<usize> = keys.iter().filter_map(|k| self.column_index(k)).collect();
        if key_idx.is_empty() || self.rows < 2 {
            return;
        }
        let mut order: Vec<usize> = (0..self.rows).collect();
        order.sort_by(|&a, &b| {
            for &c in &key_idx {
                let ord = natural_cmp(&self.data[c][a], &self.data[c][b]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        *self = self.select_rows(&order);
    }

    /// Rows per distinct value of `column`, sorted by value
    pub fn count_by(&self, column: &str) -> Option<BTreeMap<String, usize>> {
        let values = self.column(column)?;
        let mut counts = BTreeMap::new();
        for v in values {
            *counts.entry(v.clone()).or_insert(0) += 1;
        }
        Some(counts)
    }
}

/// Integer-aware comparison, falling back to plain string order
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

// ============================================================================
// ROW VIEW
// ============================================================================

/// Borrowed view of one row
#[derive(Clone, Copy)]
pub struct Row<'a> {
    table: &'a Table,
    index: usize,
}

impl<'a> Row<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Cell value, "" when the column does not exist
    pub fn get(&self, column: &str) -> &'a str {
        self.table.get(self.index, column)
    }

    pub fn values(&self) -> Vec<String> {
        self.table.data.iter().map(|c| c[self.index].clone()).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn s(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn create_test_table() -> Table {
        Table::from_columns(vec![
            ("id", s(&["10", "2", "1"])),
            ("name", s(&["c", "b", "a"])),
        ])
        .unwrap()
    }

    #[test]
    fn test_add_column_length_checked() {
        let mut t = create_test_table();
        let err = t.add_column("x".into(), s(&["1"])).unwrap_err();
        assert!(matches!(err, ShapeError::LengthMismatch { expected: 3, got: 1, .. }));
        assert!(t.add_column("x".into(), s(&["1", "2", "3"])).is_ok());
        assert_eq!(t.ncols(), 3);
    }

    #[test]
    fn test_concat_fills_missing_columns() {
        let a = Table::from_columns(vec![("id", s(&["1"])), ("x", s(&["a"]))]).unwrap();
        let b = Table::from_columns(vec![("id", s(&["2"])), ("y", s(&["b"]))]).unwrap();
        let t = Table::concat(vec![a, b]);

        assert_eq!(t.headers(), &s(&["id", "x", "y"])[..]);
        assert_eq!(t.column("x").unwrap(), &s(&["a", ""])[..]);
        assert_eq!(t.column("y").unwrap(), &s(&["", "b"])[..]);
    }

    #[test]
    fn test_sort_is_numeric_aware_and_stable() {
        let mut t = create_test_table();
        t.sort_by_columns(&s(&["id"]));
        assert_eq!(t.column("id").unwrap(), &s(&["1", "2", "10"])[..]);
        assert_eq!(t.column("name").unwrap(), &s(&["a", "b", "c"])[..]);
    }

    #[test]
    fn test_get_missing_column_is_empty() {
        let t = create_test_table();
        assert_eq!(t.get(0, "nope"), "");
        assert_eq!(t.row(1).get("name"), "b");
    }

    #[test]
    fn test_count_by() {
        let t = Table::from_columns(vec![("p", s(&["a", "b", "a"]))]).unwrap();
        let counts = t.count_by("p").unwrap();
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&1));
    }
}
