// ⚖️ Reconciliation Stager - union rows ↔ registry rows in decreasing strictness
//
//   Stage 1  exact_reference    full reference (parcel + padded count + controls)
//   Stage 2  address_composite  person, street code, number, staircase, floor, door
//   Stage 3  relaxed_composite  person, street code
//
// A row matched in one stage is removed from both sides before the next
// stage runs, so every row is matched at most once. Whatever is left after
// the last stage is returned as remainders for manual review.

use crate::config::{ReconcileSpec, ReferenceColumns, ReferenceSpec, Stage, TupleSpec};
use crate::error::{PipelineError, Result};
use crate::table::Table;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::info;

/// Separator inside tuple keys; cannot occur in CSV cell text
const KEY_SEP: &str = "\u{1f}";

/// Composite full reference: parcel + count zero-padded to `width` + both
/// control codes. Empty when the parcel id is empty.
pub fn full_reference(parcel: &str, count: &str, control1: &str, control2: &str, width: usize) -> String {
    let parcel = parcel.trim();
    if parcel.is_empty() {
        return String::new();
    }
    let count = count.trim();
    let count = match count.parse::<u64>() {
        Ok(n) => format!("{n:0width$}"),
        Err(_) => format!("{count:0>width$}"),
    };
    format!("{parcel}{count}{}{}", control1.trim(), control2.trim())
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationMatch {
    /// Row position in the union table
    pub union_row: usize,

    /// Row position in the registry table
    pub registry_row: usize,

    /// Stage that produced the match
    pub origin: Stage,

    /// Key both rows agreed on
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub matches: Vec<ReconciliationMatch>,
    pub union_remaining: Vec<usize>,
    pub registry_remaining: Vec<usize>,
}

impl ReconciliationReport {
    pub fn matched_in(&self, stage: Stage) -> usize {
        self.matches.iter().filter(|m| m.origin == stage).count()
    }

    pub fn summary(&self) -> String {
        let stages: Vec<String> = Stage::all()
            .iter()
            .map(|s| format!("{}={}", s.as_str(), self.matched_in(*s)))
            .collect();
        format!(
            "{} matches ({}), {} union and {} registry rows left",
            self.matches.len(),
            stages.join(", "),
            self.union_remaining.len(),
            self.registry_remaining.len()
        )
    }

    /// Matched rows from both sides with their origin, registry order of matching
    pub fn matches_table(&self, union: &Table, registry: &Table) -> Result<Table> {
        let mut headers = vec![
            "origin".to_string(),
            "match_key".to_string(),
            "union_row".to_string(),
            "registry_row".to_string(),
        ];
        headers.extend(union.headers().iter().map(|h| format!("union_{h}")));
        headers.extend(registry.headers().iter().map(|h| format!("registry_{h}")));

        let rows = self.matches.iter().map(|m| {
            let mut row = vec![
                m.origin.as_str().to_string(),
                m.key.clone(),
                m.union_row.to_string(),
                m.registry_row.to_string(),
            ];
            row.extend(union.row(m.union_row).values());
            row.extend(registry.row(m.registry_row).values());
            row
        });

        Ok(Table::from_rows(headers, rows)?)
    }
}

// ============================================================================
// STAGER
// ============================================================================

pub struct ReconciliationStager<'a> {
    spec: &'a ReconcileSpec,
}

impl<'a> ReconciliationStager<'a> {
    pub fn new(spec: &'a ReconcileSpec) -> Self {
        ReconciliationStager { spec }
    }

    /// Run the configured stages in order over `union` and `registry`
    pub fn reconcile(&self, union: &Table, registry: &Table) -> Result<ReconciliationReport> {
        let mut union_open = vec![true; union.nrows()];
        let mut registry_open = vec![true; registry.nrows()];
        let mut matches = Vec::new();

        for &stage in &self.spec.stages {
            let (union_keys, registry_keys) = self.stage_keys(stage, union, registry)?;
            let found = match_stage(&union_keys, &registry_keys, &mut union_open, &mut registry_open);
            info!("⚖️  {}: {} matches", stage.as_str(), found.len());
            matches.extend(found.into_iter().map(|(u, r, key)| ReconciliationMatch {
                union_row: u,
                registry_row: r,
                origin: stage,
                key: key.replace(KEY_SEP, "|"),
            }));
        }

        let report = ReconciliationReport {
            matches,
            union_remaining: open_rows(&union_open),
            registry_remaining: open_rows(&registry_open),
        };
        info!("⚖️  {}", report.summary());
        Ok(report)
    }

    fn stage_keys(&self, stage: Stage, union: &Table, registry: &Table) -> Result<(Vec<Option<String>>, Vec<Option<String>>)> {
        let registry_name = self.spec.registry.as_str();
        match stage {
            Stage::ExactReference => {
                let spec = self.spec.reference.as_ref().ok_or_else(|| missing_section("reference"))?;
                Ok((
                    reference_keys(union, &spec.union, spec, "union")?,
                    reference_keys(registry, &spec.registry, spec, registry_name)?,
                ))
            }
            Stage::AddressComposite => {
                let spec = self.spec.address.as_ref().ok_or_else(|| missing_section("address"))?;
                tuple_pair(union, registry, spec, registry_name)
            }
            Stage::RelaxedComposite => {
                let spec = self.spec.relaxed.as_ref().ok_or_else(|| missing_section("relaxed"))?;
                tuple_pair(union, registry, spec, registry_name)
            }
        }
    }
}

fn missing_section(name: &str) -> PipelineError {
    PipelineError::config(format!("reconcile.{name} is not configured"))
}

fn open_rows(open: &[bool]) -> Vec<usize> {
    open.iter().enumerate().filter(|(_, o)| **o).map(|(i, _)| i).collect()
}

fn require<'t>(table: &'t Table, column: &str, dataset: &str) -> Result<&'t [String]> {
    table.column(column).ok_or_else(|| PipelineError::Schema {
        dataset: dataset.to_string(),
        column: column.to_string(),
    })
}

fn require_part<'t>(table: &'t Table, column: &Option<String>, dataset: &str) -> Result<&'t [String]> {
    let name = column.as_deref().ok_or_else(|| missing_section("reference"))?;
    require(table, name, dataset)
}

fn reference_keys(table: &Table, cols: &ReferenceColumns, spec: &ReferenceSpec, dataset: &str) -> Result<Vec<Option<String>>> {
    let non_empty = |v: String| if v.is_empty() { None } else { Some(v) };

    if let Some(column) = &cols.column {
        let values = require(table, column, dataset)?;
        return Ok(values.iter().map(|v| non_empty(v.trim().to_string())).collect());
    }

    let parcel = require_part(table, &cols.parcel, dataset)?;
    let count = require_part(table, &cols.count, dataset)?;
    let control1 = require_part(table, &cols.control1, dataset)?;
    let control2 = require_part(table, &cols.control2, dataset)?;

    Ok((0..table.nrows())
        .map(|r| non_empty(full_reference(&parcel[r], &count[r], &control1[r], &control2[r], spec.width)))
        .collect())
}

fn tuple_pair(
    union: &Table,
    registry: &Table,
    spec: &TupleSpec,
    registry_name: &str,
) -> Result<(Vec<Option<String>>, Vec<Option<String>>)> {
    Ok((
        tuple_keys(union, &spec.union, "union")?,
        tuple_keys(registry, &spec.registry, registry_name)?,
    ))
}

/// Joined tuple per row; `None` when an identity field (the first two) is empty
fn tuple_keys(table: &Table, columns: &[String], dataset: &str) -> Result<Vec<Option<String>>> {
    let cols: Vec<&[String]> = columns
        .iter()
        .map(|c| require(table, c, dataset))
        .collect::<Result<_>>()?;
    let identity = cols.len().min(2);

    Ok((0..table.nrows())
        .map(|r| {
            let values: Vec<&str> = cols.iter().map(|c| c[r].trim()).collect();
            if values[..identity].iter().any(|v| v.is_empty()) {
                None
            } else {
                Some(values.join(KEY_SEP))
            }
        })
        .collect())
}

/// One-to-one pairing: each open registry row takes the first open union
/// row with the same key. Matched rows are closed on both sides.
fn match_stage(
    union_keys: &[Option<String>],
    registry_keys: &[Option<String>],
    union_open: &mut [bool],
    registry_open: &mut [bool],
) -> Vec<(usize, usize, String)> {
    let mut buckets: HashMap<&str, VecDeque<usize>> = HashMap::new();
    for (u, key) in union_keys.iter().enumerate() {
        if let (true, Some(key)) = (union_open[u], key) {
            buckets.entry(key.as_str()).or_default().push_back(u);
        }
    }

    let mut found = Vec::new();
    for (r, key) in registry_keys.iter().enumerate() {
        let Some(key) = key else { continue };
        if !registry_open[r] {
            continue;
        }
        if let Some(u) = buckets.get_mut(key.as_str()).and_then(VecDeque::pop_front) {
            union_open[u] = false;
            registry_open[r] = false;
            found.push((u, r, key.clone()));
        }
    }
    found
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn s(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn create_test_spec(stages: Vec<Stage>) -> ReconcileSpec {
        serde_yaml::from_str::<ReconcileSpec>(
            r#"
registry: padron
reference:
  union: { parcel: parcela, count: cargo, control1: dc1, control2: dc2 }
  registry: { column: fullref }
address:
  union: [dni, codvia, numero, escalera, planta, puerta]
  registry: [nif, codvia_asignado, numero_final, escalera_final, planta_final, puerta_final]
relaxed:
  union: [dni, codvia]
  registry: [nif, codvia_asignado]
"#,
        )
        .map(|mut spec| {
            spec.stages = stages;
            spec
        })
        .unwrap()
    }

    fn create_test_union() -> Table {
        Table::from_columns(vec![
            ("parcela", s(&["P1", "P2", "P3", "P4", ""])),
            ("cargo", s(&["1", "2", "1", "1", "1"])),
            ("dc1", s(&["A", "B", "C", "D", "E"])),
            ("dc2", s(&["X", "Y", "Z", "W", "V"])),
            ("dni", s(&["11", "22", "33", "44", ""])),
            ("codvia", s(&["100", "200", "300", "400", "500"])),
            ("numero", s(&["1", "2", "3", "4", "5"])),
            ("escalera", s(&["", "", "", "1", ""])),
            ("planta", s(&["", "", "", "2", ""])),
            ("puerta", s(&["", "", "", "B", ""])),
        ])
        .unwrap()
    }

    fn create_test_registry() -> Table {
        Table::from_columns(vec![
            // row 0 → P1 by reference; row 1 → P2 by address; row 2 → P4 relaxed (different door)
            // row 3 → no identity; row 4 → P2 again by reference but already consumed
            ("fullref", s(&["P10001AX", "", "", "", "P20002BY"])),
            ("nif", s(&["11", "22", "44", "", "22"])),
            ("codvia_asignado", s(&["100", "200", "400", "500", "200"])),
            ("numero_final", s(&["1", "2", "4", "5", "2"])),
            ("escalera_final", s(&["", "", "1", "", ""])),
            ("planta_final", s(&["", "", "2", "", ""])),
            ("puerta_final", s(&["", "", "A", "", ""])),
        ])
        .unwrap()
    }

    #[test]
    fn test_full_reference_padding() {
        assert_eq!(full_reference("1234567AB", "7", "X", "Y", 4), "1234567AB0007XY");
        assert_eq!(full_reference(" P ", "012", "", "", 4), "P0012");
        assert_eq!(full_reference("P", "A1", "c", "d", 4), "P00A1cd");
        assert_eq!(full_reference("", "1", "X", "Y", 4), "");
    }

    #[test]
    fn test_three_stages_in_order() {
        let spec = create_test_spec(Stage::all());
        let report = ReconciliationStager::new(&spec)
            .reconcile(&create_test_union(), &create_test_registry())
            .unwrap();

        // Registry row 4 claims P2 by reference first; registry row 1 then
        // finds nothing left for its address and P2 is not matched twice
        let pairs: Vec<(usize, usize, Stage)> =
            report.matches.iter().map(|m| (m.union_row, m.registry_row, m.origin)).collect();
        assert_eq!(
            pairs,
            vec![
                (0, 0, Stage::ExactReference),
                (1, 4, Stage::ExactReference),
                (3, 2, Stage::RelaxedComposite),
            ]
        );
        assert_eq!(report.union_remaining, vec![2, 4]);
        assert_eq!(report.registry_remaining, vec![1, 3]);
    }

    #[test]
    fn test_address_stage_without_reference() {
        let spec = create_test_spec(vec![Stage::AddressComposite, Stage::RelaxedComposite]);
        let report = ReconciliationStager::new(&spec)
            .reconcile(&create_test_union(), &create_test_registry())
            .unwrap();

        assert_eq!(report.matched_in(Stage::AddressComposite), 2);
        assert_eq!(report.matched_in(Stage::RelaxedComposite), 1);
    }

    #[test]
    fn test_stage_matches_are_disjoint_and_cover_all() {
        let spec = create_test_spec(Stage::all());
        let union = create_test_union();
        let registry = create_test_registry();
        let report = ReconciliationStager::new(&spec).reconcile(&union, &registry).unwrap();

        let union_rows: HashSet<usize> = report.matches.iter().map(|m| m.union_row).collect();
        let registry_rows: HashSet<usize> = report.matches.iter().map(|m| m.registry_row).collect();
        assert_eq!(union_rows.len(), report.matches.len());
        assert_eq!(registry_rows.len(), report.matches.len());

        let per_stage: usize = Stage::all().iter().map(|s| report.matched_in(*s)).sum();
        assert_eq!(per_stage, report.matches.len());

        assert_eq!(union_rows.len() + report.union_remaining.len(), union.nrows());
        assert_eq!(registry_rows.len() + report.registry_remaining.len(), registry.nrows());
        assert!(report.union_remaining.iter().all(|r| !union_rows.contains(r)));
    }

    #[test]
    fn test_empty_identity_never_matches() {
        let spec = create_test_spec(vec![Stage::RelaxedComposite]);
        let union = Table::from_columns(vec![("dni", s(&["", ""])), ("codvia", s(&["1", ""]))]).unwrap();
        let registry =
            Table::from_columns(vec![("nif", s(&["", ""])), ("codvia_asignado", s(&["1", ""]))]).unwrap();

        let report = ReconciliationStager::new(&spec).reconcile(&union, &registry).unwrap();
        assert!(report.matches.is_empty());
    }

    #[test]
    fn test_separator_inside_values_does_not_collide() {
        let spec = create_test_spec(vec![Stage::RelaxedComposite]);
        let union = Table::from_columns(vec![("dni", s(&["A|B"])), ("codvia", s(&["C"]))]).unwrap();
        let registry = Table::from_columns(vec![("nif", s(&["A"])), ("codvia_asignado", s(&["B|C"]))]).unwrap();

        let report = ReconciliationStager::new(&spec).reconcile(&union, &registry).unwrap();
        assert!(report.matches.is_empty());
    }

    #[test]
    fn test_match_key_is_readable() {
        let spec = create_test_spec(vec![Stage::RelaxedComposite]);
        let report = ReconciliationStager::new(&spec)
            .reconcile(&create_test_union(), &create_test_registry())
            .unwrap();
        assert_eq!(report.matches[0].key, "11|100");
    }

    #[test]
    fn test_missing_registry_column_names_dataset() {
        let spec = create_test_spec(vec![Stage::RelaxedComposite]);
        let registry = Table::from_columns(vec![("nif", s(&["1"]))]).unwrap();
        let err = ReconciliationStager::new(&spec)
            .reconcile(&create_test_union(), &registry)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Schema { ref dataset, ref column }
            if dataset == "padron" && column == "codvia_asignado"));
    }

    #[test]
    fn test_matches_table_layout() {
        let spec = create_test_spec(vec![Stage::ExactReference]);
        let union = create_test_union();
        let registry = create_test_registry();
        let report = ReconciliationStager::new(&spec).reconcile(&union, &registry).unwrap();
        let table = report.matches_table(&union, &registry).unwrap();

        assert_eq!(table.nrows(), 2);
        assert_eq!(table.get(0, "origin"), "exact_reference");
        assert_eq!(table.get(0, "union_parcela"), "P1");
        assert_eq!(table.get(1, "registry_fullref"), "P20002BY");
    }
}
