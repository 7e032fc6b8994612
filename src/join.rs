// 🔗 Join / Unify Stage
//
// Equi-join of two loaded tables under an optional cardinality contract,
// then collapse of `<col>_x` / `<col>_y` pairs per the declared unify rules.
//
// A violated contract aborts the run.

use crate::config::{JoinHow, JoinSpec, Side, UnifyRule};
use crate::error::{PipelineError, Result};
use crate::table::Table;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

const KEY_SEP: char = '\u{1f}';

fn row_key(table: &Table, row: usize, cols: &[usize]) -> String {
    let mut key = String::new();
    for (i, &c) in cols.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEP);
        }
        key.push_str(table.get(row, &table.headers()[c]));
    }
    key
}

fn display_key(key: &str) -> String {
    format!("({})", key.split(KEY_SEP).collect::<Vec<_>>().join(", "))
}

/// Keys that appear on more than one row, in first-seen order
fn duplicate_keys(keys: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut dups = Vec::new();
    for k in keys {
        if !seen.insert(k) && reported.insert(k) {
            dups.push(display_key(k));
        }
    }
    dups
}

fn key_indices(table: &Table, on: &[String], dataset: &str) -> Result<Vec<usize>> {
    on.iter()
        .map(|k| {
            table.column_index(k).ok_or_else(|| PipelineError::Schema {
                dataset: dataset.to_string(),
                column: k.clone(),
            })
        })
        .collect()
}

/// Equi-join `left` and `right` on `spec.on`.
///
/// Row order: left rows in order with their right matches (right order);
/// for `right`/`outer`, unmatched right rows follow in right order.
pub fn join(left: &Table, right: &Table, spec: &JoinSpec) -> Result<Table> {
    let lk = key_indices(left, &spec.on, &spec.left)?;
    let rk = key_indices(right, &spec.on, &spec.right)?;

    let left_keys: Vec<String> = (0..left.nrows()).map(|r| row_key(left, r, &lk)).collect();
    let right_keys: Vec<String> = (0..right.nrows()).map(|r| row_key(right, r, &rk)).collect();

    if let Some(contract) = spec.validate {
        for (unique, side, keys) in [
            (contract.left_unique(), "left", &left_keys),
            (contract.right_unique(), "right", &right_keys),
        ] {
            if !unique {
                continue;
            }
            let dups = duplicate_keys(keys);
            if !dups.is_empty() {
                return Err(PipelineError::JoinValidation {
                    contract: contract.as_str().to_string(),
                    side: format!("{side} ({})", if side == "left" { &spec.left } else { &spec.right }),
                    keys: dups,
                });
            }
        }
    }

    // Output layout: keys, left payload, right payload
    let (lsuf, rsuf) = &spec.suffixes;
    let left_payload: Vec<&String> = left.headers().iter().filter(|h| !spec.on.contains(h)).collect();
    let right_payload: Vec<&String> = right.headers().iter().filter(|h| !spec.on.contains(h)).collect();
    let left_names: HashSet<&String> = left_payload.iter().copied().collect();
    let right_names: HashSet<&String> = right_payload.iter().copied().collect();

    let mut headers: Vec<String> = spec.on.clone();
    for h in &left_payload {
        headers.push(if right_names.contains(h) { format!("{h}{lsuf}") } else { (*h).clone() });
    }
    for h in &right_payload {
        headers.push(if left_names.contains(h) { format!("{h}{rsuf}") } else { (*h).clone() });
    }
    let mut out = Table::new(headers)?;

    let mut right_index: HashMap<&str, Vec<usize>> = HashMap::new();
    for (r, k) in right_keys.iter().enumerate() {
        right_index.entry(k.as_str()).or_default().push(r);
    }

    let emit = |out: &mut Table, l: Option<usize>, r: Option<usize>| -> Result<()> {
        let mut row: Vec<String> = spec
            .on
            .iter()
            .map(|k| match (l, r) {
                (Some(l), _) => left.get(l, k).to_string(),
                (None, Some(r)) => right.get(r, k).to_string(),
                (None, None) => String::new(),
            })
            .collect();
        for h in &left_payload {
            row.push(l.map(|l| left.get(l, h).to_string()).unwrap_or_default());
        }
        for h in &right_payload {
            row.push(r.map(|r| right.get(r, h).to_string()).unwrap_or_default());
        }
        out.push_row(row)?;
        Ok(())
    };

    let mut right_matched = vec![false; right.nrows()];
    let keep_left_only = matches!(spec.how, JoinHow::Left | JoinHow::Outer);
    let keep_right_only = matches!(spec.how, JoinHow::Right | JoinHow::Outer);

    if spec.how == JoinHow::Right {
        // Right join keeps right order
        let mut left_index: HashMap<&str, Vec<usize>> = HashMap::new();
        for (l, k) in left_keys.iter().enumerate() {
            left_index.entry(k.as_str()).or_default().push(l);
        }
        for (r, k) in right_keys.iter().enumerate() {
            match left_index.get(k.as_str()) {
                Some(ls) => {
                    for &l in ls {
                        emit(&mut out, Some(l), Some(r))?;
                    }
                }
                None => emit(&mut out, None, Some(r))?,
            }
        }
    } else {
        for (l, k) in left_keys.iter().enumerate() {
            match right_index.get(k.as_str()) {
                Some(rs) => {
                    for &r in rs {
                        right_matched[r] = true;
                        emit(&mut out, Some(l), Some(r))?;
                    }
                }
                None if keep_left_only => emit(&mut out, Some(l), None)?,
                None => {}
            }
        }
        if keep_right_only {
            for r in (0..right.nrows()).filter(|&r| !right_matched[r]) {
                emit(&mut out, None, Some(r))?;
            }
        }
    }

    info!(
        "🔗 join {} ⋈ {} ({:?} on {:?}): {} rows",
        spec.left,
        spec.right,
        spec.how,
        spec.on,
        out.nrows()
    );
    Ok(out)
}

/// Collapse suffixed duplicate columns: keep the preferred side under the
/// plain name (at the left column's position), drop the other.
pub fn unify(mut table: Table, rules: &[UnifyRule], suffixes: &(String, String)) -> Result<Table> {
    for rule in rules {
        let left = format!("{}{}", rule.name, suffixes.0);
        let right = format!("{}{}", rule.name, suffixes.1);
        if !table.has_column(&left) || !table.has_column(&right) {
            debug!("unify: '{}' not present on both sides, skipped", rule.name);
            continue;
        }

        let preferred = match rule.prefer {
            Side::Left => &left,
            Side::Right => &right,
        };
        let values = table.column(preferred).map(<[String]>::to_vec).unwrap_or_default();
        table.drop_column(&right);
        table.rename_column(&left, &rule.name)?;
        table.set_column(&rule.name, values)?;
    }
    Ok(table)
}

// ============================================================================
// TESTS
// ============================================================================
