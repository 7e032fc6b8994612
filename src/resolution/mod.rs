// 🧭 Fuzzy Resolution Engine - noisy text columns → stable canonical values
//
// Per column:
//   1. canon key for every catalog row, then every table row (this order is
//      fixed; representative ties are broken by it)
//   2. blocks = key column values + canon prefix
//   3. pairwise scoring inside each block only (rayon, one task per block)
//   4. clusters = connected components over pairs with p ≥ prob_review
//   5. representative = most frequent canon in the cluster, first-seen on ties
//   6. catalog rewritten with one row per cluster
//   7. `<col>_norm` emitted for the table rows only
//   8. pairs in [prob_review, prob_auto) go to the conflicts table
//
// Conflicts of every resolution call in a run are gathered in one AuditLog
// and written once per audit directory, `conflicts_<timestamp>_<run>.csv`.
//
// Rows whose canon key is empty are never clustered; their `_norm` is "".

pub mod catalog;
pub mod scoring;

pub use catalog::{Catalog, CatalogEntry};
pub use scoring::{FellegiSunter, MatchScorer};

use crate::canon::{canon, canon_prefix};
use crate::config::one_or_many;
use crate::error::{PipelineError, Result};
use crate::export::write_table;
use crate::run::RunInfo;
use crate::table::Table;
use rayon::prelude::*;
use serde::Deserialize;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::info;

/// Fixed leading columns of the conflicts table; block key columns follow
pub const CONFLICT_COLUMNS: [&str; 6] = [
    "column",
    "value_left",
    "value_right",
    "canon_left",
    "canon_right",
    "match_probability",
];

// ============================================================================
// PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveParams {
    /// Columns to normalize, each independently
    #[serde(deserialize_with = "one_or_many")]
    pub columns: Vec<String>,

    /// Blocking columns (e.g. municipality)
    #[serde(default)]
    pub key_columns: Vec<String>,

    /// p ≥ prob_auto → merged without review (default 0.97)
    #[serde(default = "default_prob_auto")]
    pub prob_auto: f64,

    /// p ≥ prob_review → merged and recorded for review (default 0.90)
    #[serde(default = "default_prob_review")]
    pub prob_review: f64,

    #[serde(default = "default_catalog_dir")]
    pub catalog_dir: PathBuf,

    #[serde(default = "default_audit_dir")]
    pub audit_dir: PathBuf,

    /// Length of the canon prefix added to the block key (default 4)
    #[serde(default = "default_prefix_len")]
    pub prefix_len: usize,

    /// EM refinement of the match model (default 0: fixed parameters)
    #[serde(default)]
    pub em_iterations: usize,
}

fn default_prob_auto() -> f64 {
    0.97
}

fn default_prob_review() -> f64 {
    0.90
}

fn default_catalog_dir() -> PathBuf {
    PathBuf::from("master")
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from("audit")
}

fn default_prefix_len() -> usize {
    4
}

impl ResolveParams {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        ResolveParams {
            columns: columns.into_iter().map(Into::into).collect(),
            key_columns: Vec::new(),
            prob_auto: default_prob_auto(),
            prob_review: default_prob_review(),
            catalog_dir: default_catalog_dir(),
            audit_dir: default_audit_dir(),
            prefix_len: default_prefix_len(),
            em_iterations: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(PipelineError::config("resolution: no columns to normalize"));
        }
        let in_unit = |p: f64| (0.0..=1.0).contains(&p);
        if !in_unit(self.prob_auto) || !in_unit(self.prob_review) || self.prob_review > self.prob_auto {
            return Err(PipelineError::config(format!(
                "resolution: need 0 ≤ prob_review ({}) ≤ prob_auto ({}) ≤ 1",
                self.prob_review, self.prob_auto
            )));
        }
        Ok(())
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// A review-band pair, never silently resolved
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub column: String,
    pub value_left: String,
    pub value_right: String,
    pub canon_left: String,
    pub canon_right: String,
    pub match_probability: f64,
    /// Key column values shared by both sides
    pub block: Vec<String>,
}

#[derive(Debug)]
pub struct Resolution {
    /// Input table plus one `<col>_norm` column per resolved column
    pub table: Table,

    /// Review-band pairs of every column
    pub conflicts: Table,

    /// Audit file written for this call (`resolve_audited` only)
    pub audit_path: Option<PathBuf>,
}

// ============================================================================
// AUDIT
// ============================================================================

/// Review-band pairs of one run, keyed by audit directory
#[derive(Debug, Default)]
pub struct AuditLog {
    parts: RefCell<Vec<(PathBuf, Table)>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `conflicts` for the audit file in `dir` (empty tables are ignored)
    pub fn record(&self, dir: &Path, conflicts: Table) {
        if !conflicts.is_empty() {
            self.parts.borrow_mut().push((dir.to_path_buf(), conflicts));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.borrow().is_empty()
    }

    /// Write one file per audit directory with every recorded pair, in
    /// recording order, and clear the log
    pub fn write(&self, run: &RunInfo) -> Result<Vec<PathBuf>> {
        let mut by_dir: BTreeMap<PathBuf, Vec<Table>> = BTreeMap::new();
        for (dir, table) in self.parts.take() {
            by_dir.entry(dir).or_default().push(table);
        }

        let mut written = Vec::with_capacity(by_dir.len());
        for (dir, tables) in by_dir {
            let table = Table::concat(tables);
            let path = dir.join(audit_file_name(run));
            write_table(&path, &table)?;
            info!("📝 {} review-band pairs saved → {}", table.nrows(), path.display());
            written.push(path);
        }
        Ok(written)
    }
}

fn audit_file_name(run: &RunInfo) -> String {
    let run_id = run.run_id.simple().to_string();
    format!("conflicts_{}_{}.csv", run.timestamp(), &run_id[..8])
}

// ============================================================================
// ENGINE
// ============================================================================

/// One entry of the concatenated catalog + table set
struct Record {
    raw: String,
    canon: String,
    keys: Vec<String>,
}

/// Distinct (block keys, canon) value with its occurrence count
struct Node {
    canon: String,
    raw: String,
    keys: Vec<String>,
    count: usize,
    first_seen: usize,
}

/// Clusters and review-band pairs of one block
struct BlockOutcome {
    /// (node, representative node)
    assignments: Vec<(usize, usize)>,
    representatives: Vec<usize>,
    review: Vec<(usize, usize, f64)>,
    pairs: usize,
}

pub struct ResolutionEngine {
    params: ResolveParams,
    scorer: Box<dyn MatchScorer>,
}

impl ResolutionEngine {
    /// Engine with the default Fellegi–Sunter model
    pub fn new(params: ResolveParams) -> Self {
        let scorer = FellegiSunter::new().with_em_iterations(params.em_iterations);
        Self::with_scorer(params, Box::new(scorer))
    }

    pub fn with_scorer(params: ResolveParams, scorer: Box<dyn MatchScorer>) -> Self {
        ResolutionEngine { params, scorer }
    }

    pub fn params(&self) -> &ResolveParams {
        &self.params
    }

    /// Resolve every configured column of `table`. Writes catalogs but no
    /// audit file; the caller records `conflicts` where it sees fit.
    pub fn resolve(&self, table: &Table, run: &RunInfo) -> Result<Resolution> {
        self.params.validate()?;

        let mut out = table.clone();
        let mut conflicts: Vec<Conflict> = Vec::new();

        for column in &self.params.columns {
            let (normalized, mut found) = self.resolve_column(table, column, run)?;
            out.set_column(&format!("{column}_norm"), normalized)?;
            conflicts.append(&mut found);
        }

        Ok(Resolution {
            table: out,
            conflicts: self.conflicts_table(&conflicts)?,
            audit_path: None,
        })
    }

    /// `resolve`, then write this call's own audit file when there are conflicts
    pub fn resolve_audited(&self, table: &Table, run: &RunInfo) -> Result<Resolution> {
        let mut resolution = self.resolve(table, run)?;
        let audit = AuditLog::new();
        audit.record(&self.params.audit_dir, resolution.conflicts.clone());
        resolution.audit_path = audit.write(run)?.into_iter().next();
        Ok(resolution)
    }

    fn resolve_column(&self, table: &Table, column: &str, run: &RunInfo) -> Result<(Vec<String>, Vec<Conflict>)> {
        let p = &self.params;
        let missing = |col: &str| PipelineError::Schema {
            dataset: "working table".to_string(),
            column: col.to_string(),
        };

        let values = table.column(column).ok_or_else(|| missing(column))?;
        let key_values: Vec<&[String]> = p
            .key_columns
            .iter()
            .map(|k| table.column(k).ok_or_else(|| missing(k)))
            .collect::<Result<_>>()?;

        // 1. Catalog rows first, then table rows
        let mut catalog = Catalog::open(&p.catalog_dir, column)?;
        let history = catalog.load()?;
        let offset = history.len();

        let mut records: Vec<Record> = Vec::with_capacity(offset + table.nrows());
        for entry in &history {
            records.push(Record {
                raw: entry.representative.clone(),
                canon: canon(&entry.representative),
                keys: p
                    .key_columns
                    .iter()
                    .map(|k| entry.block.get(k).cloned().unwrap_or_default())
                    .collect(),
            });
        }
        for (r, raw) in values.iter().enumerate() {
            records.push(Record {
                raw: raw.clone(),
                canon: canon(raw),
                keys: key_values.iter().map(|col| col[r].clone()).collect(),
            });
        }

        // 2. Distinct values and blocks
        let mut nodes: Vec<Node> = Vec::new();
        let mut node_of: Vec<Option<usize>> = vec![None; records.len()];
        let mut node_index: HashMap<(Vec<String>, String), usize> = HashMap::new();
        let mut blocks: BTreeMap<Vec<String>, Vec<usize>> = BTreeMap::new();

        for (i, rec) in records.iter().enumerate() {
            if rec.canon.is_empty() {
                continue;
            }
            let id = *node_index
                .entry((rec.keys.clone(), rec.canon.clone()))
                .or_insert_with(|| {
                    nodes.push(Node {
                        canon: rec.canon.clone(),
                        raw: rec.raw.clone(),
                        keys: rec.keys.clone(),
                        count: 0,
                        first_seen: i,
                    });
                    let id = nodes.len() - 1;
                    let mut block_key = rec.keys.clone();
                    block_key.push(canon_prefix(&rec.canon, p.prefix_len));
                    blocks.entry(block_key).or_default().push(id);
                    id
                });
            nodes[id].count += 1;
            node_of[i] = Some(id);
        }

        // 3. Candidate pairs, block by block in sorted block order
        let blocks: Vec<Vec<usize>> = blocks.into_values().collect();
        let mut candidate: Vec<(&str, &str)> = Vec::new();
        for members in &blocks {
            for (i, &a) in members.iter().enumerate() {
                for &b in &members[i + 1..] {
                    candidate.push((nodes[a].canon.as_str(), nodes[b].canon.as_str()));
                }
            }
        }
        let fitted = self.scorer.fit(&candidate);
        let scorer: &dyn MatchScorer = fitted.as_deref().unwrap_or(self.scorer.as_ref());

        // 4-5. Score, cluster, pick representatives
        let outcomes: Vec<BlockOutcome> = blocks
            .par_iter()
            .map(|members| resolve_block(members, &nodes, scorer, p.prob_review, p.prob_auto))
            .collect();

        let mut rep_of: Vec<usize> = (0..nodes.len()).collect();
        let mut entries: Vec<CatalogEntry> = Vec::new();
        let mut review: Vec<(usize, usize, f64)> = Vec::new();
        let mut pair_count = 0;
        for outcome in outcomes {
            for (node, rep) in outcome.assignments {
                rep_of[node] = rep;
            }
            for rep in outcome.representatives {
                entries.push(CatalogEntry {
                    block: p
                        .key_columns
                        .iter()
                        .cloned()
                        .zip(nodes[rep].keys.iter().cloned())
                        .collect(),
                    representative: nodes[rep].canon.clone(),
                });
            }
            review.extend(outcome.review);
            pair_count += outcome.pairs;
        }

        // 6. Catalog rewrite
        entries.sort();
        catalog.replace_all(&entries, run)?;

        // 7. Normalized values for table rows only
        let normalized: Vec<String> = node_of[offset..]
            .iter()
            .map(|node| node.map(|n| nodes[rep_of[n]].canon.clone()).unwrap_or_default())
            .collect();

        // 8. Review band, highest probability first
        review.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));
        let conflicts: Vec<Conflict> = review
            .into_iter()
            .map(|(a, b, prob)| Conflict {
                column: column.to_string(),
                value_left: nodes[a].raw.clone(),
                value_right: nodes[b].raw.clone(),
                canon_left: nodes[a].canon.clone(),
                canon_right: nodes[b].canon.clone(),
                match_probability: prob,
                block: nodes[a].keys.clone(),
            })
            .collect();

        info!(
            "🧭 {}: {} records ({} from catalog), {} blocks, {} pairs, {} clusters, {} in review",
            column,
            records.len(),
            offset,
            blocks.len(),
            pair_count,
            entries.len(),
            conflicts.len()
        );

        Ok((normalized, conflicts))
    }

    fn conflicts_table(&self, conflicts: &[Conflict]) -> Result<Table> {
        let headers: Vec<String> = CONFLICT_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.params.key_columns.iter().cloned())
            .collect();

        let rows = conflicts.iter().map(|c| {
            let mut row = vec![
                c.column.clone(),
                c.value_left.clone(),
                c.value_right.clone(),
                c.canon_left.clone(),
                c.canon_right.clone(),
                format!("{:.4}", c.match_probability),
            ];
            row.extend(c.block.iter().cloned());
            row
        });

        Ok(Table::from_rows(headers, rows)?)
    }
}

/// Convenience wrapper: default model, one call, own audit file
pub fn resolve(table: &Table, params: &ResolveParams, run: &RunInfo) -> Result<Resolution> {
    ResolutionEngine::new(params.clone()).resolve_audited(table, run)
}

// ============================================================================
// PER-BLOCK CLUSTERING
// ============================================================================

/// Disjoint-set forest with path halving
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        DisjointSet {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Smaller index becomes the root
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// `members` are node ids in first-seen order
fn resolve_block(
    members: &[usize],
    nodes: &[Node],
    scorer: &dyn MatchScorer,
    prob_review: f64,
    prob_auto: f64,
) -> BlockOutcome {
    let mut dsu = DisjointSet::new(members.len());
    let mut review = Vec::new();
    let mut pairs = 0;

    for i in 0..members.len() {
        for j in (i + 1)..members.len() {
            let (a, b) = (members[i], members[j]);
            let prob = scorer.score(&nodes[a].canon, &nodes[b].canon).clamp(0.0, 1.0);
            pairs += 1;
            if prob >= prob_review {
                dsu.union(i, j);
                if prob < prob_auto {
                    review.push((a, b, prob));
                }
            }
        }
    }

    // Components in order of their first member
    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..members.len() {
        let root = dsu.find(i);
        components.entry(root).or_default().push(members[i]);
    }

    let mut assignments = Vec::with_capacity(members.len());
    let mut representatives = Vec::with_capacity(components.len());
    for group in components.values() {
        let rep = group
            .iter()
            .copied()
            .max_by(|&a, &b| {
                nodes[a]
                    .count
                    .cmp(&nodes[b].count)
                    .then_with(|| nodes[b].first_seen.cmp(&nodes[a].first_seen))
            })
            .unwrap_or(group[0]);
        representatives.push(rep);
        assignments.extend(group.iter().map(|&n| (n, rep)));
    }

    BlockOutcome {
        assignments,
        representatives,
        review,
        pairs,
    }
}

// ============================================================================
// TESTS
// ============================================================================
