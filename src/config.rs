// ⚙️ Pipeline Config - one immutable YAML document per run
//
// Loaded once, validated before any dataset is read, then passed by
// reference into every stage. Mapping order of `datasets`, `columns`
// and `builders` is preserved because declared order is semantic.

use crate::address::ParserKind;
use crate::error::{PipelineError, Result};
use serde::de::{DeserializeOwned, Error as DeError};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// ORDERED MAPPINGS
// ============================================================================

fn ordered<'de, D, T>(deserializer: D) -> std::result::Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let map = serde_yaml::Mapping::deserialize(deserializer)?;
    map.into_iter()
        .map(|(k, v)| {
            let key = match k {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                other => return Err(D::Error::custom(format!("unsupported key: {other:?}"))),
            };
            let value = serde_yaml::from_value(v).map_err(D::Error::custom)?;
            Ok((key, value))
        })
        .collect()
}

pub(crate) fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

// ============================================================================
// DATASETS + COLUMNS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetSpec {
    pub dir: PathBuf,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Optional running member index per group
    #[serde(default)]
    pub sequence: Option<SequenceSpec>,
}

fn default_pattern() -> String {
    "*".to_string()
}

/// `sequence: { by: id_parcela, as: miembro }`
#[derive(Debug, Clone, Deserialize)]
pub struct SequenceSpec {
    pub by: String,
    #[serde(rename = "as")]
    pub as_: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ColumnTarget {
    Rename {
        #[serde(rename = "as")]
        as_: String,
    },
    Name(String),
}

impl ColumnTarget {
    pub fn name(&self) -> &str {
        match self {
            ColumnTarget::Rename { as_ } => as_,
            ColumnTarget::Name(n) => n,
        }
    }
}

/// Ordered source column → target name mapping for one dataset
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnMap(#[serde(deserialize_with = "ordered")] pub Vec<(String, ColumnTarget)>);

impl ColumnMap {
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(src, t)| (src.as_str(), t.name()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What to do when a mapped column is absent from a loaded file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnsMode {
    /// Keep what exists, warn about the rest
    #[default]
    KeepExisting,
    /// Missing mapped column is a SchemaError
    Strict,
}

// ============================================================================
// JOIN + UNIFY
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinHow {
    Inner,
    #[default]
    Left,
    Right,
    Outer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Cardinality {
    #[serde(rename = "one_to_one", alias = "1:1")]
    OneToOne,
    #[serde(rename = "one_to_many", alias = "1:m")]
    OneToMany,
    #[serde(rename = "many_to_one", alias = "m:1")]
    ManyToOne,
    #[serde(rename = "many_to_many", alias = "m:m")]
    ManyToMany,
}

impl Cardinality {
    pub fn left_unique(&self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::OneToMany)
    }

    pub fn right_unique(&self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::ManyToOne)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::OneToOne => "one_to_one",
            Cardinality::OneToMany => "one_to_many",
            Cardinality::ManyToOne => "many_to_one",
            Cardinality::ManyToMany => "many_to_many",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinSpec {
    pub left: String,
    pub right: String,
    #[serde(default)]
    pub how: JoinHow,
    #[serde(deserialize_with = "one_or_many")]
    pub on: Vec<String>,
    #[serde(default)]
    pub validate: Option<Cardinality>,
    /// Suffixes for non-key columns present on both sides
    #[serde(default = "default_suffixes")]
    pub suffixes: (String, String),
}

fn default_suffixes() -> (String, String) {
    ("_x".to_string(), "_y".to_string())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[default]
    Left,
    Right,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnifyRule {
    pub name: String,
    #[serde(default)]
    pub prefer: Side,
}

// ============================================================================
// BUILDERS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    #[default]
    Row,
    Vector,
    Frame,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuilderSpec {
    /// Qualified reference into the builder registry, e.g. `resolve.normalize_columns`
    pub using: String,
    #[serde(default)]
    pub apply: ApplyMode,
    #[serde(default)]
    pub params: serde_yaml::Mapping,
    #[serde(default)]
    pub source: Option<String>,
}

// ============================================================================
// OUTPUT
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct OutputSpec {
    pub dir: PathBuf,
    /// File name template; `{date}`, `{base}` and `{hash}` are expanded
    pub name: String,
    #[serde(default)]
    pub sort_by: Option<Vec<String>>,
    #[serde(default)]
    pub counts_by: Option<String>,
}

// ============================================================================
// RECONCILIATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ExactReference,
    AddressComposite,
    RelaxedComposite,
}

impl Stage {
    pub fn all() -> Vec<Stage> {
        vec![Stage::ExactReference, Stage::AddressComposite, Stage::RelaxedComposite]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ExactReference => "exact_reference",
            Stage::AddressComposite => "address_composite",
            Stage::RelaxedComposite => "relaxed_composite",
        }
    }
}

/// Where one side's full reference comes from: a precomposed column,
/// or the four parts that compose it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferenceColumns {
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub parcel: Option<String>,
    #[serde(default)]
    pub count: Option<String>,
    #[serde(default)]
    pub control1: Option<String>,
    #[serde(default)]
    pub control2: Option<String>,
}

impl ReferenceColumns {
    fn check(&self, side: &str) -> Result<()> {
        if self.column.is_some() {
            return Ok(());
        }
        if self.parcel.is_none() || self.count.is_none() || self.control1.is_none() || self.control2.is_none() {
            return Err(PipelineError::config(format!(
                "reconcile.reference.{side}: needs `column` or all of parcel/count/control1/control2"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceSpec {
    pub union: ReferenceColumns,
    pub registry: ReferenceColumns,
    #[serde(default = "default_ref_width")]
    pub width: usize,
}

fn default_ref_width() -> usize {
    4
}

/// Paired column tuples compared field by field
#[derive(Debug, Clone, Deserialize)]
pub struct TupleSpec {
    pub union: Vec<String>,
    pub registry: Vec<String>,
}

impl TupleSpec {
    fn check(&self, name: &str) -> Result<()> {
        if self.union.is_empty() || self.union.len() != self.registry.len() {
            return Err(PipelineError::config(format!(
                "reconcile.{name}: union and registry must list the same non-zero number of columns"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileSpec {
    /// Dataset name of the external registry (loaded, never joined)
    pub registry: String,
    #[serde(default = "Stage::all")]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub reference: Option<ReferenceSpec>,
    #[serde(default)]
    pub address: Option<TupleSpec>,
    #[serde(default)]
    pub relaxed: Option<TupleSpec>,
}

// ============================================================================
// PIPELINE CONFIG
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(deserialize_with = "ordered")]
    pub datasets: Vec<(String, DatasetSpec)>,
    #[serde(default)]
    pub columns: HashMap<String, ColumnMap>,
    pub join: JoinSpec,
    #[serde(default)]
    pub unify_cols: Vec<UnifyRule>,
    #[serde(default, deserialize_with = "ordered")]
    pub builders: Vec<(String, BuilderSpec)>,
    pub output: OutputSpec,
    #[serde(default)]
    pub columns_mode: ColumnsMode,
    #[serde(default)]
    pub address_parser: ParserKind,
    #[serde(default)]
    pub reconcile: Option<ReconcileSpec>,

    /// Directory relative paths resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// Config file stem (`{base}` token)
    #[serde(skip)]
    pub base_name: String,
    /// Short SHA-256 of the config text (`{hash}` token)
    #[serde(skip)]
    pub hash: String,
}

impl PipelineConfig {
    /// Read, parse and validate a YAML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut cfg = Self::from_yaml(&text)?;
        cfg.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        cfg.base_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("pipeline")
            .to_string();
        Ok(cfg)
    }

    /// Parse and validate YAML text (paths resolve against the current directory)
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut cfg: PipelineConfig = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::config(format!("invalid YAML: {e}")))?;
        cfg.base_name = "pipeline".to_string();
        cfg.hash = short_hash(text);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetSpec> {
        self.datasets.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn column_map(&self, dataset: &str) -> Option<&ColumnMap> {
        self.columns.get(dataset)
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Output file name with tokens expanded
    pub fn output_name(&self, date: &str) -> String {
        self.output
            .name
            .replace("{date}", date)
            .replace("{base}", &self.base_name)
            .replace("{hash}", &self.hash)
    }

    /// Every structural check, before any file is touched
    pub fn validate(&self) -> Result<()> {
        if self.datasets.is_empty() {
            return Err(PipelineError::config("`datasets` is empty"));
        }
        for (name, ds) in &self.datasets {
            if ds.pattern.trim().is_empty() {
                return Err(PipelineError::config(format!("datasets.{name}.pattern is empty")));
            }
            if let Some(seq) = &ds.sequence {
                if seq.by.is_empty() || seq.as_.is_empty() {
                    return Err(PipelineError::config(format!(
                        "datasets.{name}.sequence needs `by` and `as`"
                    )));
                }
            }
        }

        for name in self.columns.keys() {
            if self.dataset(name).is_none() {
                return Err(PipelineError::config(format!("columns.{name}: unknown dataset")));
            }
        }

        for (role, name) in [("left", &self.join.left), ("right", &self.join.right)] {
            if self.dataset(name).is_none() {
                return Err(PipelineError::config(format!("join.{role}: unknown dataset '{name}'")));
            }
        }
        if self.join.on.is_empty() {
            return Err(PipelineError::config("join.on lists no key columns"));
        }

        for rule in &self.unify_cols {
            if rule.name.is_empty() {
                return Err(PipelineError::config("unify_cols entry without `name`"));
            }
        }

        for (name, builder) in &self.builders {
            if builder.using.trim().is_empty() {
                return Err(PipelineError::config(format!("builders.{name}.using is empty")));
            }
            if builder.apply == ApplyMode::Vector && builder.source.is_none() {
                return Err(PipelineError::config(format!(
                    "builders.{name}: apply=vector requires `source`"
                )));
            }
        }

        if self.output.name.trim().is_empty() {
            return Err(PipelineError::config("output.name is empty"));
        }

        if let Some(rec) = &self.reconcile {
            self.validate_reconcile(rec)?;
        }

        Ok(())
    }

    fn validate_reconcile(&self, rec: &ReconcileSpec) -> Result<()> {
        if self.dataset(&rec.registry).is_none() {
            return Err(PipelineError::config(format!(
                "reconcile.registry: unknown dataset '{}'",
                rec.registry
            )));
        }
        if rec.stages.is_empty() {
            return Err(PipelineError::config("reconcile.stages is empty"));
        }
        for stage in &rec.stages {
            match stage {
                Stage::ExactReference => {
                    let reference = rec.reference.as_ref().ok_or_else(|| {
                        PipelineError::config("reconcile: stage exact_reference needs `reference`")
                    })?;
                    reference.union.check("union")?;
                    reference.registry.check("registry")?;
                }
                Stage::AddressComposite => rec
                    .address
                    .as_ref()
                    .ok_or_else(|| PipelineError::config("reconcile: stage address_composite needs `address`"))?
                    .check("address")?,
                Stage::RelaxedComposite => rec
                    .relaxed
                    .as_ref()
                    .ok_or_else(|| PipelineError::config("reconcile: stage relaxed_composite needs `relaxed`"))?
                    .check("relaxed")?,
            }
        }
        Ok(())
    }
}

/// First 8 hex chars of the SHA-256 of `text`
pub fn short_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())[..8].to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
datasets:
  bien: { dir: data/bien, pattern: "*.csv", sequence: { by: id_parcela, as: miembro } }
  titular: { dir: data/titular, pattern: "tit_*.csv" }
columns:
  bien:
    PARCELA: { as: id_parcela }
    CALLE: { as: nombre_bien }
  titular:
    PARCELA: id_parcela
join: { left: bien, right: titular, how: outer, on: [id_parcela, miembro], validate: one_to_one }
unify_cols:
  - { name: nif, prefer: right }
builders:
  zeta: { using: text.canon, apply: vector, source: nombre_bien }
  alpha: { using: resolve.normalize_columns, apply: frame, params: { columns: [nombre_bien] } }
output: { dir: out, name: "union_{date}_{base}.csv" }
"#;

    #[test]
    fn test_parse_preserves_declared_order() {
        let cfg = PipelineConfig::from_yaml(BASIC).unwrap();

        let names: Vec<&str> = cfg.builders.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);

        let cols: Vec<(&str, &str)> = cfg.column_map("bien").unwrap().pairs().collect();
        assert_eq!(cols, vec![("PARCELA", "id_parcela"), ("CALLE", "nombre_bien")]);
        assert_eq!(cfg.column_map("titular").unwrap().pairs().next(), Some(("PARCELA", "id_parcela")));

        assert_eq!(cfg.join.how, JoinHow::Outer);
        assert_eq!(cfg.join.validate, Some(Cardinality::OneToOne));
        assert_eq!(cfg.unify_cols[0].prefer, Side::Right);
        assert_eq!(cfg.builders[1].1.apply, ApplyMode::Frame);
    }

    #[test]
    fn test_output_name_tokens() {
        let cfg = PipelineConfig::from_yaml(BASIC).unwrap();
        assert_eq!(cfg.output_name("20240101"), "union_20240101_pipeline.csv");
        assert_eq!(cfg.hash.len(), 8);
    }

    #[test]
    fn test_unknown_join_dataset_is_config_error() {
        let yaml = BASIC.replace("right: titular", "right: nope");
        let err = PipelineConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("nope")));
    }

    #[test]
    fn test_vector_builder_needs_source() {
        let yaml = BASIC.replace(", source: nombre_bien", "");
        let err = PipelineConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("zeta")));
    }

    #[test]
    fn test_single_join_key_string() {
        let yaml = BASIC.replace("on: [id_parcela, miembro]", "on: id_parcela");
        let cfg = PipelineConfig::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.join.on, vec!["id_parcela".to_string()]);
    }

    #[test]
    fn test_reconcile_stage_requirements() {
        let yaml = format!("{BASIC}reconcile: {{ registry: titular, stages: [address_composite] }}\n");
        let err = PipelineConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("address")));
    }
}
