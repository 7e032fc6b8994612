// 🧱 Builder Executor - named transformation steps over the working table
//
// Builders are looked up by their qualified reference (`using:`) in a
// registry built once at startup. Every reference is resolved before the
// first builder runs, so an unknown name aborts the run before any work.
//
// Three shapes:
//   row    → params parsed once, then one value per row, stored in a column
//            named after the builder
//   vector → one full column in (the builder's `source`), one column out
//   frame  → whole table in, whole table out (plus optional side tables)

pub mod builtin;

use crate::address::AddressParser;
use crate::config::{ApplyMode, BuilderSpec};
use crate::error::{PipelineError, Result};
use crate::resolution::AuditLog;
use crate::run::RunInfo;
use crate::table::{Row, Table};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub type Params = serde_yaml::Mapping;

/// Per-row function prepared by a row builder
pub type RowMapper<'a> = Box<dyn Fn(&Row<'_>) -> anyhow::Result<String> + 'a>;

pub type RowFn = for<'a> fn(&Params, &RunContext<'a>) -> anyhow::Result<RowMapper<'a>>;
pub type VectorFn = fn(&[String], &Params, &RunContext<'_>) -> anyhow::Result<Vec<String>>;
pub type FrameFn = fn(Table, &Params, &RunContext<'_>) -> anyhow::Result<FrameOutput>;

/// Checks a builder's params when the registry resolves it
pub type ParamsCheck = fn(&Params) -> anyhow::Result<()>;

/// Everything a builder may use besides its table and params
pub struct RunContext<'a> {
    /// Address parser selected for this run
    pub parser: &'a dyn AddressParser,
    pub run: &'a RunInfo,
    /// Directory relative paths in params resolve against
    pub base_dir: &'a Path,
    /// Review-band pairs collected for this run's audit file
    pub audit: &'a AuditLog,
}

impl RunContext<'_> {
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// Result of a frame builder: the new working table plus named side tables
#[derive(Debug, Default)]
pub struct FrameOutput {
    pub table: Table,
    pub side_tables: Vec<(String, Table)>,
}

impl FrameOutput {
    pub fn new(table: Table) -> Self {
        FrameOutput {
            table,
            side_tables: Vec::new(),
        }
    }

    pub fn with_side(mut self, name: &str, table: Table) -> Self {
        self.side_tables.push((name.to_string(), table));
        self
    }
}

#[derive(Clone, Copy)]
pub enum BuilderFn {
    Row(RowFn),
    Vector(VectorFn),
    Frame(FrameFn),
}

impl BuilderFn {
    pub fn mode(&self) -> ApplyMode {
        match self {
            BuilderFn::Row(_) => ApplyMode::Row,
            BuilderFn::Vector(_) => ApplyMode::Vector,
            BuilderFn::Frame(_) => ApplyMode::Frame,
        }
    }
}

/// Typed params of one builder
pub trait BuilderParams: DeserializeOwned {
    /// Value checks beyond what deserialization enforces
    fn check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Deserialize and check builder params
pub fn parse_params<T: BuilderParams>(params: &Params) -> anyhow::Result<T> {
    let parsed: T = serde_yaml::from_value(serde_yaml::Value::Mapping(params.clone()))?;
    parsed.check()?;
    Ok(parsed)
}

/// `ParamsCheck` for any typed params struct
pub fn check_params<T: BuilderParams>(params: &Params) -> anyhow::Result<()> {
    parse_params::<T>(params).map(|_| ())
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Clone, Copy)]
struct RegistryEntry {
    func: BuilderFn,
    check: Option<ParamsCheck>,
}

pub struct BuilderRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        BuilderRegistry {
            entries: HashMap::new(),
        }
    }

    /// Registry with every built-in builder
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, reference: &str, builder: BuilderFn) {
        self.entries.insert(reference.to_string(), RegistryEntry { func: builder, check: None });
    }

    /// Register a builder whose params are checked at resolution time
    pub fn register_checked(&mut self, reference: &str, builder: BuilderFn, check: ParamsCheck) {
        self.entries.insert(
            reference.to_string(),
            RegistryEntry {
                func: builder,
                check: Some(check),
            },
        );
    }

    pub fn get(&self, reference: &str) -> Option<BuilderFn> {
        self.entries.get(reference).map(|e| e.func)
    }

    pub fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        refs.sort();
        refs
    }

    /// Resolve every declared builder, in declared order, and check its params
    pub fn resolve(&self, specs: &[(String, BuilderSpec)]) -> Result<Vec<ResolvedBuilder>> {
        specs
            .iter()
            .map(|(name, spec)| {
                let entry = self.entries.get(&spec.using).ok_or_else(|| PipelineError::BuilderResolution {
                    builder: name.clone(),
                    reference: spec.using.clone(),
                })?;
                let func = entry.func;
                if func.mode() != spec.apply {
                    return Err(PipelineError::BuilderContract {
                        builder: name.clone(),
                        reason: format!(
                            "'{}' is a {:?} builder but apply = {:?}",
                            spec.using,
                            func.mode(),
                            spec.apply
                        ),
                    });
                }
                if let Some(check) = entry.check {
                    check(&spec.params)
                        .map_err(|e| PipelineError::config(format!("builders.{name}.params: {e:#}")))?;
                }
                Ok(ResolvedBuilder {
                    name: name.clone(),
                    spec: spec.clone(),
                    func,
                })
            })
            .collect()
    }
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub struct ResolvedBuilder {
    pub name: String,
    pub spec: BuilderSpec,
    pub func: BuilderFn,
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// A side table produced by a frame builder
#[derive(Debug)]
pub struct SideTable {
    pub builder: String,
    pub name: String,
    pub table: Table,
}

#[derive(Debug)]
pub struct BuildOutput {
    pub table: Table,
    pub side_tables: Vec<SideTable>,
}

/// Apply `builders` strictly in order; each sees the previous one's output
pub fn run_builders(table: Table, builders: &[ResolvedBuilder], ctx: &RunContext<'_>) -> Result<BuildOutput> {
    let mut table = table;
    let mut side_tables = Vec::new();

    for builder in builders {
        debug!("builder {} ({}) on {} rows", builder.name, builder.spec.using, table.nrows());
        table = match builder.func {
            BuilderFn::Row(f) => apply_row(table, builder, f, ctx)?,
            BuilderFn::Vector(f) => apply_vector(table, builder, f, ctx)?,
            BuilderFn::Frame(f) => {
                let out = f(table, &builder.spec.params, ctx)
                    .map_err(|e| PipelineError::failed(&builder.name, None, format!("{e:#}")))?;
                for (name, side) in out.side_tables {
                    side_tables.push(SideTable {
                        builder: builder.name.clone(),
                        name,
                        table: side,
                    });
                }
                out.table
            }
        };
        info!("🧱 {} done: {} rows × {} columns", builder.name, table.nrows(), table.ncols());
    }

    Ok(BuildOutput { table, side_tables })
}

fn apply_row(mut table: Table, builder: &ResolvedBuilder, f: RowFn, ctx: &RunContext<'_>) -> Result<Table> {
    let mapper = f(&builder.spec.params, ctx)
        .map_err(|e| PipelineError::failed(&builder.name, None, format!("{e:#}")))?;
    let values = table
        .rows()
        .map(|row| {
            mapper(&row).map_err(|e| PipelineError::failed(&builder.name, Some(row.index()), format!("{e:#}")))
        })
        .collect::<Result<Vec<String>>>()?;
    table.set_column(&builder.name, values)?;
    Ok(table)
}

fn apply_vector(mut table: Table, builder: &ResolvedBuilder, f: VectorFn, ctx: &RunContext<'_>) -> Result<Table> {
    let source = builder.spec.source.as_deref().unwrap_or_default();
    let input = table.column(source).ok_or_else(|| {
        PipelineError::failed(&builder.name, None, format!("source column '{source}' not found"))
    })?;

    let output = f(input, &builder.spec.params, ctx)
        .map_err(|e| PipelineError::failed(&builder.name, None, format!("{e:#}")))?;

    if output.len() != input.len() {
        return Err(PipelineError::BuilderContract {
            builder: builder.name.clone(),
            reason: format!("vector result has {} values for {} rows", output.len(), input.len()),
        });
    }

    table.set_column(&builder.name, output)?;
    Ok(table)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{get_parser, ParserKind};

    fn s(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn create_test_spec(using: &str, apply: ApplyMode, source: Option<&str>) -> BuilderSpec {
        BuilderSpec {
            using: using.to_string(),
            apply,
            params: Params::new(),
            source: source.map(str::to_string),
        }
    }

    fn upper_row<'a>(_: &Params, _: &RunContext<'a>) -> anyhow::Result<RowMapper<'a>> {
        Ok(Box::new(|row: &Row<'_>| -> anyhow::Result<String> {
            let v = row.get("calle");
            anyhow::ensure!(!v.is_empty(), "empty street");
            Ok(v.to_uppercase())
        }))
    }

    #[derive(serde::Deserialize)]
    struct LimitParams {
        max: usize,
    }

    impl BuilderParams for LimitParams {
        fn check(&self) -> anyhow::Result<()> {
            anyhow::ensure!(self.max > 0, "max must be positive");
            Ok(())
        }
    }

    fn short_vector(values: &[String], _: &Params, _: &RunContext<'_>) -> anyhow::Result<Vec<String>> {
        Ok(values.iter().skip(1).cloned().collect())
    }

    fn drop_all(table: Table, _: &Params, _: &RunContext<'_>) -> anyhow::Result<FrameOutput> {
        let empty = Table::new(table.headers().to_vec())?;
        Ok(FrameOutput::new(empty).with_side("dropped", table))
    }

    fn create_test_registry() -> BuilderRegistry {
        let mut registry = BuilderRegistry::new();
        registry.register("test.upper", BuilderFn::Row(upper_row));
        registry.register("test.short", BuilderFn::Vector(short_vector));
        registry.register("test.drop_all", BuilderFn::Frame(drop_all));
        registry.register_checked("test.limited", BuilderFn::Frame(drop_all), check_params::<LimitParams>);
        registry
    }

    fn with_ctx<T>(f: impl FnOnce(&RunContext<'_>) -> T) -> T {
        let parser = get_parser(ParserKind::Regex);
        let run = RunInfo::new("t");
        let audit = AuditLog::new();
        let ctx = RunContext {
            parser: parser.as_ref(),
            run: &run,
            base_dir: Path::new("."),
            audit: &audit,
        };
        f(&ctx)
    }

    fn create_test_table() -> Table {
        Table::from_columns(vec![("calle", s(&["mayor", "sol"]))]).unwrap()
    }

    #[test]
    fn test_unknown_reference_fails_before_running() {
        let specs = vec![
            ("ok".to_string(), create_test_spec("test.upper", ApplyMode::Row, None)),
            ("bad".to_string(), create_test_spec("test.nope", ApplyMode::Row, None)),
        ];
        let err = create_test_registry().resolve(&specs).err().unwrap();
        assert!(matches!(err, PipelineError::BuilderResolution { ref builder, ref reference }
            if builder == "bad" && reference == "test.nope"));
    }

    #[test]
    fn test_declared_mode_must_match() {
        let specs = vec![("x".to_string(), create_test_spec("test.upper", ApplyMode::Frame, None))];
        let err = create_test_registry().resolve(&specs).err().unwrap();
        assert!(matches!(err, PipelineError::BuilderContract { .. }));
    }

    #[test]
    fn test_bad_params_are_config_errors_at_resolution() {
        let mut spec = create_test_spec("test.limited", ApplyMode::Frame, None);
        spec.params = serde_yaml::from_str("{ max: 0 }").unwrap();
        let specs = vec![
            ("ok".to_string(), create_test_spec("test.upper", ApplyMode::Row, None)),
            ("limit".to_string(), spec),
        ];

        let err = create_test_registry().resolve(&specs).err().unwrap();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("builders.limit.params")));

        let mut missing = create_test_spec("test.limited", ApplyMode::Frame, None);
        missing.params = Params::new();
        let err = create_test_registry().resolve(&[("limit".to_string(), missing)]).err().unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_row_builder_adds_named_column() {
        let specs = vec![("calle_up".to_string(), create_test_spec("test.upper", ApplyMode::Row, None))];
        let builders = create_test_registry().resolve(&specs).unwrap();
        let out = with_ctx(|ctx| run_builders(create_test_table(), &builders, ctx)).unwrap();
        assert_eq!(out.table.column("calle_up").unwrap(), &["MAYOR", "SOL"]);
    }

    #[test]
    fn test_row_error_aborts_with_row_index() {
        let specs = vec![("calle_up".to_string(), create_test_spec("test.upper", ApplyMode::Row, None))];
        let builders = create_test_registry().resolve(&specs).unwrap();
        let table = Table::from_columns(vec![("calle", s(&["mayor", ""]))]).unwrap();

        let err = with_ctx(|ctx| run_builders(table, &builders, ctx)).unwrap_err();
        assert!(matches!(err, PipelineError::BuilderFailed { row: Some(1), .. }));
    }

    #[test]
    fn test_vector_length_mismatch_is_contract_error() {
        let specs = vec![("v".to_string(), create_test_spec("test.short", ApplyMode::Vector, Some("calle")))];
        let builders = create_test_registry().resolve(&specs).unwrap();
        let err = with_ctx(|ctx| run_builders(create_test_table(), &builders, ctx)).unwrap_err();
        assert!(matches!(err, PipelineError::BuilderContract { ref builder, .. } if builder == "v"));
    }

    #[test]
    fn test_frame_replaces_table_in_declared_order() {
        let specs = vec![
            ("calle_up".to_string(), create_test_spec("test.upper", ApplyMode::Row, None)),
            ("purge".to_string(), create_test_spec("test.drop_all", ApplyMode::Frame, None)),
        ];
        let builders = create_test_registry().resolve(&specs).unwrap();
        let out = with_ctx(|ctx| run_builders(create_test_table(), &builders, ctx)).unwrap();

        assert!(out.table.is_empty());
        assert_eq!(out.side_tables.len(), 1);
        assert_eq!(out.side_tables[0].builder, "purge");
        // Side table saw the row builder's column
        assert!(out.side_tables[0].table.has_column("calle_up"));
    }

    #[test]
    fn test_default_registry_lists_builtins() {
        let registry = BuilderRegistry::with_defaults();
        let refs = registry.references();
        for r in ["text.canon", "resolve.normalize_columns", "address.parse", "street.assign_code"] {
            assert!(refs.contains(&r), "{r}");
        }
    }
}
