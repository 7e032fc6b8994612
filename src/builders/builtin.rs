// Built-in builders, registered under `<area>.<name>` references

use super::{
    check_params, parse_params, BuilderFn, BuilderParams, BuilderRegistry, FrameOutput, Params, RowMapper, RunContext,
};
use crate::address::{build_full_address, has_conflict, ParsedAddress};
use crate::canon::canon;
use crate::loader::read_table;
use crate::reconciliation::full_reference;
use crate::resolution::{ResolutionEngine, ResolveParams};
use crate::table::{Row, Table};
use anyhow::{anyhow, Context};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};

pub fn register_all(registry: &mut BuilderRegistry) {
    registry.register("text.canon", BuilderFn::Vector(text_canon));
    registry.register_checked(
        "reference.full_reference",
        BuilderFn::Row(reference_full),
        check_params::<FullReferenceParams>,
    );
    registry.register_checked("address.normalize", BuilderFn::Row(address_normalize), check_params::<AddressFields>);
    registry.register_checked("address.parse", BuilderFn::Frame(address_parse), check_params::<ParseParams>);
    registry.register_checked(
        "address.conflicts",
        BuilderFn::Frame(address_conflicts),
        check_params::<ConflictParams>,
    );
    registry.register_checked(
        "street.assign_code",
        BuilderFn::Frame(street_assign_code),
        check_params::<AssignCodeParams>,
    );
    registry.register_checked(
        "resolve.normalize_columns",
        BuilderFn::Frame(resolve_columns),
        check_params::<ResolveParams>,
    );
}

// ============================================================================
// TEXT + REFERENCE
// ============================================================================

fn text_canon(values: &[String], _params: &Params, _ctx: &RunContext<'_>) -> anyhow::Result<Vec<String>> {
    Ok(values.iter().map(|v| canon(v)).collect())
}

#[derive(Debug, Deserialize)]
struct FullReferenceParams {
    parcel: String,
    count: String,
    control1: String,
    control2: String,
    #[serde(default = "default_width")]
    width: usize,
}

fn default_width() -> usize {
    4
}

impl BuilderParams for FullReferenceParams {}

fn reference_full<'a>(params: &Params, _ctx: &RunContext<'a>) -> anyhow::Result<RowMapper<'a>> {
    let p: FullReferenceParams = parse_params(params)?;
    Ok(Box::new(move |row: &Row<'_>| -> anyhow::Result<String> {
        Ok(full_reference(
            row.get(&p.parcel),
            row.get(&p.count),
            row.get(&p.control1),
            row.get(&p.control2),
            p.width,
        ))
    }))
}

// ============================================================================
// ADDRESSES
// ============================================================================

/// Source column per address field; absent fields are skipped
#[derive(Debug, Default, Deserialize)]
struct AddressFields {
    #[serde(default)]
    street: Option<String>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    staircase: Option<String>,
    #[serde(default)]
    floor: Option<String>,
    #[serde(default)]
    door: Option<String>,
}

impl BuilderParams for AddressFields {}

impl AddressFields {
    /// One address line; staircase/floor/door carry their keyword so the
    /// parser can find them again
    fn full_address(&self, row: &Row<'_>) -> String {
        let value = |col: &Option<String>| col.as_deref().map(|c| row.get(c).trim()).unwrap_or("");
        let labelled = |label: &str, col: &Option<String>| match value(col) {
            "" => String::new(),
            v => format!("{label} {v}"),
        };

        let parts = [
            value(&self.street).to_string(),
            value(&self.number).to_string(),
            value(&self.unit).to_string(),
            labelled("ESC", &self.staircase),
            labelled("PL", &self.floor),
            labelled("PT", &self.door),
        ];
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        build_full_address(&refs)
    }
}

fn address_normalize<'a>(params: &Params, ctx: &RunContext<'a>) -> anyhow::Result<RowMapper<'a>> {
    let fields: AddressFields = parse_params(params)?;
    let parser = ctx.parser;
    Ok(Box::new(move |row: &Row<'_>| -> anyhow::Result<String> {
        Ok(parser.parse(&fields.full_address(row)).normalized())
    }))
}

#[derive(Debug, Deserialize)]
struct ParseParams {
    prefix: String,
    #[serde(flatten)]
    fields: AddressFields,
}

impl BuilderParams for ParseParams {
    fn check(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.prefix.trim().is_empty(), "`prefix` is empty");
        Ok(())
    }
}

fn address_parse(mut table: Table, params: &Params, ctx: &RunContext<'_>) -> anyhow::Result<FrameOutput> {
    let p: ParseParams = parse_params(params)?;

    let parsed: Vec<ParsedAddress> = table
        .rows()
        .map(|row| ctx.parser.parse(&p.fields.full_address(&row)))
        .collect();

    table.set_column(
        &format!("normalized_address_{}", p.prefix),
        parsed.iter().map(ParsedAddress::normalized).collect(),
    )?;
    for field in ParsedAddress::FIELDS {
        let values = parsed
            .iter()
            .map(|a| a.field(field).unwrap_or_default().to_string())
            .collect();
        table.set_column(&format!("{}_{}", p.prefix, field), values)?;
    }

    Ok(FrameOutput::new(table))
}

#[derive(Debug, Deserialize)]
struct ConflictParams {
    key: String,
    columns: Vec<String>,
}

impl BuilderParams for ConflictParams {
    fn check(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.columns.len() >= 2, "need at least two address columns to compare");
        Ok(())
    }
}

/// Flags entity keys whose normalized addresses disagree across sources
fn address_conflicts(mut table: Table, params: &Params, _ctx: &RunContext<'_>) -> anyhow::Result<FrameOutput> {
    let p: ConflictParams = parse_params(params)?;
    for col in std::iter::once(&p.key).chain(&p.columns) {
        anyhow::ensure!(table.has_column(col), "column '{col}' not found");
    }

    // key → per column distinct values, in first-seen key order
    let mut order: Vec<String> = Vec::new();
    let mut seen: HashMap<String, Vec<BTreeSet<String>>> = HashMap::new();
    for row in table.rows() {
        let key = row.get(&p.key);
        if key.is_empty() {
            continue;
        }
        let sets = seen.entry(key.to_string()).or_insert_with(|| {
            order.push(key.to_string());
            vec![BTreeSet::new(); p.columns.len()]
        });
        for (set, col) in sets.iter_mut().zip(&p.columns) {
            let v = row.get(col);
            if !v.is_empty() {
                set.insert(v.to_string());
            }
        }
    }

    let conflicting: BTreeSet<&String> = seen
        .iter()
        .filter(|(_, sets)| has_conflict(sets.iter().map(|set| set.iter().map(String::as_str))))
        .map(|(k, _)| k)
        .collect();

    let flags: Vec<String> = table
        .column(&p.key)
        .unwrap_or_default()
        .iter()
        .map(|k| if conflicting.contains(k) { "1".to_string() } else { String::new() })
        .collect();

    let mut headers = vec![p.key.clone()];
    headers.extend(p.columns.iter().cloned());
    let rows = order.iter().filter(|k| conflicting.contains(k)).map(|k| {
        let mut row = vec![k.clone()];
        if let Some(sets) = seen.get(k) {
            row.extend(sets.iter().map(|s| s.iter().cloned().collect::<Vec<_>>().join(" | ")));
        }
        row
    });
    let side = Table::from_rows(headers, rows)?;

    info!("🏠 {} of {} keys with conflicting addresses", side.nrows(), order.len());
    table.set_column("address_conflict", flags)?;
    Ok(FrameOutput::new(table).with_side("conflicts", side))
}

// ============================================================================
// STREET CODES
// ============================================================================

#[derive(Debug, Deserialize)]
struct AssignCodeParams {
    /// Reference table with street names and their codes
    reference: PathBuf,
    name_column: String,
    code_column: String,
    source: String,
    #[serde(default = "default_code_target")]
    target: String,
    #[serde(default = "default_normalized_target")]
    normalized: String,
}

impl BuilderParams for AssignCodeParams {}

fn default_code_target() -> String {
    "codvia_asignado".to_string()
}

fn default_normalized_target() -> String {
    "nombre_normalizado".to_string()
}

fn parenthesized() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| Regex::new(r"\(.*?\)").expect("static parenthesis pattern"))
}

/// Uppercase, parenthesised fragments removed, commas as spaces, single spaces
pub fn normalize_street_name(text: &str) -> String {
    let text = parenthesized().replace_all(text, "");
    text.replace(',', " ")
        .to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `PARISH - AREA` is looked up as `AREA-PARISH`; plain names as themselves
pub fn street_lookup_key(name: &str) -> String {
    let norm = normalize_street_name(name);
    if !norm.contains('-') {
        return norm;
    }
    let parts: Vec<&str> = norm.split('-').map(str::trim).filter(|p| !p.is_empty()).collect();
    match parts.split_first() {
        Some((parish, rest)) if !rest.is_empty() => normalize_street_name(&format!("{}-{}", rest.join("-"), parish)),
        Some((parish, _)) => (*parish).to_string(),
        None => String::new(),
    }
}

fn street_assign_code(mut table: Table, params: &Params, ctx: &RunContext<'_>) -> anyhow::Result<FrameOutput> {
    let p: AssignCodeParams = parse_params(params)?;
    let path = ctx.resolve_path(&p.reference);
    let reference = read_table(&path).with_context(|| format!("loading street reference {}", path.display()))?;

    let names = reference
        .column(&p.name_column)
        .ok_or_else(|| anyhow!("reference has no column '{}'", p.name_column))?;
    let codes = reference
        .column(&p.code_column)
        .ok_or_else(|| anyhow!("reference has no column '{}'", p.code_column))?;

    let mut mapping: HashMap<String, String> = HashMap::new();
    for (name, code) in names.iter().zip(codes) {
        let key = normalize_street_name(name);
        if key.is_empty() || code.trim().is_empty() {
            continue;
        }
        mapping.entry(key).or_insert_with(|| code.trim().to_string());
    }

    let source = table
        .column(&p.source)
        .ok_or_else(|| anyhow!("source column '{}' not found", p.source))?;

    let mut normalized = Vec::with_capacity(source.len());
    let mut assigned = Vec::with_capacity(source.len());
    let mut unassigned: Vec<Vec<String>> = Vec::new();
    let mut reported: BTreeSet<(String, String)> = BTreeSet::new();
    for raw in source {
        let key = street_lookup_key(raw);
        match mapping.get(&key) {
            Some(code) => assigned.push(code.clone()),
            None => {
                assigned.push(String::new());
                if !raw.trim().is_empty() && reported.insert((raw.clone(), key.clone())) {
                    unassigned.push(vec![raw.clone(), key.clone()]);
                }
            }
        }
        normalized.push(key);
    }

    if !unassigned.is_empty() {
        warn!("⚠️  {} street names without a code", unassigned.len());
    }
    let side = Table::from_rows([p.source.clone(), p.normalized.clone()], unassigned)?;

    table.set_column(&p.normalized, normalized)?;
    table.set_column(&p.target, assigned)?;
    Ok(FrameOutput::new(table).with_side("unassigned", side))
}

// ============================================================================
// FUZZY RESOLUTION
// ============================================================================

impl BuilderParams for ResolveParams {
    fn check(&self) -> anyhow::Result<()> {
        Ok(self.validate()?)
    }
}

/// Review-band pairs go to the run's audit log, written once after all builders
fn resolve_columns(table: Table, params: &Params, ctx: &RunContext<'_>) -> anyhow::Result<FrameOutput> {
    let mut p: ResolveParams = parse_params(params)?;
    p.catalog_dir = ctx.resolve_path(&p.catalog_dir);
    p.audit_dir = ctx.resolve_path(&p.audit_dir);
    let audit_dir = p.audit_dir.clone();

    let resolution = ResolutionEngine::new(p).resolve(&table, ctx.run)?;
    ctx.audit.record(&audit_dir, resolution.conflicts.clone());
    Ok(FrameOutput::new(resolution.table).with_side("conflicts", resolution.conflicts))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{get_parser, ParserKind};
    use crate::resolution::AuditLog;
    use crate::run::RunInfo;
    use std::path::Path;

    fn s(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn create_test_params(yaml: &str) -> Params {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn with_ctx<T>(base: &Path, f: impl FnOnce(&RunContext<'_>) -> T) -> T {
        let parser = get_parser(ParserKind::Regex);
        let run = RunInfo::new("t");
        let audit = AuditLog::new();
        let ctx = RunContext {
            parser: parser.as_ref(),
            run: &run,
            base_dir: base,
            audit: &audit,
        };
        f(&ctx)
    }

    fn create_test_table() -> Table {
        Table::from_columns(vec![
            ("id", s(&["1", "1", "2"])),
            ("via", s(&["Calle Mayor", "C/ Mayor", "Sol"])),
            ("num", s(&["12", "12", "3"])),
            ("esc", s(&["", "2", ""])),
        ])
        .unwrap()
    }

    #[test]
    fn test_full_reference_row() {
        let table = Table::from_columns(vec![
            ("parcela", s(&["1234567AB1234C"])),
            ("cargo", s(&["7"])),
            ("dc1", s(&["X"])),
            ("dc2", s(&["Y"])),
        ])
        .unwrap();
        let params = create_test_params("{ parcel: parcela, count: cargo, control1: dc1, control2: dc2 }");

        let value = with_ctx(Path::new("."), |ctx| reference_full(&params, ctx).and_then(|f| f(&table.row(0)))).unwrap();
        assert_eq!(value, "1234567AB1234C0007XY");
    }

    #[test]
    fn test_address_normalize_row() {
        let table = create_test_table();
        let params = create_test_params("{ street: via, number: num, staircase: esc }");

        let values = with_ctx(Path::new("."), |ctx| {
            let f = address_normalize(&params, ctx).unwrap();
            table.rows().map(|row| f(&row).unwrap()).collect::<Vec<_>>()
        });
        assert_eq!(values, s(&["CALLE MAYOR 12", "C/ MAYOR 12 ESC 2", "SOL 3"]));
    }

    #[test]
    fn test_params_checked_by_registry() {
        let registry = BuilderRegistry::with_defaults();
        let spec = |using: &str, params: &str| crate::config::BuilderSpec {
            using: using.to_string(),
            apply: crate::config::ApplyMode::Frame,
            params: create_test_params(params),
            source: None,
        };

        let bad = [
            ("resolve.normalize_columns", "{ columns: [via], prob_review: 0.99, prob_auto: 0.5 }"),
            ("address.conflicts", "{ key: id, columns: [only_one] }"),
            ("street.assign_code", "{ reference: vias.csv }"),
        ];
        for (using, params) in bad {
            let err = registry.resolve(&[("b".to_string(), spec(using, params))]).err().unwrap();
            assert!(matches!(err, crate::error::PipelineError::Config(ref m) if m.starts_with("builders.b.params")), "{using}");
        }
        assert!(registry.resolve(&[("b".to_string(), spec("resolve.normalize_columns", "{ columns: via }"))]).is_ok());
    }

    #[test]
    fn test_address_parse_adds_prefixed_columns() {
        let params = create_test_params("{ prefix: bien, street: via, number: num, staircase: esc }");
        let out = with_ctx(Path::new("."), |ctx| address_parse(create_test_table(), &params, ctx)).unwrap();

        let t = out.table;
        assert_eq!(t.get(1, "bien_number"), "12");
        assert_eq!(t.get(1, "bien_staircase"), "2");
        assert_eq!(t.get(0, "normalized_address_bien"), "CALLE MAYOR 12");
        assert_eq!(t.get(1, "normalized_address_bien"), "C/ MAYOR 12 ESC 2");
    }

    #[test]
    fn test_address_conflicts_flags_disagreeing_keys() {
        let table = Table::from_columns(vec![
            ("id", s(&["1", "1", "2"])),
            ("dir_a", s(&["MAYOR 1", "MAYOR 1", "SOL 3"])),
            ("dir_b", s(&["MAYOR 2", "", "SOL 3"])),
        ])
        .unwrap();
        let params = create_test_params("{ key: id, columns: [dir_a, dir_b] }");

        let out = with_ctx(Path::new("."), |ctx| address_conflicts(table, &params, ctx)).unwrap();
        assert_eq!(out.table.column("address_conflict").unwrap(), &["1", "1", ""]);

        let (name, side) = &out.side_tables[0];
        assert_eq!(name, "conflicts");
        assert_eq!(side.nrows(), 1);
        assert_eq!(side.get(0, "dir_b"), "MAYOR 2");
    }

    #[test]
    fn test_address_conflicts_need_two_sources() {
        let table = Table::from_columns(vec![
            ("id", s(&["1", "1"])),
            ("dir_bien", s(&["MAYOR 1", "MAYOR 2"])),
            ("dir_tit", s(&["", ""])),
        ])
        .unwrap();
        let params = create_test_params("{ key: id, columns: [dir_bien, dir_tit] }");

        let out = with_ctx(Path::new("."), |ctx| address_conflicts(table, &params, ctx)).unwrap();
        assert_eq!(out.table.column("address_conflict").unwrap(), &["", ""]);
        assert!(out.side_tables[0].1.is_empty());
    }

    #[test]
    fn test_street_name_normalization() {
        assert_eq!(normalize_street_name("Rúa  (antigua) Nova, Vella"), "RÚA NOVA VELLA");
        assert_eq!(street_lookup_key("Parish - Area"), "AREA-PARISH");
        assert_eq!(street_lookup_key("Mayor"), "MAYOR");
        assert_eq!(street_lookup_key(" - "), "");
    }

    #[test]
    fn test_street_assign_code() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("vias.csv"),
            "nombre,codvia\nMAYOR,0010\nAREA-PARISH,0020\n",
        )
        .unwrap();
        let table = Table::from_columns(vec![("via", s(&["Mayor", "Parish - Area", "Nowhere", "Nowhere"]))]).unwrap();
        let params = create_test_params("{ reference: vias.csv, name_column: nombre, code_column: codvia, source: via }");

        let out = with_ctx(tmp.path(), |ctx| street_assign_code(table, &params, ctx)).unwrap();
        assert_eq!(out.table.column("codvia_asignado").unwrap(), &["0010", "0020", "", ""]);
        assert_eq!(out.side_tables[0].1.nrows(), 1);
    }

    #[test]
    fn test_resolve_columns_uses_base_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let params = create_test_params("{ columns: via, key_columns: [id] }");
        let out = with_ctx(tmp.path(), |ctx| resolve_columns(create_test_table(), &params, ctx)).unwrap();

        assert_eq!(out.table.column("via_norm").unwrap(), &["MAYOR", "MAYOR", "SOL"]);
        assert!(tmp.path().join("master").join("via.sqlite").exists());
    }

    #[test]
    fn test_resolve_columns_records_audit_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let table = Table::from_columns(vec![("via", s(&["MAYOR", "MAYORR"]))]).unwrap();
        let params = create_test_params("{ columns: via }");

        let parser = get_parser(ParserKind::Regex);
        let run = RunInfo::new("t");
        let audit = AuditLog::new();
        let ctx = RunContext {
            parser: parser.as_ref(),
            run: &run,
            base_dir: tmp.path(),
            audit: &audit,
        };
        let out = resolve_columns(table, &params, &ctx).unwrap();

        assert_eq!(out.side_tables[0].1.nrows(), 1);
        assert!(!tmp.path().join("audit").exists());
        let written = audit.write(&run).unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].starts_with(tmp.path().join("audit")));
    }

    #[test]
    fn test_text_canon_vector() {
        let out = with_ctx(Path::new("."), |ctx| {
            text_canon(&s(&["Av. Constitución", ""]), &Params::new(), ctx)
        })
        .unwrap();
        assert_eq!(out, s(&["CONSTITUCION", ""]));
    }
}
