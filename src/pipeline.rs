// 🚀 Pipeline - load → join → unify → builders → reconcile → sort → export
//
// One call of `Pipeline::run` is one complete batch run over a snapshot of
// the input files. Any fatal error aborts the run; files written before the
// failure stay on disk and the run must be repeated from scratch.

use crate::address::get_parser;
use crate::builders::{run_builders, BuilderRegistry, RunContext};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::export::{counts_table, Exporter};
use crate::join::{join, unify};
use crate::loader::load_all;
use crate::reconciliation::{ReconciliationReport, ReconciliationStager};
use crate::resolution::AuditLog;
use crate::run::RunInfo;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub struct PipelineOutcome {
    /// Main output file
    pub output: PathBuf,
    pub rows: usize,
    /// Every output file written, main output first, then audit files
    pub written: Vec<PathBuf>,
    pub reconciliation: Option<ReconciliationReport>,
}

pub struct Pipeline {
    cfg: PipelineConfig,
    registry: BuilderRegistry,
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig) -> Self {
        Self::with_registry(cfg, BuilderRegistry::with_defaults())
    }

    pub fn with_registry(cfg: PipelineConfig, registry: BuilderRegistry) -> Self {
        Pipeline { cfg, registry }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn run(&self, date: &str) -> Result<PipelineOutcome> {
        let cfg = &self.cfg;

        // Every builder reference and its params must check out before any data is read
        let builders = self.registry.resolve(&cfg.builders)?;

        let run = RunInfo::new(date);
        info!("🚀 run {} ({} / {})", run.run_id, cfg.base_name, cfg.hash);

        let mut tables = load_all(cfg)?;
        let left = tables
            .get(&cfg.join.left)
            .ok_or_else(|| PipelineError::config(format!("dataset '{}' not loaded", cfg.join.left)))?;
        let right = tables
            .get(&cfg.join.right)
            .ok_or_else(|| PipelineError::config(format!("dataset '{}' not loaded", cfg.join.right)))?;

        let joined = join(left, right, &cfg.join)?;
        let unified = unify(joined, &cfg.unify_cols, &cfg.join.suffixes)?;

        let parser = get_parser(cfg.address_parser);
        let audit = AuditLog::new();
        let ctx = RunContext {
            parser: parser.as_ref(),
            run: &run,
            base_dir: &cfg.base_dir,
            audit: &audit,
        };
        let built = run_builders(unified, &builders, &ctx)?;
        let audit_files = audit.write(&run)?;

        let mut table = built.table;
        let sort_keys = cfg.output.sort_by.clone().unwrap_or_else(|| cfg.join.on.clone());
        table.sort_by_columns(&sort_keys);

        let main_path = cfg.resolve_path(&cfg.output.dir).join(cfg.output_name(date));
        let mut exporter = Exporter::new(main_path.clone());
        exporter
            .write_main(&table)
            .with_context(|| format!("writing {}", main_path.display()))?;

        if let Some(column) = &cfg.output.counts_by {
            match counts_table(&table, column)? {
                Some(counts) => {
                    exporter.write_aux("counts", &counts)?;
                }
                None => warn!("⚠️  counts_by column '{}' not in output, counts skipped", column),
            }
        }

        for side in &built.side_tables {
            if side.table.is_empty() {
                continue;
            }
            exporter.write_aux(&format!("{}_{}", side.builder, side.name), &side.table)?;
        }

        let reconciliation = match &cfg.reconcile {
            Some(spec) => {
                let registry = tables
                    .remove(&spec.registry)
                    .ok_or_else(|| PipelineError::config(format!("dataset '{}' not loaded", spec.registry)))?;
                let report = ReconciliationStager::new(spec).reconcile(&table, &registry)?;

                exporter.write_aux("matches", &report.matches_table(&table, &registry)?)?;
                exporter.write_aux("union_remaining", &table.select_rows(&report.union_remaining))?;
                exporter.write_aux(
                    "registry_remaining",
                    &registry.select_rows(&report.registry_remaining),
                )?;
                Some(report)
            }
            None => None,
        };

        let mut written = exporter.written().to_vec();
        written.extend(audit_files);

        info!("✅ {} rows → {}", table.nrows(), main_path.display());
        Ok(PipelineOutcome {
            output: main_path,
            rows: table.nrows(),
            written,
            reconciliation,
        })
    }
}

/// Load one config file and run it
pub fn run_config(path: &Path, date: &str) -> Result<PipelineOutcome> {
    let cfg = PipelineConfig::from_file(path).with_context(|| format!("loading config {}", path.display()))?;
    Pipeline::new(cfg)
        .run(date)
        .with_context(|| format!("pipeline {}", path.display()))
}

/// A single config file, or every `*.yml` / `*.yaml` in a directory in sorted order
pub fn config_paths(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        anyhow::bail!("{} is neither a config file nor a directory", path.display());
    }

    let dir = glob::Pattern::escape(&path.to_string_lossy());
    let mut paths = Vec::new();
    for ext in ["yml", "yaml"] {
        let pattern = format!("{dir}/*.{ext}");
        for entry in glob::glob(&pattern).with_context(|| format!("bad pattern {pattern}"))? {
            paths.push(entry?);
        }
    }
    paths.sort();

    if paths.is_empty() {
        anyhow::bail!("no *.yml / *.yaml configs in {}", path.display());
    }
    Ok(paths)
}

// ============================================================================
// TESTS
// ============================================================================
