// Parcel Reconcile - Core Library
// Declarative cadastral pipeline: load, join, build, resolve, reconcile, export.
// The binary in main.rs only wires the CLI to `pipeline`.

pub mod error;
pub mod table;
pub mod config;
pub mod run;
pub mod canon;          // Canon keys for noisy street / place names
pub mod address;        // Address parser contract + two parsers
pub mod loader;         // Dataset Loader
pub mod join;           // Join / Unify Stage
pub mod resolution;     // Fuzzy Resolution Engine + catalog
pub mod builders;       // Builder registry + executor
pub mod reconciliation; // 3-stage Reconciliation Stager
pub mod export;         // Exporter
pub mod pipeline;       // Orchestrator

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use table::{Row, ShapeError, Table};
pub use config::{PipelineConfig, ReconcileSpec, Stage};
pub use run::RunInfo;
pub use canon::canon;
pub use address::{get_parser, AddressParser, ParsedAddress, ParserKind};
pub use join::{join, unify};
pub use resolution::{
    resolve, AuditLog, Catalog, CatalogEntry, FellegiSunter, MatchScorer, Resolution, ResolutionEngine, ResolveParams,
};
pub use builders::{BuilderFn, BuilderParams, BuilderRegistry, FrameOutput, RowMapper, RunContext};
pub use reconciliation::{full_reference, ReconciliationMatch, ReconciliationReport, ReconciliationStager};
pub use pipeline::{config_paths, run_config, Pipeline, PipelineOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
