// 🚨 Pipeline errors - every fatal condition of a run
// Each variant names the dataset / builder / join key responsible.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or incomplete pipeline config (aborts before any file is written)
    #[error("config error: {0}")]
    Config(String),

    /// No file matched a dataset's directory + pattern
    #[error("dataset '{dataset}': no file in {dir} matches '{pattern}'")]
    DatasetNotFound {
        dataset: String,
        dir: String,
        pattern: String,
    },

    /// A mapped column is absent from a loaded dataset (strict mode only)
    #[error("dataset '{dataset}': missing column '{column}'")]
    Schema { dataset: String, column: String },

    /// Declared join cardinality was violated
    #[error("join validation '{contract}' failed: duplicate keys on {side} side: {}", .keys.join(", "))]
    JoinValidation {
        contract: String,
        side: String,
        keys: Vec<String>,
    },

    /// A builder reference does not exist in the registry
    #[error("builder '{builder}': cannot resolve '{reference}'")]
    BuilderResolution { builder: String, reference: String },

    /// A builder returned output of the wrong shape
    #[error("builder '{builder}' broke its contract: {reason}")]
    BuilderContract { builder: String, reason: String },

    /// A builder function failed while running
    #[error("builder '{builder}' failed{}: {reason}", .row.map(|r| format!(" on row {r}")).unwrap_or_default())]
    BuilderFailed {
        builder: String,
        row: Option<usize>,
        reason: String,
    },

    #[error(transparent)]
    Shape(#[from] crate::table::ShapeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Config(msg.into())
    }

    pub fn failed(builder: &str, row: Option<usize>, reason: impl Into<String>) -> Self {
        PipelineError::BuilderFailed {
            builder: builder.to_string(),
            row,
            reason: reason.into(),
        }
    }
}
