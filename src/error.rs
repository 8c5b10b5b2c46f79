//! Typed errors raised by the pipeline stages

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{table}: cannot parse column '{column}' value '{value}' at line {line}")]
    Parse {
        table: String,
        line: u64,
        column: String,
        value: String,
    },

    #[error("{table}: required column '{column}' not found")]
    MissingColumn { table: String, column: String },

    #[error("{table}: key '{key}' is not unique")]
    DuplicateKey { table: String, key: String },

    #[error("Schema mismatch while unifying tables: {0}")]
    SchemaMismatch(String),

    #[error(
        "Join '{join}' left {null_rate:.3} of '{column}' null (limit {limit:.3}); check the join key mapping"
    )]
    JoinKeyMismatch {
        join: String,
        column: String,
        null_rate: f64,
        limit: f64,
    },

    #[error("Feature window ends on {feature_end} but label window starts on {label_start}")]
    Leakage {
        feature_end: chrono::NaiveDate,
        label_start: chrono::NaiveDate,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
