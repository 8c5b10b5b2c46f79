//! SpendForge: spend forecasting, tiering and credit-risk scoring for a
//! credit-card portfolio
//!
//! One batch pass over static CSV extracts: load and unify, enrich accounts,
//! build point-in-time features, forecast portfolio and per-account spend,
//! then assign spend tiers and risk scores.

pub mod cli;
pub mod config;
pub mod data;
pub mod enrich;
pub mod ensemble;
pub mod error;
pub mod features;
pub mod forecast;
pub mod metrics;
pub mod pipeline;
pub mod risk;
pub mod segment;
pub mod viz;

// Re-export public items for easier access
pub use cli::Args;
pub use config::PipelineConfig;
pub use data::{load_table, unify_transactions, BadRowPolicy, DateRange, SchemaMapping, SourceKind};
pub use enrich::{enrich_accounts, enrich_transactions, latest_snapshots, NullRateCheck};
pub use ensemble::{train_spend_model, BaggedTrees, EnsembleConfig};
pub use error::PipelineError;
pub use features::{build_feature_table, fraud_flags, monthly_spend_series, FeatureTable, FeatureWindows};
pub use forecast::{forecast_portfolio, ArimaModel, ArimaOrder, ForecastConfig, ForecastError};
pub use pipeline::{run, PipelineReport, PredictionRow};
pub use risk::{train_risk_model, RiskClassifier, RiskConfig, RiskRule};
pub use segment::{segment_accounts, suggest_thresholds, Tier, TierCounts, TierThresholds};
pub use viz::generate_charts;

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;
