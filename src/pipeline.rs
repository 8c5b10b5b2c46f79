//! End-to-end run: load, enrich, build features, forecast, segment, score
//!
//! Each stage takes immutable tables and returns new ones. Any failure
//! aborts the run, except for the seasonal forecast fallback and single-class
//! risk labels, which are reported as degenerate.

use std::collections::BTreeMap;

use anyhow::Context;
use polars::prelude::*;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::data::{load_table, unify_transactions, SourceKind, STATUS};
use crate::enrich::{enrich_accounts, enrich_transactions, latest_snapshots};
use crate::ensemble::{train_spend_model, SpendModel};
use crate::features::{build_feature_table, fraud_flags, monthly_spend_series, FeatureTable};
use crate::forecast::{forecast_portfolio, PortfolioForecast};
use crate::risk::{train_risk_model, RiskModel};
use crate::segment::{segment_accounts, suggest_thresholds, Tier, TierCounts, TierThresholds};

/// Every source table after loading and transaction unification
#[derive(Debug, Clone)]
pub struct SourceTables {
    pub transactions: DataFrame,
    pub accounts: DataFrame,
    pub snapshots: DataFrame,
    pub fraud_cases: DataFrame,
    pub fraud_transactions: DataFrame,
    pub statements: DataFrame,
    pub customers: DataFrame,
}

/// Row counts per loaded file
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadSummary {
    pub transaction_files: Vec<(String, usize)>,
    pub transactions: usize,
    pub accounts: usize,
    pub snapshots: usize,
    pub fraud_cases: usize,
    pub fraud_transactions: usize,
    pub statements: usize,
    pub customers: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JoinSummary {
    pub orphan_transactions: usize,
    pub latest_snapshots: usize,
    pub enriched_accounts: usize,
    pub fraud_accounts: usize,
}

/// Transient per-account result of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRow {
    pub acct_id: String,
    pub predicted_spend: f64,
    pub tier: Tier,
    pub risk_probability: f64,
    pub risk_flagged: bool,
    pub risk_label: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub load: LoadSummary,
    pub joins: JoinSummary,
    /// Rows and feature columns of the training table
    pub feature_shape: (usize, usize),
    pub forecast: PortfolioForecast,
    pub spend: SpendModel,
    pub thresholds: TierThresholds,
    pub tier_counts: TierCounts,
    /// Advisory K-Means thresholds; never applied
    pub suggested_thresholds: Option<TierThresholds>,
    pub risk: RiskModel,
    pub predictions: Vec<PredictionRow>,
}

impl PipelineReport {
    pub fn prediction(&self, acct_id: &str) -> Option<&PredictionRow> {
        self.predictions
            .binary_search_by(|row| row.acct_id.as_str().cmp(acct_id))
            .ok()
            .map(|i| &self.predictions[i])
    }
}

/// Load every extract named by the configuration
pub fn load_sources(config: &PipelineConfig) -> crate::Result<(SourceTables, LoadSummary)> {
    let options = config.load_options();
    let mut summary = LoadSummary::default();

    let txn_mapping = config.mapping(SourceKind::Transactions);
    let mut txn_tables = Vec::with_capacity(config.sources.transactions.len());
    for file in &config.sources.transactions {
        let df = load_table(
            &config.path(file),
            SourceKind::Transactions,
            &txn_mapping,
            Some(config.transaction_range),
            &options,
        )
        .with_context(|| format!("Failed to load transactions from {}", file))?;
        summary.transaction_files.push((file.clone(), df.height()));
        txn_tables.push(df);
    }
    let transactions = unify_transactions(txn_tables)?;
    summary.transactions = transactions.height();

    let load = |kind: SourceKind| -> crate::Result<DataFrame> {
        let file = config.sources.file(kind).unwrap_or_default();
        load_table(&config.path(file), kind, &config.mapping(kind), None, &options)
            .with_context(|| format!("Failed to load {} from {}", kind, file))
    };

    let tables = SourceTables {
        transactions,
        accounts: load(SourceKind::Accounts)?,
        snapshots: load(SourceKind::Snapshots)?,
        fraud_cases: load(SourceKind::FraudCases)?,
        fraud_transactions: load(SourceKind::FraudTransactions)?,
        statements: load(SourceKind::Statements)?,
        customers: load(SourceKind::Customers)?,
    };

    summary.accounts = tables.accounts.height();
    summary.snapshots = tables.snapshots.height();
    summary.fraud_cases = tables.fraud_cases.height();
    summary.fraud_transactions = tables.fraud_transactions.height();
    summary.statements = tables.statements.height();
    summary.customers = tables.customers.height();

    log::info!(
        "Loaded {} transactions from {} files, {} accounts, {} snapshots",
        summary.transactions,
        summary.transaction_files.len(),
        summary.accounts,
        summary.snapshots
    );
    Ok((tables, summary))
}

/// Run every stage after loading
pub fn analyze(tables: &SourceTables, load: LoadSummary, config: &PipelineConfig) -> crate::Result<PipelineReport> {
    config.validate()?;

    let latest = latest_snapshots(&tables.snapshots)?;
    let accounts = enrich_accounts(&tables.accounts, &latest, &tables.customers, &config.join_check)?;
    let txns = enrich_transactions(&tables.transactions, &tables.accounts, &config.join_check)?;
    let fraud = fraud_flags(&tables.fraud_cases, &tables.fraud_transactions)?;

    let joins = JoinSummary {
        orphan_transactions: txns.column(STATUS)?.null_count(),
        latest_snapshots: latest.height(),
        enriched_accounts: accounts.height(),
        fraud_accounts: fraud.height(),
    };
    if joins.orphan_transactions > 0 {
        log::warn!("{} transactions have no matching account", joins.orphan_transactions);
    }

    let windows = config.windows();
    let train = build_feature_table(&txns, &accounts, &tables.statements, &fraud, &windows)?;
    let score = build_feature_table(&txns, &accounts, &tables.statements, &fraud, &windows.shifted()?)?;

    let series = monthly_spend_series(&tables.transactions)?;
    let forecast = forecast_portfolio(&series, &config.forecast)?;

    let spend = train_spend_model(&train, &score, &config.regressor, config.test_fraction, config.seed)?;

    let tiers = segment_accounts(&score.account_ids, &spend.predictions, &config.tiers);
    let predicted: Vec<f64> = spend.predictions.values().copied().collect();
    let suggested_thresholds = suggest_thresholds(&predicted, config.seed)?;

    let risk = train_risk_model(&train, &score, &config.risk, config.test_fraction, config.seed)?;

    let predictions = prediction_rows(&score, &spend, &tiers, &risk);

    Ok(PipelineReport {
        load,
        joins,
        feature_shape: (train.len(), train.columns.len()),
        forecast,
        thresholds: config.tiers,
        tier_counts: TierCounts::from_tiers(tiers.values()),
        suggested_thresholds,
        spend,
        risk,
        predictions,
    })
}

/// Load the extracts and run the full analysis
pub fn run(config: &PipelineConfig) -> crate::Result<PipelineReport> {
    config.validate()?;
    let (tables, load) = load_sources(config)?;
    analyze(&tables, load, config)
}

fn prediction_rows(
    score: &FeatureTable,
    spend: &SpendModel,
    tiers: &BTreeMap<String, Tier>,
    risk: &RiskModel,
) -> Vec<PredictionRow> {
    score
        .account_ids
        .iter()
        .map(|id| {
            let risk_score = risk.scores.get(id);
            PredictionRow {
                acct_id: id.clone(),
                predicted_spend: spend.predictions.get(id).copied().unwrap_or(0.0),
                tier: tiers.get(id).copied().unwrap_or(Tier::Low),
                risk_probability: risk_score.map(|s| s.probability).unwrap_or(0.0),
                risk_flagged: risk_score.is_some_and(|s| s.flagged),
                risk_label: risk_score.is_some_and(|s| s.label),
            }
        })
        .collect()
}
