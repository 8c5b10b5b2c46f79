//! Run configuration loaded from a JSON file
//!
//! Every field has a default, so a config file only needs the values it
//! changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::data::{BadRowPolicy, DateRange, LoadOptions, SchemaMapping, SourceKind, ACCT_ID};
use crate::enrich::NullRateCheck;
use crate::ensemble::EnsembleConfig;
use crate::error::PipelineError;
use crate::features::FeatureWindows;
use crate::forecast::ForecastConfig;
use crate::risk::RiskConfig;
use crate::segment::TierThresholds;

/// File names of the extracts, relative to `data_dir`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceFiles {
    pub transactions: Vec<String>,
    pub accounts: String,
    pub snapshots: String,
    pub fraud_cases: String,
    pub fraud_transactions: String,
    pub statements: String,
    pub customers: String,
}

impl Default for SourceFiles {
    fn default() -> Self {
        Self {
            transactions: vec!["transactions_1.csv".to_string(), "transactions_2.csv".to_string()],
            accounts: "accounts.csv".to_string(),
            snapshots: "snapshots.csv".to_string(),
            fraud_cases: "fraud_cases.csv".to_string(),
            fraud_transactions: "fraud_transactions.csv".to_string(),
            statements: "statements.csv".to_string(),
            customers: "customers.csv".to_string(),
        }
    }
}

impl SourceFiles {
    /// File of a single-file source; transactions use [`SourceFiles::transactions`]
    pub fn file(&self, kind: SourceKind) -> Option<&str> {
        match kind {
            SourceKind::Transactions => None,
            SourceKind::Accounts => Some(&self.accounts),
            SourceKind::Snapshots => Some(&self.snapshots),
            SourceKind::FraudCases => Some(&self.fraud_cases),
            SourceKind::FraudTransactions => Some(&self.fraud_transactions),
            SourceKind::Statements => Some(&self.statements),
            SourceKind::Customers => Some(&self.customers),
        }
    }
}

fn default_mappings() -> BTreeMap<SourceKind, SchemaMapping> {
    BTreeMap::from([(SourceKind::Snapshots, SchemaMapping::rename("account_id", ACCT_ID))])
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub sources: SourceFiles,
    pub mappings: BTreeMap<SourceKind, SchemaMapping>,
    pub date_format: String,
    pub bad_rows: BadRowPolicy,
    /// Collect scans with the polars streaming engine
    pub streaming: bool,
    /// Inclusive range applied to transaction dates at load time
    pub transaction_range: DateRange,
    /// First day of the label window
    pub boundary: NaiveDate,
    pub feature_windows_months: Vec<u32>,
    pub label_months: u32,
    pub tiers: TierThresholds,
    pub risk: RiskConfig,
    pub forecast: ForecastConfig,
    pub regressor: EnsembleConfig,
    pub test_fraction: f64,
    /// Seed for the train/test splits and the advisory K-Means
    pub seed: u64,
    pub join_check: NullRateCheck,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            sources: SourceFiles::default(),
            mappings: default_mappings(),
            date_format: "%Y-%m-%d".to_string(),
            bad_rows: BadRowPolicy::Abort,
            streaming: false,
            transaction_range: DateRange::new(date(2023, 1, 1), date(2024, 10, 31)),
            boundary: date(2024, 10, 1),
            feature_windows_months: vec![5, 3, 1],
            label_months: 1,
            tiers: TierThresholds::default(),
            risk: RiskConfig::default(),
            forecast: ForecastConfig::default(),
            regressor: EnsembleConfig::default(),
            test_fraction: 0.2,
            seed: 42,
            join_check: NullRateCheck::default(),
        }
    }
}

impl PipelineConfig {
    /// Read and validate a JSON config file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(PipelineError::from)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sources.transactions.is_empty() {
            return Err(PipelineError::Config("at least one transaction file is required".into()));
        }
        if self.transaction_range.start > self.transaction_range.end {
            return Err(PipelineError::Config(format!(
                "transaction_range starts {} after it ends {}",
                self.transaction_range.start, self.transaction_range.end
            )));
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(PipelineError::Config(format!(
                "test_fraction must lie strictly between 0 and 1, got {}",
                self.test_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.join_check.max_null_rate) {
            return Err(PipelineError::Config("join_check.max_null_rate must lie in [0, 1]".into()));
        }

        let windows = self.windows();
        windows.validate()?;
        windows.shifted()?.validate()?;

        // the scoring table's feature windows end where the label window ends
        let needed = DateRange::new(windows.widest()?.start, windows.label_range()?.end);
        if !(self.transaction_range.contains(needed.start) && self.transaction_range.contains(needed.end)) {
            return Err(PipelineError::Config(format!(
                "transaction_range {}..{} does not cover the feature and label windows {}..{}",
                self.transaction_range.start, self.transaction_range.end, needed.start, needed.end
            )));
        }

        self.tiers.validate()?;
        self.forecast.validate()?;
        self.regressor.validate()?;
        self.risk.validate()?;
        Ok(())
    }

    pub fn windows(&self) -> FeatureWindows {
        FeatureWindows::new(self.boundary, self.feature_windows_months.clone(), self.label_months)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            date_format: self.date_format.clone(),
            bad_rows: self.bad_rows,
            streaming: self.streaming,
        }
    }

    pub fn mapping(&self, kind: SourceKind) -> SchemaMapping {
        self.mappings.get(&kind).cloned().unwrap_or_default()
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }
}
