//! Point-in-time feature construction
//!
//! Windows hang off a reference boundary date `B`. Feature windows cover the
//! months strictly before `B`; the label window starts on `B`. Every declared
//! feature is filled with zero when an account has no matching rows, so
//! inactive and brand-new accounts look exactly like zero-spend accounts.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, Days, Months, NaiveDate};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{
    date_column, f64_column, str_column, DateRange, ACCT_ID, AMOUNT, CLOSING_BALANCE,
    MINIMUM_DUE, OPEN_DATE, PAYMENT_AMOUNT, SNAPSHOT_FIELDS, STATEMENT_DATE, STATUS, TXN_DATE,
};
use crate::enrich::ACCOUNTS_PER_CUSTOMER;
use crate::error::PipelineError;

pub const TXN_COUNT: &str = "txn_count";
pub const LABEL_SPEND: &str = "label_spend";
pub const STATEMENT_BALANCE_AVG: &str = "statement_balance_avg";
pub const MISSED_PAYMENTS: &str = "missed_payments";
pub const TENURE_DAYS: &str = "tenure_days";
pub const HAD_FRAUD: &str = "had_fraud";

/// Inputs of the credit-risk classifier
pub const RISK_FEATURES: [&str; 8] = [
    "credit_line",
    "bureau_score",
    "utilization",
    "behavior_score",
    "delinquent_cycles",
    "nsf_count",
    MISSED_PAYMENTS,
    TENURE_DAYS,
];

/// Feature and label windows relative to a boundary date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureWindows {
    pub boundary: NaiveDate,
    pub feature_months: Vec<u32>,
    pub label_months: u32,
}

impl FeatureWindows {
    pub fn new(boundary: NaiveDate, feature_months: Vec<u32>, label_months: u32) -> Self {
        Self {
            boundary,
            feature_months,
            label_months,
        }
    }

    /// Reject empty or overlapping window layouts
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.feature_months.is_empty() {
            return Err(PipelineError::Config("at least one feature window is required".into()));
        }
        if self.feature_months.contains(&0) || self.label_months == 0 {
            return Err(PipelineError::Config("window lengths must be at least one month".into()));
        }

        let label = self.label_range()?;
        for &months in &self.feature_months {
            let window = self.feature_range(months)?;
            if window.end >= label.start {
                return Err(PipelineError::Leakage {
                    feature_end: window.end,
                    label_start: label.start,
                });
            }
        }
        Ok(())
    }

    /// `[B - months, B - 1 day]`
    pub fn feature_range(&self, months: u32) -> Result<DateRange, PipelineError> {
        let start = self
            .boundary
            .checked_sub_months(Months::new(months))
            .ok_or_else(|| PipelineError::Config(format!("{} months before {} is out of range", months, self.boundary)))?;
        let end = self
            .boundary
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| PipelineError::Config(format!("boundary {} is out of range", self.boundary)))?;
        Ok(DateRange::new(start, end))
    }

    /// `[B, B + label_months - 1 day]`
    pub fn label_range(&self) -> Result<DateRange, PipelineError> {
        let end = self
            .label_end_exclusive()?
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| PipelineError::Config(format!("boundary {} is out of range", self.boundary)))?;
        Ok(DateRange::new(self.boundary, end))
    }

    pub fn widest(&self) -> Result<DateRange, PipelineError> {
        let months = self.feature_months.iter().copied().max().unwrap_or(1);
        self.feature_range(months)
    }

    /// Same layout moved forward by one label period, for scoring
    pub fn shifted(&self) -> Result<Self, PipelineError> {
        Ok(Self {
            boundary: self.label_end_exclusive()?,
            ..self.clone()
        })
    }

    /// Declared model features, in column order
    pub fn feature_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self.feature_months.iter().map(|&m| spend_column(m)).collect();
        columns.push(TXN_COUNT.to_string());
        columns.extend(SNAPSHOT_FIELDS.iter().map(|f| f.to_string()));
        columns.push(STATEMENT_BALANCE_AVG.to_string());
        columns.push(MISSED_PAYMENTS.to_string());
        columns.push(TENURE_DAYS.to_string());
        columns.push(ACCOUNTS_PER_CUSTOMER.to_string());
        columns
    }

    fn label_end_exclusive(&self) -> Result<NaiveDate, PipelineError> {
        self.boundary
            .checked_add_months(Months::new(self.label_months))
            .ok_or_else(|| PipelineError::Config(format!("label window after {} is out of range", self.boundary)))
    }
}

pub fn spend_column(months: u32) -> String {
    format!("spend_{}m", months)
}

/// One zero-filled feature row per account, sorted by account id
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub boundary: NaiveDate,
    pub account_ids: Vec<String>,
    pub statuses: Vec<String>,
    pub had_fraud: Vec<bool>,
    pub columns: Vec<String>,
    pub values: Array2<f64>,
    pub label: Array1<f64>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.account_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.account_ids.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|j| self.values.column(j))
    }

    /// Matrix of the named columns, in the order given
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> crate::Result<Array2<f64>> {
        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            let idx = self
                .columns
                .iter()
                .position(|c| c == name.as_ref())
                .ok_or_else(|| PipelineError::MissingColumn {
                    table: "feature table".to_string(),
                    column: name.as_ref().to_string(),
                })?;
            indices.push(idx);
        }
        Ok(self.values.select(Axis(1), &indices))
    }

    pub fn row_of(&self, account_id: &str) -> Option<usize> {
        self.account_ids
            .binary_search_by(|id| id.as_str().cmp(account_id))
            .ok()
    }
}

/// Accounts with any fraud case or fraud transaction, flagged `had_fraud`
pub fn fraud_flags(cases: &DataFrame, fraud_txns: &DataFrame) -> crate::Result<DataFrame> {
    let ids = concat(
        [
            cases.clone().lazy().select([col(ACCT_ID)]),
            fraud_txns.clone().lazy().select([col(ACCT_ID)]),
        ],
        UnionArgs::default(),
    )?
    .filter(col(ACCT_ID).is_not_null())
    .unique_stable(None, UniqueKeepStrategy::First)
    .with_column(lit(true).alias(HAD_FRAUD))
    .collect()?;

    log::info!("Fraud flags: {} accounts", ids.height());
    Ok(ids)
}

/// Build the per-account feature table for one boundary date
///
/// # Arguments
/// * `txns` - Unified (optionally enriched) transactions
/// * `accounts` - Accounts enriched with the latest snapshot and customer ids
/// * `statements` - Statement facts
/// * `fraud` - Output of [`fraud_flags`]
/// * `windows` - Boundary and window layout
pub fn build_feature_table(
    txns: &DataFrame,
    accounts: &DataFrame,
    statements: &DataFrame,
    fraud: &DataFrame,
    windows: &FeatureWindows,
) -> crate::Result<FeatureTable> {
    windows.validate()?;

    if accounts.column(ACCT_ID)?.n_unique()? != accounts.height() {
        return Err(PipelineError::DuplicateKey {
            table: "accounts".to_string(),
            key: ACCT_ID.to_string(),
        }
        .into());
    }

    let widest = windows.widest()?;
    let label = windows.label_range()?;

    let mut spend_aggs = Vec::with_capacity(windows.feature_months.len() + 2);
    for &months in &windows.feature_months {
        let range = windows.feature_range(months)?;
        spend_aggs.push(
            col(AMOUNT)
                .filter(range.expr(TXN_DATE))
                .sum()
                .alias(&spend_column(months)),
        );
    }
    spend_aggs.push(
        col(AMOUNT)
            .filter(widest.expr(TXN_DATE))
            .count()
            .cast(DataType::Float64)
            .alias(TXN_COUNT),
    );
    spend_aggs.push(col(AMOUNT).filter(label.expr(TXN_DATE)).sum().alias(LABEL_SPEND));

    let spend = txns
        .clone()
        .lazy()
        .group_by([col(ACCT_ID)])
        .agg(spend_aggs);

    let statement_in = widest.expr(STATEMENT_DATE);
    let statement_aggs = statements
        .clone()
        .lazy()
        .group_by([col(ACCT_ID)])
        .agg([
            col(CLOSING_BALANCE)
                .filter(statement_in.clone())
                .mean()
                .alias(STATEMENT_BALANCE_AVG),
            col(PAYMENT_AMOUNT)
                .lt(col(MINIMUM_DUE))
                .filter(statement_in)
                .sum()
                .cast(DataType::Float64)
                .alias(MISSED_PAYMENTS),
        ]);

    let mut base_columns = vec![col(ACCT_ID), col(STATUS), col(OPEN_DATE), col(ACCOUNTS_PER_CUSTOMER)];
    base_columns.extend(SNAPSHOT_FIELDS.iter().map(|&f| col(f)));

    let mut fills: Vec<Expr> = windows
        .feature_columns()
        .iter()
        .filter(|c| c.as_str() != TENURE_DAYS)
        .map(|c| col(c.as_str()).fill_null(lit(0.0)))
        .collect();
    fills.push(col(LABEL_SPEND).fill_null(lit(0.0)));
    fills.push(col(HAD_FRAUD).fill_null(lit(false)));

    let df = accounts
        .clone()
        .lazy()
        .select(base_columns)
        .left_join(spend, col(ACCT_ID), col(ACCT_ID))
        .left_join(statement_aggs, col(ACCT_ID), col(ACCT_ID))
        .left_join(fraud.clone().lazy(), col(ACCT_ID), col(ACCT_ID))
        .with_columns(fills)
        .sort_by_exprs(
            vec![col(ACCT_ID)],
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .collect()?;

    let account_ids = str_column(&df, ACCT_ID)?;
    let statuses = str_column(&df, STATUS)?;
    let had_fraud: Vec<bool> = df
        .column(HAD_FRAUD)?
        .bool()?
        .into_iter()
        .map(|v| v.unwrap_or(false))
        .collect();
    let tenure: Vec<f64> = date_column(&df, OPEN_DATE)?
        .into_iter()
        .map(|open| tenure_days(open, windows.boundary))
        .collect();

    let columns = windows.feature_columns();
    let mut values = Array2::<f64>::zeros((df.height(), columns.len()));
    for (j, name) in columns.iter().enumerate() {
        let column = if name == TENURE_DAYS {
            tenure.clone()
        } else {
            f64_column(&df, name)?
        };
        values.column_mut(j).assign(&Array1::from(column));
    }
    let label = Array1::from(f64_column(&df, LABEL_SPEND)?);

    log::info!(
        "Feature table at {}: {} accounts x {} features",
        windows.boundary,
        values.nrows(),
        values.ncols()
    );

    Ok(FeatureTable {
        boundary: windows.boundary,
        account_ids,
        statuses,
        had_fraud,
        columns,
        values,
        label,
    })
}

fn tenure_days(open: Option<NaiveDate>, boundary: NaiveDate) -> f64 {
    open.map(|date| (boundary - date).num_days().max(0) as f64)
        .unwrap_or(0.0)
}

/// Calendar month key of the portfolio series
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self::new(date.year(), date.month())
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self::new(self.year + 1, 1)
        } else {
            Self::new(self.year, self.month + 1)
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Total portfolio spend per calendar month, gaps filled with zero
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySeries {
    pub months: Vec<YearMonth>,
    pub values: Vec<f64>,
}

impl MonthlySeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The `n` months following the last observed month
    pub fn future_months(&self, n: usize) -> Vec<YearMonth> {
        let mut out = Vec::with_capacity(n);
        let mut current = self.months.last().copied();
        for _ in 0..n {
            let next = current.map(YearMonth::next).unwrap_or_else(|| YearMonth::new(1970, 1));
            out.push(next);
            current = Some(next);
        }
        out
    }
}

/// Aggregate transactions into an ordered monthly total-spend series
pub fn monthly_spend_series(txns: &DataFrame) -> crate::Result<MonthlySeries> {
    let totals = txns
        .clone()
        .lazy()
        .filter(col(TXN_DATE).is_not_null())
        .group_by([
            col(TXN_DATE).dt().year().cast(DataType::Int32).alias("year"),
            col(TXN_DATE).dt().month().cast(DataType::Int32).alias("month"),
        ])
        .agg([col(AMOUNT).sum().alias("total")])
        .collect()?;

    let years = totals.column("year")?.i32()?;
    let months = totals.column("month")?.i32()?;
    let spend = f64_column(&totals, "total")?;

    let mut by_month = BTreeMap::new();
    for ((year, month), total) in years.into_iter().zip(months.into_iter()).zip(spend) {
        if let (Some(year), Some(month)) = (year, month) {
            by_month.insert(YearMonth::new(year, month as u32), total);
        }
    }

    let (Some(&first), Some(&last)) = (by_month.keys().next(), by_month.keys().next_back()) else {
        return Ok(MonthlySeries {
            months: Vec::new(),
            values: Vec::new(),
        });
    };

    let mut series = MonthlySeries {
        months: Vec::new(),
        values: Vec::new(),
    };
    let mut current = first;
    while current <= last {
        series.months.push(current);
        series.values.push(by_month.get(&current).copied().unwrap_or(0.0));
        current = current.next();
    }

    log::info!("Monthly series: {} months ({} to {})", series.len(), first, last);
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn txns() -> DataFrame {
        df!(
            ACCT_ID => &["A1", "A1", "A1", "A2", "A1"],
            TXN_DATE => &["2024-04-15", "2024-07-01", "2024-09-30", "2024-10-01", "2024-10-15"],
            AMOUNT => &[100.0, 50.0, 25.0, 999.0, 70.0]
        )
        .unwrap()
        .lazy()
        .with_column(col(TXN_DATE).str().to_date(StrptimeOptions::default()))
        .collect()
        .unwrap()
    }

    fn accounts() -> DataFrame {
        let mut frame = df!(
            ACCT_ID => &["A2", "A1", "A3"],
            STATUS => &["open", "open", "collections"],
            OPEN_DATE => &["2024-08-01", "2020-01-01", "2025-01-01"],
            ACCOUNTS_PER_CUSTOMER => &[1.0, 1.0, 1.0]
        )
        .unwrap()
        .lazy()
        .with_column(col(OPEN_DATE).str().to_date(StrptimeOptions::default()))
        .collect()
        .unwrap();
        for field in SNAPSHOT_FIELDS {
            frame
                .with_column(Series::new(field, &[Some(1.0), None, Some(3.0)]))
                .unwrap();
        }
        frame
    }

    fn statements() -> DataFrame {
        df!(
            ACCT_ID => &["A1", "A1"],
            STATEMENT_DATE => &["2024-08-31", "2024-09-30"],
            CLOSING_BALANCE => &[200.0, 400.0],
            MINIMUM_DUE => &[20.0, 40.0],
            PAYMENT_AMOUNT => &[20.0, 10.0]
        )
        .unwrap()
        .lazy()
        .with_column(col(STATEMENT_DATE).str().to_date(StrptimeOptions::default()))
        .collect()
        .unwrap()
    }

    fn fraud() -> DataFrame {
        let cases = df!(ACCT_ID => &["A3"]).unwrap();
        let fraud_txns = df!(ACCT_ID => &["A3", "A3"]).unwrap();
        fraud_flags(&cases, &fraud_txns).unwrap()
    }

    fn windows() -> FeatureWindows {
        FeatureWindows::new(d(2024, 10, 1), vec![5, 3, 1], 1)
    }

    #[test]
    fn test_window_ranges() {
        let w = windows();
        assert_eq!(w.feature_range(5).unwrap(), DateRange::new(d(2024, 5, 1), d(2024, 9, 30)));
        assert_eq!(w.label_range().unwrap(), DateRange::new(d(2024, 10, 1), d(2024, 10, 31)));
        assert_eq!(w.shifted().unwrap().boundary, d(2024, 11, 1));
        assert!(w.validate().is_ok());
    }

    #[test]
    fn test_invalid_windows_rejected() {
        let w = FeatureWindows::new(d(2024, 10, 1), vec![], 1);
        assert!(w.validate().is_err());
        let w = FeatureWindows::new(d(2024, 10, 1), vec![3, 0], 1);
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_feature_table_windows_and_label() {
        let table = build_feature_table(&txns(), &accounts(), &statements(), &fraud(), &windows()).unwrap();

        assert_eq!(table.account_ids, vec!["A1", "A2", "A3"]);
        let a1 = table.row_of("A1").unwrap();
        // 2024-04-15 is outside the widest (5m) window
        assert_eq!(table.column("spend_5m").unwrap()[a1], 75.0);
        assert_eq!(table.column("spend_3m").unwrap()[a1], 75.0);
        assert_eq!(table.column("spend_1m").unwrap()[a1], 25.0);
        assert_eq!(table.column(TXN_COUNT).unwrap()[a1], 2.0);
        // only the October transaction counts toward the label
        assert_eq!(table.label[a1], 70.0);
        assert_eq!(table.column(STATEMENT_BALANCE_AVG).unwrap()[a1], 300.0);
        assert_eq!(table.column(MISSED_PAYMENTS).unwrap()[a1], 1.0);
    }

    #[test]
    fn test_inactive_account_gets_zero_spend() {
        let table = build_feature_table(&txns(), &accounts(), &statements(), &fraud(), &windows()).unwrap();

        let a3 = table.row_of("A3").unwrap();
        for name in ["spend_5m", "spend_3m", "spend_1m", TXN_COUNT, STATEMENT_BALANCE_AVG] {
            assert_eq!(table.column(name).unwrap()[a3], 0.0, "{}", name);
        }
        assert_eq!(table.label[a3], 0.0);
        // opened after the boundary
        assert_eq!(table.column(TENURE_DAYS).unwrap()[a3], 0.0);
        assert!(table.had_fraud[a3]);
        assert!(!table.had_fraud[table.row_of("A1").unwrap()]);
        assert!(table.values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_missing_snapshot_defaults_to_zero() {
        let table = build_feature_table(&txns(), &accounts(), &statements(), &fraud(), &windows()).unwrap();

        let a1 = table.row_of("A1").unwrap();
        assert_eq!(table.column("credit_line").unwrap()[a1], 0.0);
        assert_eq!(table.column(TENURE_DAYS).unwrap()[a1], 1735.0);
    }

    #[test]
    fn test_duplicate_account_rejected() {
        let accounts = accounts().vstack(&accounts()).unwrap();
        let err = build_feature_table(&txns(), &accounts, &statements(), &fraud(), &windows()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn test_monthly_series_fills_gaps() {
        let series = monthly_spend_series(&txns()).unwrap();

        assert_eq!(series.months.first(), Some(&YearMonth::new(2024, 4)));
        assert_eq!(series.months.last(), Some(&YearMonth::new(2024, 10)));
        assert_eq!(series.len(), 7);
        assert_eq!(series.values, vec![100.0, 0.0, 0.0, 50.0, 0.0, 25.0, 1069.0]);
        assert_eq!(series.future_months(2), vec![YearMonth::new(2024, 11), YearMonth::new(2024, 12)]);
    }
}
