//! Source ingestion and transaction unification using Polars
//!
//! Every extract is scanned lazily with all columns read as text, then the
//! declared date and numeric columns are typed explicitly. Fields that are
//! present but unparseable are reported with the file line they came from.

use std::fmt;
use std::path::Path;

use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const ACCT_ID: &str = "acct_id";
pub const CLIENT_ID: &str = "client_id";
pub const CUSTOMER_ID: &str = "customer_id";
pub const TXN_DATE: &str = "txn_date";
pub const AMOUNT: &str = "amount";
pub const STATUS: &str = "status";
pub const OPEN_DATE: &str = "open_date";
pub const PROCESS_DATE: &str = "process_date";
pub const STATEMENT_DATE: &str = "statement_date";
pub const CLOSING_BALANCE: &str = "closing_balance";
pub const MINIMUM_DUE: &str = "minimum_due";
pub const PAYMENT_AMOUNT: &str = "payment_amount";

/// Snapshot attributes carried onto the account table
pub const SNAPSHOT_FIELDS: [&str; 6] = [
    "credit_line",
    "bureau_score",
    "utilization",
    "behavior_score",
    "delinquent_cycles",
    "nsf_count",
];

const ROW_INDEX: &str = "__row_nr";
const BAD_ROW: &str = "__bad_row";
const RAW_SUFFIX: &str = "__raw";

/// The extracts consumed by one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Transactions,
    Accounts,
    Snapshots,
    FraudCases,
    FraudTransactions,
    Statements,
    Customers,
}

impl SourceKind {
    /// Columns that must exist once the schema mapping is applied
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            Self::Transactions => &[ACCT_ID, TXN_DATE, AMOUNT, "merchant_category", "merchant_name"],
            Self::Accounts => &[ACCT_ID, CLIENT_ID, OPEN_DATE, "activation_date", STATUS],
            Self::Snapshots => &[
                ACCT_ID,
                PROCESS_DATE,
                "credit_line",
                "bureau_score",
                "utilization",
                "behavior_score",
                "delinquent_cycles",
                "nsf_count",
            ],
            Self::FraudCases => &[ACCT_ID, "case_open_date", "case_type"],
            Self::FraudTransactions => &[ACCT_ID, TXN_DATE, AMOUNT],
            Self::Statements => &[
                ACCT_ID,
                STATEMENT_DATE,
                CLOSING_BALANCE,
                MINIMUM_DUE,
                PAYMENT_AMOUNT,
            ],
            Self::Customers => &[CLIENT_ID, CUSTOMER_ID, "customer_since"],
        }
    }

    pub fn date_columns(self) -> &'static [&'static str] {
        match self {
            Self::Transactions | Self::FraudTransactions => &[TXN_DATE],
            Self::Accounts => &[OPEN_DATE, "activation_date"],
            Self::Snapshots => &[PROCESS_DATE],
            Self::FraudCases => &["case_open_date"],
            Self::Statements => &[STATEMENT_DATE],
            Self::Customers => &["customer_since"],
        }
    }

    pub fn numeric_columns(self) -> &'static [&'static str] {
        match self {
            Self::Transactions | Self::FraudTransactions => &[AMOUNT],
            Self::Snapshots => &SNAPSHOT_FIELDS,
            Self::Statements => &[CLOSING_BALANCE, MINIMUM_DUE, PAYMENT_AMOUNT],
            Self::Accounts | Self::FraudCases | Self::Customers => &[],
        }
    }

    /// Key columns normalised to strings so joins compare like with like
    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            Self::Accounts => &[ACCT_ID, CLIENT_ID],
            Self::Customers => &[CLIENT_ID, CUSTOMER_ID],
            _ => &[ACCT_ID],
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transactions => "transactions",
            Self::Accounts => "accounts",
            Self::Snapshots => "snapshots",
            Self::FraudCases => "fraud_cases",
            Self::FraudTransactions => "fraud_transactions",
            Self::Statements => "statements",
            Self::Customers => "customers",
        };
        f.write_str(name)
    }
}

/// A single column rename applied before any join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRename {
    pub from: String,
    pub to: String,
}

/// Explicit per-source renames onto the canonical column names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub renames: Vec<ColumnRename>,
}

impl SchemaMapping {
    pub fn rename(from: &str, to: &str) -> Self {
        Self {
            renames: vec![ColumnRename {
                from: from.to_string(),
                to: to.to_string(),
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }

    /// Apply the mapping to a header, failing when a rename source is absent
    /// or a required column is still missing afterwards.
    pub fn apply(
        &self,
        table: &str,
        header: &[String],
        required: &[&str],
    ) -> Result<Vec<String>, PipelineError> {
        let mut columns = header.to_vec();
        for rename in &self.renames {
            let slot = columns
                .iter_mut()
                .find(|c| **c == rename.from)
                .ok_or_else(|| PipelineError::MissingColumn {
                    table: table.to_string(),
                    column: rename.from.clone(),
                })?;
            *slot = rename.to.clone();
        }

        if let Some(missing) = required.iter().find(|r| !columns.iter().any(|c| c == *r)) {
            return Err(PipelineError::MissingColumn {
                table: table.to_string(),
                column: (*missing).to_string(),
            });
        }

        Ok(columns)
    }
}

/// Inclusive calendar date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Polars predicate selecting rows of `column` inside the range
    pub fn expr(&self, column: &str) -> Expr {
        col(column)
            .gt_eq(lit(self.start))
            .and(col(column).lt_eq(lit(self.end)))
    }
}

/// What to do with rows whose fields fail to parse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadRowPolicy {
    #[default]
    Abort,
    Drop,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub date_format: String,
    pub bad_rows: BadRowPolicy,
    pub streaming: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            date_format: "%Y-%m-%d".to_string(),
            bad_rows: BadRowPolicy::Abort,
            streaming: false,
        }
    }
}

/// Read only the header row of a CSV file
pub fn read_header(path: &Path) -> crate::Result<Vec<String>> {
    let empty = LazyCsvReader::new(path)
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .with_n_rows(Some(0))
        .finish()?
        .collect()?;

    Ok(empty
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect())
}

/// Load one source extract with typed columns
///
/// # Arguments
/// * `path` - CSV file to scan
/// * `kind` - Which source the file holds (decides required and typed columns)
/// * `mapping` - Renames applied before validation
/// * `range` - Optional inclusive filter on the first date column
/// * `options` - Date format, bad-row policy and streaming switch
///
/// # Returns
/// * `DataFrame` with every header column, typed where declared
pub fn load_table(
    path: &Path,
    kind: SourceKind,
    mapping: &SchemaMapping,
    range: Option<DateRange>,
    options: &LoadOptions,
) -> crate::Result<DataFrame> {
    let table = format!("{} ({})", kind, path.display());
    let header = read_header(path)?;
    let columns = mapping.apply(&table, &header, kind.required_columns())?;

    let mut lf = LazyCsvReader::new(path)
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .finish()?
        .with_row_index(ROW_INDEX, None);

    if !mapping.is_empty() {
        let from: Vec<&str> = mapping.renames.iter().map(|r| r.from.as_str()).collect();
        let to: Vec<&str> = mapping.renames.iter().map(|r| r.to.as_str()).collect();
        lf = lf.rename(from, to);
    }

    let typed: Vec<&str> = kind
        .date_columns()
        .iter()
        .chain(kind.numeric_columns())
        .copied()
        .collect();

    lf = lf.with_columns(
        typed
            .iter()
            .map(|&c| col(c).alias(&raw_name(c)))
            .collect::<Vec<_>>(),
    );

    let mut conversions: Vec<Expr> = kind
        .date_columns()
        .iter()
        .map(|&c| {
            col(c).str().to_date(StrptimeOptions {
                format: Some(options.date_format.clone().into()),
                strict: false,
                exact: true,
                ..Default::default()
            })
        })
        .collect();
    conversions.extend(
        kind.numeric_columns()
            .iter()
            .map(|&c| col(c).cast(DataType::Float64)),
    );
    conversions.extend(
        kind.key_columns()
            .iter()
            .map(|&c| col(c).cast(DataType::String)),
    );
    lf = lf.with_columns(conversions);

    let bad_row = typed
        .iter()
        .map(|&c| col(&raw_name(c)).is_not_null().and(col(c).is_null()))
        .reduce(|a, b| a.or(b))
        .unwrap_or_else(|| lit(false));
    lf = lf.with_column(bad_row.alias(BAD_ROW));

    if let Some(range) = range {
        let date_col = kind.date_columns()[0];
        lf = lf.filter(range.expr(date_col).or(col(BAD_ROW)));
    }

    let df = lf.with_streaming(options.streaming).collect()?;

    let bad = df.clone().lazy().filter(col(BAD_ROW)).collect()?;
    if bad.height() > 0 {
        let first = describe_bad_row(&table, &bad, &typed)?;
        match options.bad_rows {
            BadRowPolicy::Abort => return Err(first.into()),
            BadRowPolicy::Drop => {
                log::warn!("{}: dropping {} unparseable rows ({})", table, bad.height(), first);
            }
        }
    }

    let keep: Vec<Expr> = columns.iter().map(|c| col(c.as_str())).collect();
    let out = df
        .lazy()
        .filter(col(BAD_ROW).not())
        .select(keep)
        .collect()?;

    log::debug!("{}: loaded {} rows", table, out.height());
    Ok(out)
}

fn raw_name(column: &str) -> String {
    format!("{}{}", column, RAW_SUFFIX)
}

/// Build the diagnostic for the first bad row of a frame
fn describe_bad_row(table: &str, bad: &DataFrame, typed: &[&str]) -> crate::Result<PipelineError> {
    let row = bad
        .column(ROW_INDEX)?
        .cast(&DataType::Int64)?
        .i64()?
        .get(0)
        .unwrap_or_default();

    for &column in typed {
        let parsed_null = bad.column(column)?.is_null().get(0).unwrap_or(false);
        let raw = bad.column(&raw_name(column))?.str()?.get(0).map(|v| v.to_string());
        if let (true, Some(value)) = (parsed_null, raw) {
            return Ok(PipelineError::Parse {
                table: table.to_string(),
                // header occupies line 1
                line: row as u64 + 2,
                column: column.to_string(),
                value,
            });
        }
    }

    Err(anyhow::anyhow!("{}: bad row {} has no failing column", table, row))
}

/// Concatenate transaction tables that share one schema
///
/// Rows are unioned in input order; nothing is deduplicated.
pub fn unify_transactions(tables: Vec<DataFrame>) -> crate::Result<DataFrame> {
    let Some(first) = tables.first() else {
        return Err(PipelineError::Config("no transaction tables to unify".to_string()).into());
    };

    let schema = first.schema();
    for (i, table) in tables.iter().enumerate().skip(1) {
        if table.schema() != schema {
            return Err(PipelineError::SchemaMismatch(format!(
                "table {} columns {:?} differ from {:?}",
                i,
                table.get_column_names(),
                first.get_column_names()
            ))
            .into());
        }
    }

    let expected: usize = tables.iter().map(|t| t.height()).sum();
    let frames: Vec<LazyFrame> = tables.into_iter().map(|t| t.lazy()).collect();
    let unified = concat(frames, UnionArgs::default())?.collect()?;

    debug_assert_eq!(unified.height(), expected);
    log::info!("Unified transactions: {} rows", unified.height());
    Ok(unified)
}

/// Gather a float column into a vector, treating nulls as zero
pub fn f64_column(df: &DataFrame, name: &str) -> crate::Result<Vec<f64>> {
    Ok(df
        .column(name)?
        .cast(&DataType::Float64)?
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(0.0))
        .collect())
}

/// Gather a date column into calendar dates
pub fn date_column(df: &DataFrame, name: &str) -> crate::Result<Vec<Option<NaiveDate>>> {
    Ok(df
        .column(name)?
        .cast(&DataType::Int32)?
        .i32()?
        .into_iter()
        .map(|days| days.map(from_epoch_days))
        .collect())
}

pub fn epoch_days(date: NaiveDate) -> i64 {
    (date - unix_epoch()).num_days()
}

pub fn from_epoch_days(days: i32) -> NaiveDate {
    unix_epoch() + chrono::Duration::days(i64::from(days))
}

fn unix_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Gather a string column into a vector, treating nulls as empty
pub fn str_column(df: &DataFrame, name: &str) -> crate::Result<Vec<String>> {
    Ok(df
        .column(name)?
        .cast(&DataType::String)?
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect())
}
