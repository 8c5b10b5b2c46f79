//! Account enrichment joins with null-rate sanity checks

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{ACCT_ID, CLIENT_ID, CUSTOMER_ID, PROCESS_DATE, STATUS};
use crate::error::PipelineError;

pub const ACCOUNTS_PER_CUSTOMER: &str = "accounts_per_customer";

/// Upper bound on the share of rows a left join may leave unmatched
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NullRateCheck {
    pub max_null_rate: f64,
}

impl Default for NullRateCheck {
    fn default() -> Self {
        Self { max_null_rate: 0.5 }
    }
}

impl NullRateCheck {
    /// Measure the null rate of `column` and fail past the limit
    pub fn verify(&self, join: &str, df: &DataFrame, column: &str) -> crate::Result<f64> {
        if df.height() == 0 {
            return Ok(0.0);
        }

        let null_rate = df.column(column)?.null_count() as f64 / df.height() as f64;
        log::debug!("join '{}': {:.3} of '{}' null", join, null_rate, column);

        if null_rate > self.max_null_rate {
            return Err(PipelineError::JoinKeyMismatch {
                join: join.to_string(),
                column: column.to_string(),
                null_rate,
                limit: self.max_null_rate,
            }
            .into());
        }

        Ok(null_rate)
    }
}

/// Keep the most recent snapshot per account
///
/// Rows are stably sorted by account ascending and processing date
/// descending, so the first row per account wins and ties keep file order.
pub fn latest_snapshots(snapshots: &DataFrame) -> crate::Result<DataFrame> {
    let latest = snapshots
        .clone()
        .lazy()
        .sort_by_exprs(
            vec![col(ACCT_ID), col(PROCESS_DATE)],
            SortMultipleOptions::default()
                .with_order_descending_multi([false, true])
                .with_nulls_last(true)
                .with_maintain_order(true),
        )
        .unique_stable(Some(vec![ACCT_ID.to_string()]), UniqueKeepStrategy::First)
        .collect()?;

    log::info!(
        "Snapshots deduplicated: {} rows -> {} accounts",
        snapshots.height(),
        latest.height()
    );
    Ok(latest)
}

/// Left-join account attributes onto every transaction
pub fn enrich_transactions(
    txns: &DataFrame,
    accounts: &DataFrame,
    check: &NullRateCheck,
) -> crate::Result<DataFrame> {
    let enriched = txns
        .clone()
        .lazy()
        .left_join(accounts.clone().lazy(), col(ACCT_ID), col(ACCT_ID))
        .collect()?;

    check.verify("transactions -> accounts", &enriched, STATUS)?;
    Ok(enriched)
}

/// Left-join the latest snapshot and the customer id onto accounts
pub fn enrich_accounts(
    accounts: &DataFrame,
    latest: &DataFrame,
    customers: &DataFrame,
    check: &NullRateCheck,
) -> crate::Result<DataFrame> {
    let with_snapshot = accounts
        .clone()
        .lazy()
        .left_join(latest.clone().lazy(), col(ACCT_ID), col(ACCT_ID))
        .collect()?;
    check.verify("accounts -> snapshots", &with_snapshot, PROCESS_DATE)?;

    let customer_ids = customers
        .clone()
        .lazy()
        .select([col(CLIENT_ID), col(CUSTOMER_ID)])
        .unique_stable(Some(vec![CLIENT_ID.to_string()]), UniqueKeepStrategy::First);

    let enriched = with_snapshot
        .lazy()
        .left_join(customer_ids, col(CLIENT_ID), col(CLIENT_ID))
        .with_column(
            col(ACCT_ID)
                .count()
                .over([col(CLIENT_ID)])
                .cast(DataType::Float64)
                .alias(ACCOUNTS_PER_CUSTOMER),
        )
        .collect()?;
    check.verify("accounts -> customers", &enriched, CUSTOMER_ID)?;

    Ok(enriched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{f64_column, str_column};

    fn snapshots() -> DataFrame {
        df!(
            ACCT_ID => &["A2", "A1", "A1", "A2", "A1"],
            PROCESS_DATE => &["2024-01-31", "2024-01-31", "2024-03-31", "2024-02-29", "2024-03-31"],
            "credit_line" => &[1000.0, 2000.0, 3000.0, 4000.0, 5000.0]
        )
        .unwrap()
        .lazy()
        .with_column(col(PROCESS_DATE).str().to_date(StrptimeOptions::default()))
        .collect()
        .unwrap()
    }

    #[test]
    fn test_latest_snapshot_one_per_account() {
        let latest = latest_snapshots(&snapshots()).unwrap();

        assert_eq!(latest.height(), 2);
        assert_eq!(
            str_column(&latest, ACCT_ID).unwrap(),
            vec!["A1".to_string(), "A2".to_string()]
        );
        // A1 ties on 2024-03-31: the first-seen row (3000) wins
        assert_eq!(f64_column(&latest, "credit_line").unwrap(), vec![3000.0, 4000.0]);
    }

    #[test]
    fn test_left_join_keeps_orphan_transactions() {
        let txns = df!(ACCT_ID => &["A1", "A9", "A1"], "amount" => &[1.0, 2.0, 3.0]).unwrap();
        let accounts = df!(ACCT_ID => &["A1"], STATUS => &["open"]).unwrap();

        let enriched = enrich_transactions(&txns, &accounts, &NullRateCheck::default()).unwrap();

        assert_eq!(enriched.height(), 3);
        assert_eq!(enriched.column(STATUS).unwrap().null_count(), 1);
    }

    #[test]
    fn test_mismatched_key_fails_null_rate_check() {
        let txns = df!(ACCT_ID => &["1", "2"], "amount" => &[1.0, 2.0]).unwrap();
        let accounts = df!(ACCT_ID => &["A1", "A2"], STATUS => &["open", "open"]).unwrap();

        let err = enrich_transactions(&txns, &accounts, &NullRateCheck::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::JoinKeyMismatch { .. })
        ));
    }

    #[test]
    fn test_accounts_per_customer() {
        let accounts = df!(
            ACCT_ID => &["A1", "A2", "A3"],
            CLIENT_ID => &["C1", "C1", "C2"],
            STATUS => &["open", "open", "closed"]
        )
        .unwrap();
        let latest = df!(
            ACCT_ID => &["A1", "A2", "A3"],
            PROCESS_DATE => &["2024-01-31", "2024-01-31", "2024-01-31"]
        )
        .unwrap();
        let customers = df!(CLIENT_ID => &["C1", "C2"], CUSTOMER_ID => &["P1", "P2"]).unwrap();

        let enriched =
            enrich_accounts(&accounts, &latest, &customers, &NullRateCheck::default()).unwrap();

        assert_eq!(enriched.height(), 3);
        assert_eq!(
            f64_column(&enriched, ACCOUNTS_PER_CUSTOMER).unwrap(),
            vec![2.0, 2.0, 1.0]
        );
    }
}
