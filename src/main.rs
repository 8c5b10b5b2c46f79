//! SpendForge: batch spend forecasting, tiering and risk scoring
//!
//! This is the main entrypoint that resolves configuration, runs the
//! pipeline, prints the report and writes the charts.

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use spendforge::{pipeline, viz, Args, PipelineReport, PredictionRow};
use std::time::Instant;

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let config = args.resolve_config()?;
    log::debug!("Configuration: {:?}", config);

    let start_time = Instant::now();
    let report = pipeline::run(&config)?;
    let elapsed = start_time.elapsed();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if let Some(ref acct_id) = args.account {
        match report.prediction(acct_id) {
            Some(row) => print_prediction(row),
            None => anyhow::bail!("Account '{}' is not in the scoring table", acct_id),
        }
    } else {
        print_report(&report);
    }

    if !args.no_charts {
        let paths = viz::generate_charts(&report, &args.output)?;
        if !args.json {
            for path in paths {
                println!("Chart saved to: {}", path.display());
            }
        }
    }

    log::info!("Pipeline finished in {:.2}s", elapsed.as_secs_f64());
    Ok(())
}

fn print_prediction(row: &PredictionRow) {
    println!("=== Account {} ===", row.acct_id);
    println!("  Predicted spend:  {:.2}", row.predicted_spend);
    println!("  Tier:             {}", row.tier);
    println!("  Risk probability: {:.3}", row.risk_probability);
    println!("  Risk flagged:     {}", row.risk_flagged);
    println!("  Risk label:       {}", row.risk_label);
}

fn print_report(report: &PipelineReport) {
    println!("=== Load & Join ===");
    for (file, rows) in &report.load.transaction_files {
        println!("  {}: {} transactions", file, rows);
    }
    println!("✓ Unified transactions: {}", report.load.transactions);
    println!(
        "✓ Accounts: {} ({} with a snapshot, {} fraud)",
        report.joins.enriched_accounts, report.joins.latest_snapshots, report.joins.fraud_accounts
    );
    println!("  Orphan transactions: {}", report.joins.orphan_transactions);
    println!(
        "✓ Feature table: {} accounts x {} features",
        report.feature_shape.0, report.feature_shape.1
    );

    let forecast = &report.forecast;
    println!("\n=== Portfolio Forecast ===");
    println!(
        "Model: {}{} (AIC {:.3})",
        forecast.order,
        if forecast.seasonal_used { " with seasonal differencing" } else { "" },
        forecast.aic
    );
    for (month, value) in forecast.months.iter().zip(&forecast.points) {
        println!("  {}: {:.2}", month, value);
    }
    match &forecast.holdout {
        Some(m) => println!("Holdout ({} months): RMSE {:.2}, MAE {:.2}", m.n, m.rmse, m.mae),
        None => println!("Holdout: not evaluated"),
    }

    let spend = &report.spend;
    println!("\n=== Spend Model ===");
    println!(
        "Train/test: {}/{} accounts, RMSE {:.2}, MAE {:.2}",
        spend.n_train, spend.n_test, spend.metrics.rmse, spend.metrics.mae
    );

    let counts = &report.tier_counts;
    let total = counts.total().max(1) as f64;
    println!("\n=== Spend Tiers ===");
    println!(
        "Thresholds: T1={:.2}, T2={:.2}",
        report.thresholds.low_max, report.thresholds.medium_max
    );
    for (name, count) in [("Low", counts.low), ("Medium", counts.medium), ("High", counts.high)] {
        println!("  {}: {} accounts ({:.1}%)", name, count, count as f64 / total * 100.0);
    }
    if let Some(t) = &report.suggested_thresholds {
        println!("Suggested (advisory): T1={:.2}, T2={:.2}", t.low_max, t.medium_max);
    }

    let risk = &report.risk;
    let r = &risk.report;
    println!("\n=== Risk Classifier ===");
    println!(
        "Train/test: {}/{} accounts, positive rate {:.1}%",
        risk.n_train,
        risk.n_test,
        risk.positive_rate * 100.0
    );
    println!(
        "Precision {:.3}, Recall {:.3}, F1 {:.3} (accuracy {:.3})",
        r.precision, r.recall, r.f1, r.accuracy
    );
    println!(
        "Confusion: tp={} fp={} tn={} fn={}",
        r.confusion.tp, r.confusion.fp, r.confusion.tn, r.confusion.fn_
    );
    if r.degenerate {
        println!("⚠ Evaluation is degenerate; metrics are not trustworthy");
    }
}
