//! Command-line interface definitions and argument parsing

use std::path::PathBuf;

use clap::Parser;

use crate::config::PipelineConfig;
use crate::segment::TierThresholds;

/// Spend forecasting, tiering and risk scoring over account CSV extracts
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory holding the CSV extracts, overriding the config
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Directory for the SVG charts
    #[arg(short, long, default_value = "output")]
    pub output: PathBuf,

    /// Tier thresholds as "T1,T2", overriding the config
    /// Example: --tiers "1000,10000"
    #[arg(short, long)]
    pub tiers: Option<String>,

    /// Print the prediction row of one account
    #[arg(short, long)]
    pub account: Option<String>,

    /// Print the full report as JSON
    #[arg(long)]
    pub json: bool,

    /// Skip writing charts
    #[arg(long)]
    pub no_charts: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Parse the tier thresholds from the `--tiers` string
    /// Expected format: "low_max,medium_max"
    pub fn parse_tier_thresholds(&self) -> crate::Result<Option<TierThresholds>> {
        let Some(ref tiers_str) = self.tiers else {
            return Ok(None);
        };

        let parts: Vec<&str> = tiers_str.split(',').collect();
        if parts.len() != 2 {
            anyhow::bail!("Tier thresholds must be in format 'T1,T2'");
        }

        let low_max: f64 = parts[0]
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid T1 value: {}", parts[0]))?;
        let medium_max: f64 = parts[1]
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid T2 value: {}", parts[1]))?;

        Ok(Some(TierThresholds::new(low_max, medium_max)?))
    }

    /// Load the config file (or defaults) and apply command-line overrides
    pub fn resolve_config(&self) -> crate::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(tiers) = self.parse_tier_thresholds()? {
            config.tiers = tiers;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(tiers: Option<&str>) -> Args {
        Args {
            config: None,
            data_dir: Some(PathBuf::from("extracts")),
            output: PathBuf::from("output"),
            tiers: tiers.map(str::to_string),
            account: None,
            json: false,
            no_charts: true,
            verbose: false,
        }
    }

    #[test]
    fn test_parse_tier_thresholds() {
        let mut a = args(Some("1000, 10000"));
        assert_eq!(
            a.parse_tier_thresholds().unwrap(),
            Some(TierThresholds {
                low_max: 1000.0,
                medium_max: 10000.0
            })
        );

        a.tiers = None;
        assert_eq!(a.parse_tier_thresholds().unwrap(), None);

        a.tiers = Some("invalid".to_string());
        assert!(a.parse_tier_thresholds().is_err());

        a.tiers = Some("abc,10".to_string());
        assert!(a.parse_tier_thresholds().is_err());

        // T1 must be below T2
        a.tiers = Some("10000,1000".to_string());
        assert!(a.parse_tier_thresholds().is_err());
    }

    #[test]
    fn test_overrides_applied_to_defaults() {
        let config = args(Some("500,2500")).resolve_config().unwrap();
        assert_eq!(config.data_dir, PathBuf::from("extracts"));
        assert_eq!(config.tiers.low_max, 500.0);
        assert_eq!(config.tiers.medium_max, 2500.0);
    }

    #[test]
    fn test_cli_parses_flags() {
        let a = Args::parse_from(["spendforge", "--tiers", "1,2", "--account", "A1", "--json", "--no-charts", "-v"]);
        assert_eq!(a.account.as_deref(), Some("A1"));
        assert!(a.json && a.no_charts && a.verbose);
        assert_eq!(a.output, PathBuf::from("output"));
    }
}
