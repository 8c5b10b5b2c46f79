//! Portfolio spend forecasting with a seasonal ARIMA estimator
//!
//! The series is seasonally differenced at lag `s` (when a period is set),
//! then differenced `d` times. The remaining ARMA(p, q) with a constant is
//! fitted by least squares: pure AR by OLS, and MA terms by the two-step
//! Hannan-Rissanen regression on the residuals of a long AR fit. Every
//! linear solve goes through an SVD.
//!
//! If the series is too short for the seasonal model, [`forecast_portfolio`]
//! logs a warning and fits the non-seasonal model instead.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PipelineError;
use crate::features::{MonthlySeries, YearMonth};
use crate::metrics::RegressionMetrics;

/// Floor on the residual variance so a perfect fit still has a finite AIC
const MIN_SIGMA2: f64 = 1e-12;

/// Singular values below this are treated as zero by the SVD solve
const SVD_EPS: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    #[error("Insufficient data: need at least {needed} observations, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("Singular least-squares system: {0}")]
    Singular(String),

    #[error("Invalid forecast horizon: {0}")]
    InvalidHorizon(String),
}

/// Non-seasonal ARIMA order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

impl ArimaOrder {
    pub fn new(p: usize, d: usize, q: usize) -> Self {
        Self { p, d, q }
    }

    /// Order of the long AR used for the first Hannan-Rissanen step
    fn long_ar(&self) -> usize {
        self.p + self.q + 1
    }

    /// First index of the stationary series with every regressor available
    fn warmup(&self) -> usize {
        if self.q == 0 {
            self.p
        } else {
            self.p.max(self.long_ar() + self.q)
        }
    }

    fn n_params(&self) -> usize {
        self.p + self.q + 1
    }

    /// Shortest stationary series the ARMA regression accepts
    fn arma_min(&self) -> usize {
        // two residual degrees of freedom on top of the parameters
        let main = self.warmup() + self.n_params() + 2;
        if self.q == 0 {
            main
        } else {
            let k = self.long_ar();
            main.max(2 * k + 3)
        }
    }
}

impl fmt::Display for ArimaOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ARIMA({},{},{})", self.p, self.d, self.q)
    }
}

/// Forecast settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Months to forecast past the last observed month
    pub horizon: usize,
    /// Seasonal period in months; `None` disables seasonal differencing
    pub seasonal_period: Option<usize>,
    pub d: usize,
    pub max_p: usize,
    pub max_q: usize,
    /// Fixed order, bypassing the AIC search
    pub order: Option<ArimaOrder>,
    /// Trailing months held out to score the forecast
    pub holdout: usize,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizon: 3,
            seasonal_period: Some(12),
            d: 1,
            max_p: 2,
            max_q: 2,
            order: None,
            holdout: 3,
        }
    }
}

impl ForecastConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.horizon == 0 {
            return Err(PipelineError::Config("forecast horizon must be at least 1".into()));
        }
        if matches!(self.seasonal_period, Some(s) if s < 2) {
            return Err(PipelineError::Config(
                "seasonal period must be at least 2 (or null to disable)".into(),
            ));
        }
        Ok(())
    }
}

/// A fitted ARIMA(p, d, q) model, optionally with one seasonal difference
#[derive(Debug, Clone)]
pub struct ArimaModel {
    pub order: ArimaOrder,
    pub seasonal_period: Option<usize>,
    pub constant: f64,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    pub sigma2: f64,
    /// AIC per effective observation
    pub aic: f64,
    pub n_obs: usize,
    history: Vec<f64>,
    stationary: Vec<f64>,
    residuals: Vec<f64>,
    level_tails: Vec<f64>,
}

impl ArimaModel {
    /// Observations needed before any differencing
    pub fn required_len(order: ArimaOrder, seasonal_period: Option<usize>) -> usize {
        let seasonal = seasonal_period.map(|s| 2 * s).unwrap_or(0);
        seasonal + order.d + order.arma_min()
    }

    pub fn fit(
        series: &[f64],
        order: ArimaOrder,
        seasonal_period: Option<usize>,
    ) -> Result<Self, ForecastError> {
        let seasonal_period = seasonal_period.filter(|&s| s > 1);
        let needed = Self::required_len(order, seasonal_period);
        if series.len() < needed {
            return Err(ForecastError::InsufficientData {
                needed,
                got: series.len(),
            });
        }

        let mut current = match seasonal_period {
            Some(s) => difference(series, s),
            None => series.to_vec(),
        };
        let mut level_tails = Vec::with_capacity(order.d);
        for _ in 0..order.d {
            level_tails.push(current.last().copied().unwrap_or(0.0));
            current = difference(&current, 1);
        }

        let fit = fit_arma(&current, order)?;
        let k = order.n_params() as f64;
        let n = fit.n_eff as f64;
        let sigma2 = (fit.rss / n).max(MIN_SIGMA2);
        let aic = sigma2.ln() + 2.0 * k / n;

        log::debug!(
            "{}{} fitted on {} obs: aic={:.4}",
            order,
            seasonal_period.map(|s| format!("(0,1,0)[{}]", s)).unwrap_or_default(),
            fit.n_eff,
            aic
        );

        Ok(Self {
            order,
            seasonal_period,
            constant: fit.constant,
            ar: fit.ar,
            ma: fit.ma,
            sigma2,
            aic,
            n_obs: fit.n_eff,
            history: series.to_vec(),
            stationary: current,
            residuals: fit.residuals,
            level_tails,
        })
    }

    /// Point forecasts for the next `h` periods on the original scale
    pub fn forecast(&self, h: usize) -> Result<Vec<f64>, ForecastError> {
        if h == 0 {
            return Err(ForecastError::InvalidHorizon("horizon must be at least 1".into()));
        }

        let p = self.order.p;
        let q = self.order.q;
        let mut w = self.stationary.clone();
        let mut e = self.residuals.clone();
        let mut out = Vec::with_capacity(h);
        for _ in 0..h {
            let t = w.len();
            let mut value = self.constant;
            for i in 1..=p {
                value += self.ar[i - 1] * w[t - i];
            }
            for j in 1..=q {
                value += self.ma[j - 1] * e[t - j];
            }
            w.push(value);
            // future shocks have zero expectation
            e.push(0.0);
            out.push(value);
        }

        for &tail in self.level_tails.iter().rev() {
            out = integrate(&out, tail);
        }

        if let Some(s) = self.seasonal_period {
            let mut levels = self.history.clone();
            for value in out.iter_mut() {
                *value += levels[levels.len() - s];
                levels.push(*value);
            }
        }

        Ok(out)
    }
}

/// Lag-`lag` difference: `x[t] - x[t - lag]`
pub fn difference(data: &[f64], lag: usize) -> Vec<f64> {
    if lag == 0 {
        return data.to_vec();
    }
    data.windows(lag + 1).map(|w| w[lag] - w[0]).collect()
}

fn integrate(diff: &[f64], start: f64) -> Vec<f64> {
    let mut level = start;
    diff.iter()
        .map(|d| {
            level += d;
            level
        })
        .collect()
}

struct ArmaFit {
    constant: f64,
    ar: Vec<f64>,
    ma: Vec<f64>,
    /// Aligned with the stationary series, zero during warm-up
    residuals: Vec<f64>,
    rss: f64,
    n_eff: usize,
}

fn fit_arma(w: &[f64], order: ArimaOrder) -> Result<ArmaFit, ForecastError> {
    let p = order.p;
    let q = order.q;
    let m = w.len();

    if m < order.arma_min() {
        return Err(ForecastError::InsufficientData {
            needed: order.arma_min(),
            got: m,
        });
    }

    // first step: long AR residuals stand in for the unobserved shocks
    let shocks = if q > 0 {
        let k = order.long_ar();
        let (_, resid) = regress(w, k, k, &[], 0)?;
        let mut shocks = vec![0.0; m];
        shocks[k..].copy_from_slice(resid.as_slice());
        shocks
    } else {
        Vec::new()
    };

    let start = order.warmup();
    let (beta, resid) = regress(w, start, p, &shocks, q)?;

    let mut residuals = vec![0.0; m];
    residuals[start..].copy_from_slice(resid.as_slice());

    Ok(ArmaFit {
        constant: beta[0],
        ar: beta.iter().skip(1).take(p).copied().collect(),
        ma: beta.iter().skip(1 + p).take(q).copied().collect(),
        rss: resid.iter().map(|r| r * r).sum(),
        n_eff: m - start,
        residuals,
    })
}

/// Regress `w[t]` on `[1, w[t-1..=t-p], shocks[t-1..=t-q]]` for `t` in `start..`
fn regress(
    w: &[f64],
    start: usize,
    p: usize,
    shocks: &[f64],
    q: usize,
) -> Result<(DVector<f64>, DVector<f64>), ForecastError> {
    let rows = w.len().saturating_sub(start);
    let cols = 1 + p + q;
    if rows <= cols {
        return Err(ForecastError::InsufficientData {
            needed: start + cols + 1,
            got: w.len(),
        });
    }

    let mut x = Vec::with_capacity(rows * cols);
    for t in start..w.len() {
        x.push(1.0);
        x.extend((1..=p).map(|i| w[t - i]));
        x.extend((1..=q).map(|j| shocks[t - j]));
    }

    let x = DMatrix::from_row_slice(rows, cols, &x);
    let y = DVector::from_column_slice(&w[start..]);
    let beta = x
        .clone()
        .svd(true, true)
        .solve(&y, SVD_EPS)
        .map_err(|e| ForecastError::Singular(e.to_string()))?;

    if beta.iter().any(|b| !b.is_finite()) {
        return Err(ForecastError::Singular("non-finite coefficients".into()));
    }

    let resid = &y - &x * &beta;
    Ok((beta, resid))
}

/// Fit the configured order, or the lowest-AIC order over the search grid
///
/// Candidates are visited in ascending `p` then `q`; a strictly lower AIC is
/// required to replace the incumbent, so ties keep the earlier candidate.
pub fn select_order(
    series: &[f64],
    config: &ForecastConfig,
    seasonal_period: Option<usize>,
) -> Result<ArimaModel, ForecastError> {
    if let Some(order) = config.order {
        return ArimaModel::fit(series, order, seasonal_period);
    }

    let mut best: Option<ArimaModel> = None;
    let mut first_err = None;
    for p in 0..=config.max_p {
        for q in 0..=config.max_q {
            match ArimaModel::fit(series, ArimaOrder::new(p, config.d, q), seasonal_period) {
                Ok(model) => {
                    if best.as_ref().map_or(true, |b| model.aic < b.aic) {
                        best = Some(model);
                    }
                }
                Err(err) => {
                    log::debug!("skipping ARIMA({},{},{}): {}", p, config.d, q, err);
                    first_err.get_or_insert(err);
                }
            }
        }
    }

    best.ok_or_else(|| {
        first_err.unwrap_or(ForecastError::InsufficientData {
            needed: 1,
            got: series.len(),
        })
    })
}

/// Seasonal fit, falling back to non-seasonal when the seasonal fit fails
pub fn fit_with_fallback(series: &[f64], config: &ForecastConfig) -> Result<ArimaModel, ForecastError> {
    match config.seasonal_period.filter(|&s| s > 1) {
        Some(s) => or_non_seasonal(select_order(series, config, Some(s)), s, || {
            select_order(series, config, None)
        }),
        None => select_order(series, config, None),
    }
}

fn or_non_seasonal(
    seasonal: Result<ArimaModel, ForecastError>,
    period: usize,
    fallback: impl FnOnce() -> Result<ArimaModel, ForecastError>,
) -> Result<ArimaModel, ForecastError> {
    match seasonal {
        Ok(model) => Ok(model),
        Err(ForecastError::InsufficientData { needed, got }) => {
            log::warn!(
                "Series too short for seasonal period {} ({} < {}); fitting non-seasonal model",
                period,
                got,
                needed
            );
            fallback()
        }
        Err(err) => {
            log::warn!("Seasonal fit with period {} failed ({}); fitting non-seasonal model", period, err);
            fallback()
        }
    }
}

/// Forecast of total monthly portfolio spend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioForecast {
    pub order: ArimaOrder,
    pub seasonal_used: bool,
    pub aic: f64,
    pub history: MonthlySeries,
    pub months: Vec<YearMonth>,
    pub points: Vec<f64>,
    pub holdout: Option<RegressionMetrics>,
}

/// Fit and forecast the monthly portfolio series
///
/// With `holdout > 0` the trailing months are first forecast from a model
/// fitted without them and scored. The reported forecast always comes from
/// a refit on the full series. Forecasts are clamped at zero.
pub fn forecast_portfolio(series: &MonthlySeries, config: &ForecastConfig) -> crate::Result<PortfolioForecast> {
    if config.horizon == 0 {
        return Err(ForecastError::InvalidHorizon("horizon must be at least 1".into()).into());
    }

    let values = &series.values;
    let holdout = if config.holdout > 0 && values.len() > config.holdout {
        let split = values.len() - config.holdout;
        match fit_with_fallback(&values[..split], config).and_then(|m| m.forecast(config.holdout)) {
            Ok(predicted) => {
                let predicted: Vec<f64> = predicted.into_iter().map(|v| v.max(0.0)).collect();
                let metrics = RegressionMetrics::compute(&values[split..], &predicted);
                log::info!(
                    "Forecast holdout ({} months): rmse={:.2} mae={:.2}",
                    config.holdout,
                    metrics.rmse,
                    metrics.mae
                );
                Some(metrics)
            }
            Err(err) => {
                log::warn!("Skipping forecast holdout: {}", err);
                None
            }
        }
    } else {
        None
    };

    let model = fit_with_fallback(values, config)?;
    let points: Vec<f64> = model
        .forecast(config.horizon)?
        .into_iter()
        .map(|v| v.max(0.0))
        .collect();

    log::info!(
        "Forecast: {}{} over {} months, next {} months",
        model.order,
        if model.seasonal_period.is_some() { " seasonal" } else { "" },
        values.len(),
        config.horizon
    );

    Ok(PortfolioForecast {
        order: model.order,
        seasonal_used: model.seasonal_period.is_some(),
        aic: model.aic,
        history: series.clone(),
        months: series.future_months(config.horizon),
        points,
        holdout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const PATTERN: [f64; 12] = [5.0, -3.0, 2.0, 8.0, -6.0, 0.0, 4.0, -1.0, 7.0, -4.0, 3.0, 9.0];

    fn seasonal_series(n: usize) -> Vec<f64> {
        (0..n).map(|t| 100.0 + t as f64 + PATTERN[t % 12]).collect()
    }

    fn monthly(values: Vec<f64>) -> MonthlySeries {
        let mut months = vec![YearMonth::new(2022, 1)];
        while months.len() < values.len() {
            let next = months[months.len() - 1].next();
            months.push(next);
        }
        MonthlySeries { months, values }
    }

    #[test]
    fn test_difference() {
        assert_eq!(difference(&[1.0, 4.0, 9.0, 16.0], 1), vec![3.0, 5.0, 7.0]);
        assert_eq!(difference(&[1.0, 4.0, 9.0, 16.0], 2), vec![8.0, 12.0]);
        assert!(difference(&[1.0], 3).is_empty());
    }

    #[test]
    fn test_ar1_coefficient_recovered() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut x = vec![0.0];
        for _ in 0..1000 {
            let prev = x[x.len() - 1];
            x.push(0.6 * prev + rng.gen_range(-1.0..1.0));
        }

        let model = ArimaModel::fit(&x, ArimaOrder::new(1, 0, 0), None).unwrap();
        assert!((model.ar[0] - 0.6).abs() < 0.1, "phi = {}", model.ar[0]);
        assert!(model.constant.abs() < 0.1);
    }

    #[test]
    fn test_arma_fit_runs_hannan_rissanen() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut x = vec![0.0];
        let mut prev_shock = 0.0;
        for _ in 0..600 {
            let shock = rng.gen_range(-1.0..1.0);
            let prev = x[x.len() - 1];
            x.push(0.5 * prev + shock + 0.4 * prev_shock);
            prev_shock = shock;
        }

        let model = ArimaModel::fit(&x, ArimaOrder::new(1, 0, 1), None).unwrap();
        assert_eq!(model.ar.len(), 1);
        assert_eq!(model.ma.len(), 1);
        assert!(model.ma[0] > 0.0);
        assert_eq!(model.forecast(4).unwrap().len(), 4);
    }

    #[test]
    fn test_linear_trend_continues() {
        let y: Vec<f64> = (0..25).map(|t| 10.0 + 2.0 * t as f64).collect();
        let model = ArimaModel::fit(&y, ArimaOrder::new(0, 1, 0), None).unwrap();

        let f = model.forecast(3).unwrap();
        assert_relative_eq!(f[0], 60.0, epsilon = 1e-9);
        assert_relative_eq!(f[1], 62.0, epsilon = 1e-9);
        assert_relative_eq!(f[2], 64.0, epsilon = 1e-9);
    }

    #[test]
    fn test_seasonal_pattern_continues() {
        let y = seasonal_series(36);
        let model = ArimaModel::fit(&y, ArimaOrder::new(0, 0, 0), Some(12)).unwrap();

        let f = model.forecast(12).unwrap();
        let expected = &seasonal_series(48)[36..];
        for (got, want) in f.iter().zip(expected) {
            assert_relative_eq!(*got, *want, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_short_series_rejected_before_seasonal_differencing() {
        let y = seasonal_series(20);
        let err = ArimaModel::fit(&y, ArimaOrder::new(0, 1, 0), Some(12)).unwrap_err();
        assert_eq!(err, ForecastError::InsufficientData { needed: 28, got: 20 });
    }

    #[test]
    fn test_short_series_falls_back_to_non_seasonal() {
        let series = monthly(seasonal_series(20));
        let config = ForecastConfig::default();

        let forecast = forecast_portfolio(&series, &config).unwrap();

        assert!(!forecast.seasonal_used);
        assert_eq!(forecast.points.len(), 3);
        assert_eq!(forecast.months[0], YearMonth::new(2023, 9));
        assert!(forecast.points.iter().all(|v| *v >= 0.0));
        assert!(forecast.holdout.is_some());
    }

    #[test]
    fn test_singular_seasonal_fit_falls_back() {
        let y = seasonal_series(30);
        let singular = Err(ForecastError::Singular("non-finite coefficients".into()));

        let model = or_non_seasonal(singular, 12, || ArimaModel::fit(&y, ArimaOrder::new(0, 1, 0), None)).unwrap();

        assert_eq!(model.seasonal_period, None);
        assert_eq!(model.forecast(2).unwrap().len(), 2);
    }

    #[test]
    fn test_fallback_error_is_reported() {
        let singular = Err(ForecastError::Singular("seasonal".into()));
        let err = or_non_seasonal(singular, 12, || {
            Err(ForecastError::InsufficientData { needed: 5, got: 2 })
        })
        .unwrap_err();
        assert_eq!(err, ForecastError::InsufficientData { needed: 5, got: 2 });
    }

    #[test]
    fn test_long_series_uses_seasonal_model() {
        let series = monthly(seasonal_series(48));
        let forecast = forecast_portfolio(&series, &ForecastConfig::default()).unwrap();
        assert!(forecast.seasonal_used);
    }

    #[test]
    fn test_fixed_order_bypasses_search() {
        let y = seasonal_series(30);
        let config = ForecastConfig {
            order: Some(ArimaOrder::new(1, 1, 0)),
            ..ForecastConfig::default()
        };
        let model = select_order(&y, &config, None).unwrap();
        assert_eq!(model.order, ArimaOrder::new(1, 1, 0));
    }

    #[test]
    fn test_order_search_is_deterministic() {
        let y = seasonal_series(30);
        let config = ForecastConfig::default();
        let a = select_order(&y, &config, None).unwrap();
        let b = select_order(&y, &config, None).unwrap();
        assert_eq!(a.order, b.order);
        assert_eq!(a.forecast(3).unwrap(), b.forecast(3).unwrap());
    }

    #[test]
    fn test_zero_horizon_rejected() {
        let y = seasonal_series(30);
        let model = ArimaModel::fit(&y, ArimaOrder::new(0, 1, 0), None).unwrap();
        assert!(matches!(model.forecast(0), Err(ForecastError::InvalidHorizon(_))));
    }
}
