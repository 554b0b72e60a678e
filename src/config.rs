use anyhow::{anyhow, Context, Result};
use chrono::{Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::fmt::Display;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::metrics::{
    MetricParams, DEFAULT_CORR_WINDOW, DEFAULT_HEDGE_WINDOW, DEFAULT_ZSCORE_FAST_WINDOW,
    DEFAULT_ZSCORE_SLOW_WINDOW,
};
use crate::model::OrderSide;
use crate::monitor::{validate_thresholds, DEFAULT_POLL_INTERVAL_SECS};
use crate::prices::FetchPolicy;
use crate::stationarity::{AdfScreener, DEFAULT_ADF_P_THRESHOLD, DEFAULT_MIN_SAMPLES};

pub const CONFIG_PATH_ENV: &str = "PAIRLAB_CONFIG_PATH";

const DEFAULT_LOOKBACK_DAYS: u64 = 730;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FETCH_RETRIES: u32 = 2;
const DEFAULT_TAKE_PROFIT_PCT: f64 = 5.0;
const DEFAULT_STOP_LOSS_PCT: f64 = 5.0;
const DEFAULT_LEVERAGE: i64 = 1;
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    pub tickers_file: Option<PathBuf>,
    pub price_file: Option<PathBuf>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub hedge_window: usize,
    pub corr_window: usize,
    pub zscore_fast_window: usize,
    pub zscore_slow_window: usize,
    pub adf_p_threshold: f64,
    pub adf_max_lag: Option<usize>,
    pub min_stationarity_samples: usize,
    pub bypass_stationarity: bool,
    pub fetch_timeout_secs: u64,
    pub fetch_retries: u32,
    pub poll_interval_secs: u64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub max_ticks: Option<u64>,
    pub positions_file: Option<PathBuf>,
    pub leverage: Decimal,
    pub replay_buying_power: Decimal,
    pub hedge_side: OrderSide,
    pub enter_hedge: bool,
    pub dry_run: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineYaml {
    symbols: Option<Vec<String>>,
    tickers_file: Option<PathBuf>,
    price_file: Option<PathBuf>,
    start_date: Option<String>,
    end_date: Option<String>,
    hedge_window: Option<usize>,
    corr_window: Option<usize>,
    zscore_fast_window: Option<usize>,
    zscore_slow_window: Option<usize>,
    adf_p_threshold: Option<f64>,
    adf_max_lag: Option<usize>,
    min_stationarity_samples: Option<usize>,
    bypass_stationarity: Option<bool>,
    fetch_timeout_secs: Option<u64>,
    fetch_retries: Option<u32>,
    poll_interval_secs: Option<u64>,
    take_profit_pct: Option<f64>,
    stop_loss_pct: Option<f64>,
    max_ticks: Option<u64>,
    positions_file: Option<PathBuf>,
    leverage: Option<Decimal>,
    replay_buying_power: Option<Decimal>,
    hedge_side: Option<String>,
    enter_hedge: Option<bool>,
    dry_run: Option<bool>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let end_date = Utc::now().date_naive();
        let start_date = end_date
            .checked_sub_days(Days::new(DEFAULT_LOOKBACK_DAYS))
            .unwrap_or(end_date);
        Self {
            symbols: Vec::new(),
            tickers_file: None,
            price_file: None,
            start_date,
            end_date,
            hedge_window: DEFAULT_HEDGE_WINDOW,
            corr_window: DEFAULT_CORR_WINDOW,
            zscore_fast_window: DEFAULT_ZSCORE_FAST_WINDOW,
            zscore_slow_window: DEFAULT_ZSCORE_SLOW_WINDOW,
            adf_p_threshold: DEFAULT_ADF_P_THRESHOLD,
            adf_max_lag: None,
            min_stationarity_samples: DEFAULT_MIN_SAMPLES,
            bypass_stationarity: false,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            take_profit_pct: DEFAULT_TAKE_PROFIT_PCT,
            stop_loss_pct: DEFAULT_STOP_LOSS_PCT,
            max_ticks: None,
            positions_file: None,
            leverage: Decimal::from(DEFAULT_LEVERAGE),
            replay_buying_power: Decimal::ZERO,
            hedge_side: OrderSide::Buy,
            enter_hedge: false,
            dry_run: true,
        }
    }
}

impl EngineConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open pairlab config {}", path_ref.display()))?;
        let yaml: EngineYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse pairlab config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    fn from_yaml(yaml: EngineYaml) -> Result<Self> {
        let defaults = Self::default();
        let hedge_side = match yaml.hedge_side.as_deref() {
            Some(side) => side.parse::<OrderSide>().map_err(|e: EngineError| anyhow!(e))?,
            None => defaults.hedge_side,
        };
        Ok(Self {
            symbols: yaml.symbols.unwrap_or_default(),
            tickers_file: yaml.tickers_file,
            price_file: yaml.price_file,
            start_date: yaml
                .start_date
                .as_deref()
                .map(|v| parse_date("start_date", v))
                .transpose()?
                .unwrap_or(defaults.start_date),
            end_date: yaml
                .end_date
                .as_deref()
                .map(|v| parse_date("end_date", v))
                .transpose()?
                .unwrap_or(defaults.end_date),
            hedge_window: yaml.hedge_window.unwrap_or(defaults.hedge_window),
            corr_window: yaml.corr_window.unwrap_or(defaults.corr_window),
            zscore_fast_window: yaml
                .zscore_fast_window
                .unwrap_or(defaults.zscore_fast_window),
            zscore_slow_window: yaml
                .zscore_slow_window
                .unwrap_or(defaults.zscore_slow_window),
            adf_p_threshold: yaml.adf_p_threshold.unwrap_or(defaults.adf_p_threshold),
            adf_max_lag: yaml.adf_max_lag,
            min_stationarity_samples: yaml
                .min_stationarity_samples
                .unwrap_or(defaults.min_stationarity_samples),
            bypass_stationarity: yaml.bypass_stationarity.unwrap_or(false),
            fetch_timeout_secs: yaml
                .fetch_timeout_secs
                .unwrap_or(defaults.fetch_timeout_secs),
            fetch_retries: yaml.fetch_retries.unwrap_or(defaults.fetch_retries),
            poll_interval_secs: yaml
                .poll_interval_secs
                .unwrap_or(defaults.poll_interval_secs),
            take_profit_pct: yaml.take_profit_pct.unwrap_or(defaults.take_profit_pct),
            stop_loss_pct: yaml.stop_loss_pct.unwrap_or(defaults.stop_loss_pct),
            max_ticks: yaml.max_ticks,
            positions_file: yaml.positions_file,
            leverage: yaml.leverage.unwrap_or(defaults.leverage),
            replay_buying_power: yaml
                .replay_buying_power
                .unwrap_or(defaults.replay_buying_power),
            hedge_side,
            enter_hedge: yaml.enter_hedge.unwrap_or(false),
            dry_run: yaml.dry_run.unwrap_or(true),
        })
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides from `lookup`; blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("SYMBOLS") {
            self.symbols = split_symbols(&value);
        }
        if let Some(value) = get("TICKERS_FILE") {
            self.tickers_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("PRICE_FILE") {
            self.price_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("POSITIONS_FILE") {
            self.positions_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("START_DATE") {
            self.start_date = parse_date("START_DATE", &value)?;
        }
        if let Some(value) = get("END_DATE") {
            self.end_date = parse_date("END_DATE", &value)?;
        }
        if let Some(value) = get("HEDGE_SIDE") {
            self.hedge_side = value.parse::<OrderSide>().map_err(|e: EngineError| anyhow!(e))?;
        }

        override_value(&get, "HEDGE_WINDOW", &mut self.hedge_window)?;
        override_value(&get, "CORR_WINDOW", &mut self.corr_window)?;
        override_value(&get, "ZSCORE_FAST_WINDOW", &mut self.zscore_fast_window)?;
        override_value(&get, "ZSCORE_SLOW_WINDOW", &mut self.zscore_slow_window)?;
        override_value(&get, "ADF_P_THRESHOLD", &mut self.adf_p_threshold)?;
        override_optional(&get, "ADF_MAX_LAG", &mut self.adf_max_lag)?;
        override_value(
            &get,
            "MIN_STATIONARITY_SAMPLES",
            &mut self.min_stationarity_samples,
        )?;
        override_value(&get, "FETCH_TIMEOUT_SECS", &mut self.fetch_timeout_secs)?;
        override_value(&get, "FETCH_RETRIES", &mut self.fetch_retries)?;
        override_value(&get, "POLL_INTERVAL_SECS", &mut self.poll_interval_secs)?;
        override_value(&get, "TAKE_PROFIT_PCT", &mut self.take_profit_pct)?;
        override_value(&get, "STOP_LOSS_PCT", &mut self.stop_loss_pct)?;
        override_optional(&get, "MAX_TICKS", &mut self.max_ticks)?;
        override_value(&get, "LEVERAGE", &mut self.leverage)?;
        override_value(&get, "REPLAY_BUYING_POWER", &mut self.replay_buying_power)?;

        if let Some(value) = get("BYPASS_STATIONARITY") {
            self.bypass_stationarity = value.to_lowercase() == "true";
        }
        if let Some(value) = get("ENTER_HEDGE") {
            self.enter_hedge = value.to_lowercase() == "true";
        }
        if let Some(value) = get("DRY_RUN") {
            self.dry_run = value.to_lowercase() == "true";
        }
        Ok(())
    }

    /// Rejects inconsistent settings before any data is fetched.
    pub fn validate(&self) -> EngineResult<()> {
        self.metric_params().validate()?;
        if self.start_date > self.end_date {
            return Err(EngineError::config(format!(
                "start_date {} is after end_date {}",
                self.start_date, self.end_date
            )));
        }
        if !(self.adf_p_threshold > 0.0 && self.adf_p_threshold < 1.0) {
            return Err(EngineError::config(format!(
                "adf_p_threshold must lie in (0, 1), got {}",
                self.adf_p_threshold
            )));
        }
        validate_thresholds(self.take_profit_pct, self.stop_loss_pct)?;
        if self.poll_interval_secs == 0 {
            return Err(EngineError::config("poll_interval_secs must be positive"));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(EngineError::config("fetch_timeout_secs must be positive"));
        }
        if self.leverage <= Decimal::ZERO {
            return Err(EngineError::config(format!(
                "leverage must be positive, got {}",
                self.leverage
            )));
        }
        if self.replay_buying_power < Decimal::ZERO {
            return Err(EngineError::config(format!(
                "replay_buying_power must not be negative, got {}",
                self.replay_buying_power
            )));
        }
        Ok(())
    }

    /// Candidate symbols, read from `tickers_file` when one is configured.
    pub fn resolve_symbols(&self) -> Result<Vec<String>> {
        match &self.tickers_file {
            Some(path) => read_tickers_from_file(path),
            None if self.symbols.is_empty() => {
                Err(anyhow!("no symbols configured: set SYMBOLS or TICKERS_FILE"))
            }
            None => Ok(self.symbols.clone()),
        }
    }

    pub fn metric_params(&self) -> MetricParams {
        MetricParams {
            hedge_window: self.hedge_window,
            corr_window: self.corr_window,
            zscore_fast: self.zscore_fast_window,
            zscore_slow: self.zscore_slow_window,
        }
    }

    pub fn screener(&self) -> AdfScreener {
        AdfScreener::new(
            self.adf_p_threshold,
            self.min_stationarity_samples,
            self.adf_max_lag,
        )
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            retries: self.fetch_retries,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Reads a comma separated ticker list; entries shorter than two characters are dropped.
pub fn read_tickers_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref)
        .with_context(|| format!("failed to read tickers file {}", path_ref.display()))?;
    let tickers = split_symbols(&body);
    if tickers.is_empty() {
        return Err(anyhow!("tickers file {} has no symbols", path_ref.display()));
    }
    Ok(tickers)
}

fn split_symbols(value: &str) -> Vec<String> {
    value
        .split(|c| c == ',' || c == '\n')
        .map(str::trim)
        .filter(|ticker| ticker.len() > 1)
        .map(str::to_string)
        .collect()
}

fn parse_date(key: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .with_context(|| format!("{} must be YYYY-MM-DD, got '{}'", key, value))
}

fn override_value<T, G>(get: &G, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(value) = get(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {} '{}': {}", key, value, e))?;
    }
    Ok(())
}

fn override_optional<T, G>(get: &G, key: &str, slot: &mut Option<T>) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(value) = get(key) {
        let parsed = value
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {} '{}': {}", key, value, e))?;
        *slot = Some(parsed);
    }
    Ok(())
}
