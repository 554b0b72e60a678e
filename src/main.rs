use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use pairlab::config::EngineConfig;
use pairlab::gateway::BrokerageGateway;
use pairlab::error::EngineError;
use pairlab::hedge::enter_hedge_position;
use pairlab::monitor::{CancelToken, RiskMonitor};
use pairlab::ports::csv_prices::CsvPriceAdapter;
use pairlab::ports::replay_gateway::ReplayGateway;
use pairlab::report::{LogReporter, Reporter};
use pairlab::selector::{PairSelector, SelectedPair};
use std::env;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

fn init_logging() -> Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .context("invalid TIMEZONE_OFFSET")?;
    let offset = FixedOffset::east_opt(offset_seconds)
        .ok_or_else(|| anyhow!("TIMEZONE_OFFSET out of range: {}", offset_seconds))?;
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();
    Ok(())
}

fn log_selection(selected: &SelectedPair) {
    for candidate in &selected.candidates {
        log::info!(
            "[SELECT] candidate {}/{} corr={:.4} {:?} p={}",
            candidate.symbol_a,
            candidate.symbol_b,
            candidate.rolling_correlation_latest,
            candidate.stationarity,
            candidate
                .p_value
                .map(|p| format!("{:.4}", p))
                .unwrap_or_else(|| "n/a".to_string())
        );
    }
    if let Some(row) = selected.metrics.rows.last() {
        match serde_json::to_string(row) {
            Ok(json) => log::info!("[SELECT] latest metrics {}", json),
            Err(e) => log::warn!("[SELECT] failed to serialize latest metrics: {}", e),
        }
    }
    log::info!(
        "[SELECT] {} hedge_ratio={:?} signal={:?}",
        selected.metrics.pair_label(),
        selected.metrics.latest_hedge_ratio(),
        selected.metrics.latest_signal()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    log::info!("Starting pairlab {}...", env!("CARGO_PKG_VERSION"));

    let cfg = EngineConfig::from_env_or_yaml()?;
    cfg.validate()?;
    let symbols = cfg.resolve_symbols()?;
    let price_file = cfg
        .price_file
        .as_ref()
        .ok_or_else(|| anyhow!("PRICE_FILE is required"))?;
    let adapter = CsvPriceAdapter::open(price_file)?;
    let reporter: Arc<dyn Reporter> = Arc::new(LogReporter);

    let selector = PairSelector::new(
        Arc::new(adapter),
        Arc::new(cfg.screener()),
        reporter.clone(),
        cfg.metric_params(),
        cfg.start_date,
        cfg.end_date,
    )
    .with_fetch_policy(cfg.fetch_policy());

    let selected = match selector
        .select_best_pair(&symbols, cfg.bypass_stationarity)
        .await
    {
        Ok(selected) => selected,
        Err(err @ EngineError::NoSuitablePairs { .. }) => {
            log::warn!("[SELECT] {}; set BYPASS_STATIONARITY=true to take the top pair", err);
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };
    log_selection(&selected);

    let Some(positions_file) = cfg.positions_file.as_ref() else {
        log::info!("No POSITIONS_FILE configured; skipping hedge entry and risk monitor");
        return Ok(());
    };
    let gateway =
        Arc::new(ReplayGateway::new(positions_file)?.with_buying_power(cfg.replay_buying_power));
    match gateway.buying_power().await {
        Ok(buying_power) => log::info!("[Startup] buying power: {}", buying_power),
        Err(e) => log::warn!("[Startup] failed to read buying power: {}", e),
    }

    if cfg.enter_hedge {
        let hedge_ratio = selected
            .metrics
            .latest_hedge_ratio()
            .ok_or_else(|| anyhow!("no hedge ratio for {}", selected.metrics.pair_label()))?;
        if cfg.dry_run {
            log::info!(
                "[HEDGE] DRY RUN: would {} {} {} against {} with hedge ratio {:.4}",
                cfg.hedge_side,
                cfg.leverage,
                selected.symbol_a,
                selected.symbol_b,
                hedge_ratio
            );
        } else {
            let fills = enter_hedge_position(
                gateway.as_ref(),
                reporter.as_ref(),
                &selected.symbol_a,
                &selected.symbol_b,
                cfg.hedge_side,
                hedge_ratio,
                cfg.leverage,
            )
            .await?;
            if !fills.is_complete() {
                log::warn!(
                    "[HEDGE] entry incomplete; monitoring the open {} leg",
                    fills.leg_a.symbol
                );
            }
        }
    }

    let cancel = CancelToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[MONITOR] Ctrl-C received, stopping after the current tick");
            ctrl_c_token.cancel();
        }
    });

    let mut monitor = RiskMonitor::new(gateway, reporter)
        .with_cancel_token(cancel)
        .with_poll_interval(cfg.poll_interval())
        .with_max_ticks(cfg.max_ticks);
    monitor.start(cfg.take_profit_pct, cfg.stop_loss_pct)?;
    let outcome = monitor.run().await?;
    log::info!(
        "[MONITOR] finished: {:?} after {} ticks (last profit {:?}%, liquidation {:?})",
        outcome.reason,
        outcome.ticks,
        outcome.last_profit_pct,
        outcome.liquidation
    );
    Ok(())
}
