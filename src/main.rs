// =============================================================================
// Oracle Bot — AI-advised multi-symbol trading engine for OKX
// =============================================================================
//
// One-shot daemon: load config, wire the exchange/advisor/notifier, build a
// trader per symbol, then hand control to the scheduler until SIGINT or a
// risk-triggered stop. Exit code 0 covers both the clean shutdown and the
// global stop/take-profit path; fatal init errors exit nonzero.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod advisor;
mod config;
mod error;
mod market;
mod notify;
mod okx;
mod plugin;
mod risk;
mod scheduler;
mod signal;
mod store;
mod trader;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::advisor::AdvisorClient;
use crate::config::Config;
use crate::notify::Notifier;
use crate::okx::{Exchange, OkxClient};
use crate::scheduler::Scheduler;

const BANNER: &str = r#"
   ____                  __        ____        __
  / __ \_________ ______/ /__     / __ )____  / /_
 / / / / ___/ __ `/ ___/ / _ \   / __  / __ \/ __/
/ /_/ / /  / /_/ / /__/ /  __/  / /_/ / /_/ / /_
\____/_/   \__,_/\___/_/\___/  /_____/\____/\__/

  AI trading engine | OKX derivatives & spot
"#;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let _ = dotenv::dotenv();

    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("{BANNER}");

    // ── 1. Config ────────────────────────────────────────────────────────
    let config_path = PathBuf::from(
        std::env::var("ORACLE_CONFIG").unwrap_or_else(|_| "config.json".to_string()),
    );
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "config load failed");
            return 1;
        }
    };

    // ── 2. PID file ──────────────────────────────────────────────────────
    let pid_path = PathBuf::from("log/bot.pid");
    if let Err(e) = write_pid_file(&pid_path) {
        warn!(error = %e, "pid file write failed");
    }

    // ── 3. Clients ───────────────────────────────────────────────────────
    let okx = config.exchanges.okx.clone();
    let exchange: Arc<dyn Exchange> =
        Arc::new(OkxClient::new(okx.api_key, okx.secret, okx.password));

    let advisor = Arc::new(AdvisorClient::new(config.models.deepseek.clone()));
    let notifier = Arc::new(Notifier::new(config.notification.clone()));

    let symbols: Vec<String> = config.symbols.iter().map(|s| s.symbol.clone()).collect();
    if !config.trading.test_mode {
        if let Err(e) = exchange.load_markets(&symbols).await {
            error!(error = %e, "market metadata load failed");
            let _ = std::fs::remove_file(&pid_path);
            return 1;
        }
    } else if let Err(e) = exchange.load_markets(&symbols).await {
        // Test mode tolerates a missing venue; the simulator fills in.
        warn!(error = %e, "market metadata unavailable (test mode, continuing)");
    }

    // ── 4. System check ──────────────────────────────────────────────────
    let start_equity = system_check(&exchange, &advisor, &config).await;

    // ── 5. Scheduler ─────────────────────────────────────────────────────
    let mut scheduler = match Scheduler::bootstrap(
        config_path,
        config.clone(),
        exchange,
        advisor,
        notifier.clone(),
        PathBuf::from("data"),
    )
    .await
    {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "bootstrap failed");
            let _ = std::fs::remove_file(&pid_path);
            return 1;
        }
    };

    notifier
        .send(
            "startup",
            &format!(
                "engine started | mode: {} | equity: {:.2} USDT | symbols: {}",
                if config.trading.test_mode { "TEST" } else { "LIVE" },
                start_equity,
                config.symbols.len()
            ),
        )
        .await;

    scheduler.prewarm().await;

    // ── 6. Run until SIGINT or risk-triggered stop ───────────────────────
    let exit_code = tokio::select! {
        code = scheduler.run() => code,
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping gracefully");
            0
        }
    };

    scheduler.shutdown().await;
    let _ = std::fs::remove_file(&pid_path);
    info!(exit_code, "engine stopped");
    exit_code
}

fn write_pid_file(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).context("failed to create log dir")?;
        }
    }
    std::fs::write(path, std::process::id().to_string()).context("failed to write pid file")?;
    Ok(())
}

/// Startup probe: account equity, unmanaged assets, advisor connectivity.
async fn system_check(
    exchange: &Arc<dyn Exchange>,
    advisor: &Arc<AdvisorClient>,
    config: &Config,
) -> f64 {
    let mut start_equity = 0.0;

    match exchange.fetch_balance().await {
        Ok(balance) => {
            start_equity = balance.total_equity;
            info!(
                equity = format!("{:.2}", balance.total_equity),
                avail = format!("{:.2}", balance.avail_usdt),
                "exchange connection OK"
            );

            // Flag assets the configured symbols do not cover.
            let managed: Vec<&str> = config
                .symbols
                .iter()
                .filter_map(|s| s.symbol.split('/').next())
                .collect();
            let unmanaged: Vec<String> = balance
                .details
                .iter()
                .filter(|a| a.ccy != "USDT" && !managed.contains(&a.ccy.as_str()) && a.total > 0.0)
                .map(|a| format!("{}({})", a.ccy, a.total))
                .collect();
            if !unmanaged.is_empty() {
                warn!(assets = ?unmanaged, "unmanaged assets present in the account");
            }
        }
        Err(e) => {
            if config.trading.test_mode {
                warn!(error = %e, "balance probe failed (test mode, continuing)");
            } else {
                error!(error = %e, "balance probe failed");
            }
        }
    }

    match advisor.ping().await {
        Ok(()) => info!("advisor connection OK"),
        Err(e) => warn!(error = %e, "advisor probe failed — analysis ticks will retry"),
    }

    start_equity
}
