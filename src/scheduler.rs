// =============================================================================
// Scheduler — main loop, hot reload, bounded fan-out, console dashboard
// =============================================================================
//
// Each tick: poll the config file for symbol-set changes, run the global risk
// manager, fan out every symbol trader through a semaphore (individual
// failures land in the result set, never propagate), render the dashboard,
// and sleep whatever is left of the interval.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::advisor::AdvisorClient;
use crate::config::Config;
use crate::notify::Notifier;
use crate::okx::Exchange;
use crate::plugin::PluginHost;
use crate::risk::{GlobalRiskManager, RiskVerdict};
use crate::trader::{SharedTrader, SymbolTrader, TickResult};

// =============================================================================
// CJK-width-aware column rendering
// =============================================================================

/// Terminal display width of one char: CJK and emoji occupy two cells.
fn char_width(c: char) -> usize {
    let cp = c as u32;
    let wide = matches!(
        cp,
        0x1100..=0x115F          // Hangul Jamo
        | 0x2E80..=0xA4CF        // CJK radicals .. Yi
        | 0xAC00..=0xD7A3        // Hangul syllables
        | 0xF900..=0xFAFF        // CJK compatibility ideographs
        | 0xFE30..=0xFE4F        // CJK compatibility forms
        | 0xFF00..=0xFF60        // fullwidth forms
        | 0xFFE0..=0xFFE6
        | 0x1F300..=0x1FAFF      // emoji
        | 0x20000..=0x3FFFD      // CJK extensions
    );
    if wide {
        2
    } else {
        1
    }
}

pub fn display_width(s: &str) -> usize {
    s.chars().map(char_width).sum()
}

/// Pad (or truncate) to `width` display cells.
pub fn pad_cell(s: &str, width: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for c in s.chars() {
        let w = char_width(c);
        if used + w > width {
            break;
        }
        out.push(c);
        used += w;
    }
    while used < width {
        out.push(' ');
        used += 1;
    }
    out
}

// =============================================================================
// Scheduler
// =============================================================================

pub struct Scheduler {
    config_path: PathBuf,
    config: Config,
    data_dir: PathBuf,

    exchange: Arc<dyn Exchange>,
    advisor: Arc<AdvisorClient>,
    notifier: Arc<Notifier>,

    traders: Vec<SharedTrader>,
    risk: GlobalRiskManager,
    pub plugins: PluginHost,
    active_symbols: Arc<AtomicUsize>,

    last_config_mtime: Option<SystemTime>,
}

impl Scheduler {
    pub async fn bootstrap(
        config_path: PathBuf,
        config: Config,
        exchange: Arc<dyn Exchange>,
        advisor: Arc<AdvisorClient>,
        notifier: Arc<Notifier>,
        data_dir: PathBuf,
    ) -> Result<Self> {
        let active_symbols = Arc::new(AtomicUsize::new(config.symbols.len()));
        let mut risk = GlobalRiskManager::new(
            exchange.clone(),
            config.trading.risk_control.clone(),
            notifier.clone(),
            &data_dir,
        );

        let mut traders = Vec::with_capacity(config.symbols.len());
        for sym_cfg in &config.symbols {
            let mut trader = SymbolTrader::new(
                sym_cfg,
                &config.trading,
                exchange.clone(),
                advisor.clone(),
                notifier.clone(),
                active_symbols.clone(),
                &data_dir,
            )
            .await
            .with_context(|| format!("failed to build trader for {}", sym_cfg.symbol))?;
            trader.initialize().await?;

            let shared = SharedTrader::new(trader);
            risk.register(Arc::new(shared.clone()));
            traders.push(shared);
        }

        let last_config_mtime = Config::mtime(&config_path);

        Ok(Self {
            config_path,
            config,
            data_dir,
            exchange,
            advisor,
            notifier,
            traders,
            risk,
            plugins: PluginHost::new(),
            active_symbols,
            last_config_mtime,
        })
    }

    /// Concurrent pipeline prewarm before the first tick.
    pub async fn prewarm(&self) {
        info!("prewarming market data");
        let tasks = self.traders.iter().map(|t| {
            let inner = t.inner.clone();
            async move {
                let trader = inner.lock().await;
                trader.prewarm().await;
            }
        });
        join_all(tasks).await;
        info!("prewarm complete");
    }

    /// Main loop. Returns the process exit code.
    pub async fn run(&mut self) -> i32 {
        let interval = self.config.trading.loop_interval.clamp(1, 60);
        info!(interval, symbols = self.traders.len(), "entering main loop");

        loop {
            let started = std::time::Instant::now();

            // 1. Hot reload.
            if let Err(e) = self.check_hot_reload().await {
                warn!(error = %e, "hot reload failed, keeping previous config");
            }

            // 2. Global risk.
            let verdict = self.risk.check().await;
            match &verdict {
                RiskVerdict::Terminate(reason) => {
                    error!(reason = %reason, "risk-triggered shutdown");
                    return 0;
                }
                RiskVerdict::Stopped(reason) => {
                    error!(reason = %reason, "CRITICAL: openings stopped by global risk");
                }
                RiskVerdict::Normal => {}
            }

            // 3. Bounded fan-out over all symbol traders.
            let risk_factor = self.risk.risk_factor();
            let semaphore = Arc::new(Semaphore::new(
                self.config.trading.max_concurrent_traders.max(1),
            ));
            let tasks = self.traders.iter().map(|t| {
                let inner = t.inner.clone();
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    let mut trader = inner.lock().await;
                    trader.run_tick(risk_factor).await
                }
            });
            let results: Vec<TickResult> = join_all(tasks).await;

            // 4. Dashboard + plugin fan-out.
            self.render_dashboard(&results);
            for result in &results {
                self.plugins.emit_tick(result);
            }

            // 5. Sleep the remainder of the interval.
            let elapsed = started.elapsed().as_secs();
            let sleep_secs = interval.saturating_sub(elapsed).max(1);
            tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)).await;
        }
    }

    /// Flush state and notify listeners on shutdown.
    pub async fn shutdown(&self) {
        self.plugins.emit_shutdown();
        self.notifier.send("shutdown", "engine stopped cleanly").await;
        info!("scheduler shut down");
    }

    // -------------------------------------------------------------------------
    // Hot reload
    // -------------------------------------------------------------------------

    async fn check_hot_reload(&mut self) -> Result<()> {
        let mtime = Config::mtime(&self.config_path);
        if mtime.is_none() || mtime == self.last_config_mtime {
            return Ok(());
        }

        let new_config = Config::load(&self.config_path)?;
        // Only advance the watermark after a successful parse so a broken
        // write is retried next tick.
        self.last_config_mtime = mtime;
        info!("config change detected, diffing symbol set");

        let old_symbols: Vec<String> = self.traders.iter().map(|t| {
            // SharedTrader caches its symbol at construction.
            crate::risk::TraderHandle::symbol(t)
        }).collect();
        let new_symbols: Vec<String> =
            new_config.symbols.iter().map(|s| s.symbol.clone()).collect();

        // Removed symbols: stop and unregister.
        let removed: Vec<String> = old_symbols
            .iter()
            .filter(|s| !new_symbols.contains(s))
            .cloned()
            .collect();
        for symbol in &removed {
            info!(symbol = %symbol, "symbol removed by hot reload");
            self.risk.unregister(symbol);
            self.traders
                .retain(|t| crate::risk::TraderHandle::symbol(t) != *symbol);
        }

        // Added symbols: instantiate and initialize.
        for sym_cfg in &new_config.symbols {
            if old_symbols.contains(&sym_cfg.symbol) {
                continue;
            }
            info!(symbol = %sym_cfg.symbol, "symbol added by hot reload");
            match SymbolTrader::new(
                sym_cfg,
                &new_config.trading,
                self.exchange.clone(),
                self.advisor.clone(),
                self.notifier.clone(),
                self.active_symbols.clone(),
                &self.data_dir,
            )
            .await
            {
                Ok(mut trader) => {
                    if let Err(e) = trader.initialize().await {
                        warn!(symbol = %sym_cfg.symbol, error = %e, "new trader init failed");
                    }
                    if let Err(e) = self.exchange.load_markets(&[sym_cfg.symbol.clone()]).await {
                        warn!(symbol = %sym_cfg.symbol, error = %e, "market load failed");
                    }
                    let shared = SharedTrader::new(trader);
                    self.risk.register(Arc::new(shared.clone()));
                    self.traders.push(shared);
                }
                Err(e) => warn!(symbol = %sym_cfg.symbol, error = %e, "could not add trader"),
            }
        }

        // Surviving symbols: re-apply allocation/leverage in place.
        for sym_cfg in &new_config.symbols {
            if let Some(shared) = self
                .traders
                .iter()
                .find(|t| crate::risk::TraderHandle::symbol(*t) == sym_cfg.symbol)
            {
                let mut trader = shared.inner.lock().await;
                trader.apply_config_update(sym_cfg).await;
            }
        }

        self.active_symbols
            .store(new_config.symbols.len(), Ordering::Relaxed);
        self.config = new_config;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Dashboard
    // -------------------------------------------------------------------------

    fn render_dashboard(&self, results: &[TickResult]) {
        let mut lines = Vec::with_capacity(results.len() + 4);
        lines.push(format!("MARKET SCAN | {} symbols", results.len()));
        lines.push("─".repeat(120));
        lines.push(format!(
            "{} | {} | {} | {} | {} | {} | {}",
            pad_cell("SYMBOL", 14),
            pad_cell("PRICE", 12),
            pad_cell("24H%", 8),
            pad_cell("SIGNAL", 8),
            pad_cell("CONF", 8),
            pad_cell("EXECUTION", 14),
            "SUMMARY"
        ));
        lines.push("─".repeat(120));

        for r in results {
            let symbol_short = r.symbol.split(':').next().unwrap_or(&r.symbol);
            let price = if r.price > 0.0 {
                format!("${:.2}", r.price)
            } else {
                "-".to_string()
            };
            let change = format!("{:+.2}%", r.change_pct);
            lines.push(format!(
                "{} | {} | {} | {} | {} | {} | {}",
                pad_cell(symbol_short, 14),
                pad_cell(&price, 12),
                pad_cell(&change, 8),
                pad_cell(&r.signal, 8),
                pad_cell(&r.confidence, 8),
                pad_cell(&r.status.display_cell(), 14),
                r.summary
            ));
        }
        lines.push("─".repeat(120));
        info!("\n{}", lines.join("\n"));
    }
}
