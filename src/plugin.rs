// =============================================================================
// Plugin hooks — synchronous observer surface with per-listener isolation
// =============================================================================
//
// Listeners are invoked inline within the scheduler tick. A panicking
// listener is caught and logged; it never takes the tick down with it.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, warn};

use crate::trader::TickResult;
use crate::types::ExecStatus;

/// Observer interface. Default methods are no-ops so a plugin only implements
/// the hooks it cares about.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_tick(&self, _result: &TickResult) {}

    fn on_trade(&self, _symbol: &str, _status: &ExecStatus, _summary: &str) {}

    fn on_error(&self, _symbol: &str, _message: &str) {}

    fn on_shutdown(&self) {}
}

#[derive(Default)]
pub struct PluginHost {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    fn dispatch(&self, hook: &str, f: impl Fn(&dyn Plugin)) {
        for plugin in &self.plugins {
            let outcome = catch_unwind(AssertUnwindSafe(|| f(plugin.as_ref())));
            if outcome.is_err() {
                error!(plugin = plugin.name(), hook, "plugin panicked; isolated");
            }
        }
    }

    pub fn emit_tick(&self, result: &TickResult) {
        self.dispatch("on_tick", |p| p.on_tick(result));
        if result.status == ExecStatus::Executed {
            self.dispatch("on_trade", |p| {
                p.on_trade(&result.symbol, &result.status, &result.summary)
            });
        }
        if result.status == ExecStatus::Failed {
            self.dispatch("on_error", |p| p.on_error(&result.symbol, &result.summary));
        }
    }

    pub fn emit_shutdown(&self) {
        if !self.is_empty() {
            warn!(count = self.len(), "notifying plugins of shutdown");
        }
        self.dispatch("on_shutdown", |p| p.on_shutdown());
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketRegime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter {
        ticks: Arc<AtomicUsize>,
        trades: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Plugin for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn on_tick(&self, _r: &TickResult) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
        fn on_trade(&self, _s: &str, _st: &ExecStatus, _m: &str) {
            self.trades.fetch_add(1, Ordering::SeqCst);
        }
        fn on_shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Exploder;
    impl Plugin for Exploder {
        fn name(&self) -> &str {
            "exploder"
        }
        fn on_tick(&self, _r: &TickResult) {
            panic!("boom");
        }
    }

    fn result(status: ExecStatus) -> TickResult {
        TickResult {
            symbol: "ETH/USDT:USDT".into(),
            price: 100.0,
            change_pct: 0.0,
            signal: "BUY".into(),
            confidence: "HIGH".into(),
            status,
            summary: "test".into(),
            regime: MarketRegime::Normal,
            pattern: None,
        }
    }

    #[test]
    fn hooks_fire_on_matching_events() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let trades = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));

        let mut host = PluginHost::new();
        host.register(Box::new(Counter {
            ticks: ticks.clone(),
            trades: trades.clone(),
            shutdowns: shutdowns.clone(),
        }));

        host.emit_tick(&result(ExecStatus::Hold));
        host.emit_tick(&result(ExecStatus::Executed));
        host.emit_shutdown();

        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert_eq!(trades.load(Ordering::SeqCst), 1); // only the Executed tick
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_plugin_is_isolated() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut host = PluginHost::new();
        host.register(Box::new(Exploder));
        host.register(Box::new(Counter {
            ticks: ticks.clone(),
            trades: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }));

        // The exploder must not prevent the counter from seeing the tick.
        host.emit_tick(&result(ExecStatus::Hold));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}
