// =============================================================================
// Confluence Core — Main Entry Point
// =============================================================================
//
// CLI dispatcher (`start | status | killswitch {on|off|status} | reconcile`)
// grounded on the teacher's `main.rs` bootstrap shape (dotenv + tracing init,
// shared `Arc<AppState>`, one `tokio::spawn` per subsystem loop, graceful
// shutdown on Ctrl+C) generalized from a single always-running engine to a
// small set of operator subcommands, per the hand-rolled `std::env::args()`
// argument parsing this project uses in place of a CLI-framework dependency.

mod aggregator;
mod app_state;
mod candle;
mod config;
mod decision;
mod errors;
mod execution;
mod indicators;
mod market_data;
mod pattern_memory;
mod position;
mod regime;
mod relay;
mod safety;
mod types;
mod vote;
mod voting;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::RuntimeConfig;
use crate::execution::PaperAdapter;
use crate::market_data::PolygonCandleProvider;
use crate::safety::lock::InstanceLock;
use crate::vote::Voter;

const BACKFILL_LOOKBACK_DAYS: u32 = 180;
const BACKFILL_INTER_REQUEST_DELAY: Duration = Duration::from_millis(250);

const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";
const PATTERN_MEMORY_PATH: &str = "pattern_memory.json";
const INSTANCE_LOCK_PATH: &str = "confluence-core.lock";
const KILL_SWITCH_FLAG_PATH: &str = "kill_switch.flag.json";
const KILL_SWITCH_AUDIT_LOG_PATH: &str = "kill_switch_audit.log";

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("start");

    match command {
        "start" => run_start().await,
        "status" => run_status(),
        "killswitch" => run_killswitch(args.get(1).map(String::as_str)),
        "reconcile" => run_reconcile().await,
        other => {
            eprintln!("unknown command '{other}'. usage: confluence-core <start|status|killswitch|reconcile>");
            std::process::exit(2);
        }
    }
}

async fn run_start() -> Result<()> {
    init_tracing();

    info!("================================================================");
    info!("  Confluence Core — Starting Up");
    info!("================================================================");

    let config = RuntimeConfig::from_env();

    if config.trading_mode == types::TradingMode::Live {
        println!("{}", config::live_mode_banner(&config.trading_pair));
        tokio::time::sleep(Duration::from_secs(config::LIVE_MODE_COUNTDOWN_SECS)).await;
    }

    let _instance_lock = InstanceLock::acquire(INSTANCE_LOCK_PATH)?;

    let state = AppState::new(
        config,
        PATTERN_MEMORY_PATH.into(),
        KILL_SWITCH_FLAG_PATH.into(),
        KILL_SWITCH_AUDIT_LOG_PATH.into(),
        Box::new(PaperAdapter),
    );

    info!(pair = %state.runtime_config.read().trading_pair, mode = %state.runtime_config.read().trading_mode, "engine configured");

    if let Some(api_key) = state.runtime_config.read().polygon_api_key.clone() {
        let trading_pair = state.runtime_config.read().trading_pair.clone();
        let backfill_state = state.clone();
        let backfill_result = tokio::task::spawn_blocking(move || {
            let provider = PolygonCandleProvider::new(api_key, trading_pair);
            backfill_state.aggregator.backfill(&provider, BACKFILL_LOOKBACK_DAYS, BACKFILL_INTER_REQUEST_DELAY);
        })
        .await;
        if let Err(err) = backfill_result {
            error!(error = %err, "backfill task panicked");
        }
    } else {
        warn!("POLYGON_API_KEY not set, starting with an empty history (live-only)");
    }

    // ── Event-loop health monitor ────────────────────────────────────────
    let health_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(250));
        loop {
            interval.tick().await;
            health_state.safety.check_loop_health(std::time::Instant::now());
        }
    });

    // ── Stale-feed watchdog ───────────────────────────────────────────────
    let feed_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            feed_state.safety.check_stale_feed(std::time::Instant::now());
        }
    });

    // ── Regime detection loop ────────────────────────────────────────────
    let regime_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            if let Some(snapshot) = regime_state.aggregator.snapshot(candle::Timeframe::M5) {
                let candles = snapshot.candles;
                if candles.len() >= candle::Timeframe::M5.min_indicator_length() {
                    regime_state.regime_detector.update(&candles, None, now_millis());
                    regime_state.increment_version();
                }
            }
        }
    });

    // ── Market-feed ingestion ─────────────────────────────────────────────
    // The concrete upstream wire format is out of scope; this loop polls the
    // same historical-bars interface used for backfill for the latest 1m bar
    // and feeds it through `ingest`, satisfying the "at least one thread
    // dedicated to market-feed ingestion" scheduling requirement without
    // inventing an exchange-specific streaming protocol.
    if let Some(api_key) = state.runtime_config.read().polygon_api_key.clone() {
        let trading_pair = state.runtime_config.read().trading_pair.clone();
        let ingest_state = state.clone();
        tokio::spawn(async move {
            let provider = PolygonCandleProvider::new(api_key, trading_pair);
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            let mut last_ts = None;
            loop {
                interval.tick().await;
                let provider_ref = &provider;
                let fetched = tokio::task::block_in_place(|| provider_ref.fetch(candle::Timeframe::M1, 1));
                match fetched {
                    Ok(bars) => {
                        for bar in bars {
                            if last_ts.map_or(true, |ts| bar.timestamp_millis > ts) {
                                ingest_state.aggregator.ingest(bar);
                                last_ts = Some(bar.timestamp_millis);
                                ingest_state.increment_version();
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "live candle poll failed"),
                }
            }
        });
    } else {
        warn!("POLYGON_API_KEY not set, market-feed ingestion loop is idle");
    }

    // ── Indicator ensemble / voting / decision pipeline ──────────────────
    // Per-timeframe indicator computation can parallelize, but the final
    // voting step must serialize — one task owns the voters and the brain.
    let decision_state = state.clone();
    tokio::spawn(async move {
        let mut ma_cross = voting::ma_cross::MaCrossoverVoter::new(voting::ma_cross::MaCrossConfig::default());
        let mut tpo = voting::tpo_voter::TpoVoter::new(voting::tpo_voter::TpoVoterConfig::default());
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            run_decision_cycle(&decision_state, &mut ma_cross, &mut tpo).await;
        }
    });

    // ── Position monitor ──────────────────────────────────────────────────
    // Marks open positions to the freshest price and closes any that have
    // crossed their stop-loss/take-profit level, feeding the outcome back
    // into pattern memory.
    let position_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            run_position_monitor_pass(&position_state).await;
        }
    });

    // ── Exchange reconciliation ──────────────────────────────────────────
    // Blocking pass on startup before anything else trades against stale
    // broker state, then every 30s thereafter per the safety fabric's
    // drift/hard-stop gate.
    run_reconciliation_pass(&state).await;
    let reconcile_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            run_reconciliation_pass(&reconcile_state).await;
        }
    });

    // ── Relay WebSocket server ───────────────────────────────────────────
    let relay_hub = state.relay.clone();
    let ws_port = state.runtime_config.read().ws_port;
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/ws", axum::routing::get(relay_ws_handler))
            .with_state(relay_hub);
        let bind_addr = format!("0.0.0.0:{ws_port}");
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "relay listening");
                if let Err(err) = axum::serve(listener, app).await {
                    error!(error = %err, "relay server failed");
                }
            }
            Err(err) => error!(error = %err, addr = %bind_addr, "failed to bind relay port"),
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    // Pattern memory persists atomically inside `PatternMemory::record` on
    // every exit, so there is nothing left to flush here.
    if let Err(err) = state.runtime_config.read().save(RUNTIME_CONFIG_PATH) {
        error!(error = %err, "failed to save runtime config on shutdown");
    }

    info!("confluence-core shut down complete");
    Ok(())
}

fn run_status() -> Result<()> {
    init_tracing();
    let config = RuntimeConfig::load(RUNTIME_CONFIG_PATH).unwrap_or_default();
    println!("trading_mode: {}", config.trading_mode);
    println!("trading_pair: {}", config.trading_pair);
    let flag_path = std::path::Path::new(KILL_SWITCH_FLAG_PATH);
    println!("kill_switch: {}", if flag_path.exists() { "ON" } else { "OFF" });
    Ok(())
}

fn run_killswitch(sub: Option<&str>) -> Result<()> {
    init_tracing();
    let kill_switch = safety::kill_switch::KillSwitch::new(KILL_SWITCH_FLAG_PATH, KILL_SWITCH_AUDIT_LOG_PATH);
    match sub {
        Some("on") => {
            kill_switch.activate("manual operator command")?;
            println!("kill switch activated");
        }
        Some("off") => {
            kill_switch.deactivate()?;
            println!("kill switch deactivated");
        }
        Some("status") | None => {
            println!("kill switch: {}", if kill_switch.is_on() { "ON" } else { "OFF" });
        }
        Some(other) => {
            eprintln!("unknown killswitch subcommand '{other}'. usage: confluence-core killswitch <on|off|status>");
            std::process::exit(2);
        }
    }
    Ok(())
}

async fn run_reconcile() -> Result<()> {
    init_tracing();
    let config = RuntimeConfig::from_env();
    let state = AppState::new(
        config,
        PATTERN_MEMORY_PATH.into(),
        KILL_SWITCH_FLAG_PATH.into(),
        KILL_SWITCH_AUDIT_LOG_PATH.into(),
        Box::new(PaperAdapter),
    );
    info!("forcing an immediate reconciliation pass");
    run_reconciliation_pass(&state).await;
    Ok(())
}

/// One pass of the indicator ensemble -> voting brain -> execution pipeline.
/// Runs on the M5 view; votes are gathered from every registered voter,
/// fused by the voting brain, and an actionable decision is routed through
/// the safety fabric and execution adapter before opening a position.
async fn run_decision_cycle(
    state: &Arc<AppState>,
    ma_cross: &mut voting::ma_cross::MaCrossoverVoter,
    tpo: &mut voting::tpo_voter::TpoVoter,
) {
    let Some(snapshot) = state.aggregator.snapshot(candle::Timeframe::M5) else {
        return;
    };
    if snapshot.candles.len() < candle::Timeframe::M5.min_indicator_length() {
        return;
    }

    let closes: Vec<f64> = snapshot.candles.iter().map(|c| c.close).collect();
    let entry_price = *closes.last().expect("non-empty closes checked above");

    let mut votes = ma_cross.update(&closes);
    votes.extend(tpo.update(&closes));
    votes.extend(state.regime_detector.get_votes());

    let bullish: f64 = votes.iter().filter(|v| v.direction == vote::Direction::Bullish).map(|v| v.strength).sum();
    let bearish: f64 = votes.iter().filter(|v| v.direction == vote::Direction::Bearish).map(|v| v.strength).sum();
    let prospective_direction = if bullish > bearish { "long" } else if bearish > bullish { "short" } else { "flat" };

    let regime_state = state.regime_detector.current();
    let regime_parameters = state.regime_detector.get_parameters(None);
    let regime_tag: &'static str = match regime_state.current {
        regime::Regime::TrendingUp => "trending_up",
        regime::Regime::TrendingDown => "trending_down",
        regime::Regime::Ranging => "ranging",
        regime::Regime::Volatile => "volatile",
        regime::Regime::Quiet => "quiet",
        regime::Regime::Breakout => "breakout",
        regime::Regime::Breakdown => "breakdown",
    };

    let buckets = pattern_memory::FeatureBuckets {
        rsi_bucket: snapshot.indicators.rsi.map(pattern_memory::bucket_rsi).unwrap_or(5),
        macd_bucket: snapshot.indicators.macd.as_ref().map(|m| pattern_memory::bucket_macd(m.histogram)).unwrap_or(0),
        trend_sign: regime_state.metrics.trend_direction.signum() as i8,
        volatility_bucket: pattern_memory::bucket_volatility(regime_state.metrics.volatility),
        volume_ratio_bucket: pattern_memory::bucket_volume_ratio(regime_state.metrics.volume_ratio),
        momentum_bucket: pattern_memory::bucket_momentum(regime_state.metrics.momentum),
        price_position_bucket: pattern_memory::bucket_price_position(regime_state.metrics.price_position),
        regime_tag,
        direction: prospective_direction,
    };
    let pattern_key = buckets.key();
    state.pattern_memory.observe(&pattern_key);

    let decision = state.voting_brain.write().evaluate(voting::VotingInputs {
        votes,
        regime_parameters,
        pattern_memory: &state.pattern_memory,
        active_pattern_keys: vec![pattern_key.clone()],
        entry_price,
        atr: snapshot.indicators.atr,
        macd_histogram: snapshot.indicators.macd.as_ref().map(|m| m.histogram),
        tpo_dynamic_stop: None,
        tpo_dynamic_target: None,
        fallback_stop_pct: 1.5,
        fallback_target_pct: 3.0,
    });
    state.increment_version();

    if decision.direction == decision::TradeDirection::Flat {
        return;
    }

    let trading_pair = state.runtime_config.read().trading_pair.clone();
    let side = match decision.direction {
        decision::TradeDirection::Long => safety::idempotency::OrderSide::Buy,
        decision::TradeDirection::Short => safety::idempotency::OrderSide::Sell,
        decision::TradeDirection::Flat => unreachable!("flat decisions return above"),
    };

    let intent = execution::OrderIntent {
        symbol: trading_pair.clone(),
        side,
        quantity: decision.size_multiplier,
        price: entry_price,
        timestamp_millis: now_millis(),
    };

    match state.execution.submit(&state.intent_cache, intent).await {
        Ok(result) if result.accepted => {
            state.position_manager.open_position(
                &trading_pair,
                decision.direction,
                result.fill_price.unwrap_or(entry_price),
                decision.size_multiplier,
                decision.stop_loss_price,
                decision.take_profit_price,
                Some(pattern_key),
            );
            info!(direction = ?decision.direction, confidence = decision.confidence, "position opened");
        }
        Ok(result) => warn!(error = ?result.error, "order not accepted"),
        Err(err) => warn!(error = %err, "order submission blocked"),
    }
}

/// Marks every open position to the freshest M1 close and closes out any
/// that crossed their stop-loss/take-profit level. The sole runtime path
/// that drives `PositionManager::close_position`, and so the sole path
/// that lets pattern memory learn from live trades.
async fn run_position_monitor_pass(state: &Arc<AppState>) {
    let Some(snapshot) = state.aggregator.snapshot(candle::Timeframe::M1) else {
        return;
    };
    let Some(latest) = snapshot.candles.last() else {
        return;
    };
    let trading_pair = state.runtime_config.read().trading_pair.clone();
    state.position_manager.update_price(&trading_pair, latest.close);

    for (id, reason) in state.position_manager.check_exits() {
        let pnl = state
            .position_manager
            .close_position(&id, reason, latest.close, now_millis(), &state.pattern_memory);
        if let Some(pnl) = pnl {
            state.increment_version();
            info!(id = %id, reason, pnl_pct = pnl, "position closed by monitor");
        }
    }
}

/// Compares the engine's locally tracked exposure against the broker's
/// reported position for the trading pair. A broker query failure is an
/// unknown remote, which the safety fabric treats as a hard stop.
async fn run_reconciliation_pass(state: &Arc<AppState>) {
    let trading_pair = state.runtime_config.read().trading_pair.clone();

    let local: f64 = state
        .position_manager
        .get_open_positions()
        .into_iter()
        .filter(|p| p.symbol == trading_pair)
        .map(|p| match p.direction {
            decision::TradeDirection::Long => p.quantity,
            decision::TradeDirection::Short => -p.quantity,
            decision::TradeDirection::Flat => 0.0,
        })
        .sum();

    let remote = match state.execution.positions().await {
        Ok(positions) => Some(positions.iter().find(|p| p.symbol == trading_pair).map(|p| p.qty).unwrap_or(0.0)),
        Err(err) => {
            warn!(error = %err, "reconciliation could not reach the broker");
            None
        }
    };

    let outcome = state.safety.reconcile(local, remote);
    state.increment_version();
    info!(local, ?remote, ?outcome, "reconciliation pass complete");
}

async fn relay_ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(hub): axum::extract::State<Arc<relay::RelayHub>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| relay::handle_connection(socket, hub))
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// End-to-end scenarios assembling a small in-process pipeline (voters ->
/// voting brain, with pattern memory and the safety fabric standing in for
/// the rest of the wiring `run_decision_cycle` does against real feed data).
/// The kill-switch-gate and stale-feed-pause-and-recovery scenarios are
/// already exercised as unit tests in `safety::tests` and `execution::tests`
/// directly against the real gate order and intent cache; these cover the
/// three scenarios that need the voting brain and pattern memory wired
/// together.
#[cfg(test)]
mod scenario_tests {
    use crate::decision::TradeDirection;
    use crate::pattern_memory::PatternMemory;
    use crate::regime::IndicatorWeights;
    use crate::regime::RegimeParameters;
    use crate::vote::{Direction, Vote};
    use crate::voting::ma_cross::{MaCrossConfig, MaCrossoverVoter};
    use crate::voting::{VotingBrain, VotingInputs};
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_pattern_memory() -> PatternMemory {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!("confluence-core-scenario-test-{n}.json"));
        PatternMemory::new(path)
    }

    fn neutral_params(confidence_threshold: f64, risk_multiplier: f64) -> RegimeParameters {
        RegimeParameters {
            risk_multiplier,
            confidence_threshold,
            stop_loss_multiplier: 1.5,
            take_profit_multiplier: 3.0,
            indicator_weights: IndicatorWeights {
                trend: 0.25,
                momentum: 0.25,
                volume: 0.25,
                volatility: 0.25,
            },
        }
    }

    /// Scenario 1 — golden-cross triggered long. A long rising close series
    /// drives an EMA golden cross; with TPO neutral (no TPO votes mixed in)
    /// and an empty pattern memory, the brain should go long with
    /// ATR-derived stops below the entry price.
    #[test]
    fn golden_cross_triggers_long_with_atr_stops() {
        let memory = temp_pattern_memory();
        let closes: Vec<f64> = (1..=250).map(|i| i as f64).collect();
        let entry_price = *closes.last().unwrap();

        let mut ma_cross = MaCrossoverVoter::new(MaCrossConfig::default());
        let votes = ma_cross.update(&closes);
        assert!(votes.iter().any(|v| v.direction == Direction::Bullish), "expected a bullish cross vote");

        let mut brain = VotingBrain::new();
        let decision = brain.evaluate(VotingInputs {
            votes,
            regime_parameters: neutral_params(0.05, 1.0),
            pattern_memory: &memory,
            active_pattern_keys: vec![],
            entry_price,
            atr: Some(2.0),
            macd_histogram: None,
            tpo_dynamic_stop: None,
            tpo_dynamic_target: None,
            fallback_stop_pct: 1.5,
            fallback_target_pct: 3.0,
        });

        assert_eq!(decision.direction, TradeDirection::Long);
        assert_eq!(decision.stop_loss_price, Some(entry_price - 2.0 * 1.5));
        assert_eq!(decision.take_profit_price, Some(entry_price + 2.0 * 3.0));
    }

    /// Scenario 2 — snapback short after blowoff. A pair that blew off and
    /// then entered the snapback zone emits a mean-reversion vote opposite
    /// the prior spread plus a negative blowoff vote against the exhausted
    /// direction; both are bearish here, so the brain should flip to short
    /// even though nothing outright bullish ever fired.
    #[test]
    fn snapback_and_blowoff_votes_produce_short() {
        let memory = temp_pattern_memory();
        let votes = vec![
            Vote::new("MA_SNAPBACK:bearish", Direction::Bearish, 0.24),
            Vote::new("MA_BLOWOFF:against", Direction::Bearish, 0.15),
        ];

        let mut brain = VotingBrain::new();
        let decision = brain.evaluate(VotingInputs {
            votes,
            regime_parameters: neutral_params(0.1, 1.0),
            pattern_memory: &memory,
            active_pattern_keys: vec![],
            entry_price: 100.0,
            atr: Some(1.5),
            macd_histogram: None,
            tpo_dynamic_stop: None,
            tpo_dynamic_target: None,
            fallback_stop_pct: 1.0,
            fallback_target_pct: 2.0,
        });

        assert_eq!(decision.direction, TradeDirection::Short);
        assert!((decision.confidence - 0.39).abs() < 1e-9);
        assert!(decision.size_multiplier <= 0.5, "neutral pattern over a volatile regime should not size up");
    }

    /// Scenario 3 — pattern elite boost. A feature key with 12 evaluations,
    /// a 0.75 win rate and a ~1.6% average PnL crosses the elite thresholds
    /// and pushes the composite score's size multiplier to 1.5x, on top of
    /// an otherwise identical golden-cross setup to scenario 1.
    #[test]
    fn elite_pattern_boosts_size_multiplier() {
        let memory = temp_pattern_memory();
        for _ in 0..12 {
            memory.observe("k");
        }
        for _ in 0..9 {
            memory.record("k", 3.0, 0).unwrap();
        }
        for _ in 0..3 {
            memory.record("k", -2.5, 0).unwrap();
        }
        assert!(memory.is_elite("k"));

        let closes: Vec<f64> = (1..=250).map(|i| i as f64).collect();
        let entry_price = *closes.last().unwrap();
        let mut ma_cross = MaCrossoverVoter::new(MaCrossConfig::default());
        let votes = ma_cross.update(&closes);

        let mut brain = VotingBrain::new();
        let decision = brain.evaluate(VotingInputs {
            votes,
            regime_parameters: neutral_params(0.05, 1.0),
            pattern_memory: &memory,
            active_pattern_keys: vec!["k".to_string()],
            entry_price,
            atr: Some(2.0),
            macd_histogram: None,
            tpo_dynamic_stop: None,
            tpo_dynamic_target: None,
            fallback_stop_pct: 1.5,
            fallback_target_pct: 3.0,
        });

        assert_eq!(decision.direction, TradeDirection::Long);
        assert_eq!(decision.size_multiplier, 1.5);
    }
}
