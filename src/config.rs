// =============================================================================
// Runtime Configuration
// =============================================================================
//
// Central configuration hub, grounded on the teacher's `RuntimeConfig`
// (serde-default fields, atomic tmp+rename persistence) generalized from
// strategy-filter toggles to this engine's env-sourced startup
// configuration and the Two-Key Live Safety mode-promotion rule.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::TradingMode;

fn default_ws_port() -> u16 {
    3010
}

fn default_trading_pair() -> String {
    "BTC/USD".to_string()
}

/// Normalizes a broker-facing pair like `BTC-USD` into the internal
/// canonical form `BTC/USD`.
pub fn canonicalize_pair(raw: &str) -> String {
    raw.replace('-', "/")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,

    #[serde(default = "default_trading_pair")]
    pub trading_pair: String,

    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    #[serde(default)]
    pub api_port: Option<u16>,

    #[serde(default)]
    pub polygon_api_key: Option<String>,

    #[serde(default)]
    pub websocket_auth_token: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paper,
            trading_pair: default_trading_pair(),
            ws_port: default_ws_port(),
            api_port: None,
            polygon_api_key: None,
            websocket_auth_token: None,
        }
    }
}

impl RuntimeConfig {
    /// Build configuration from the process environment, applying the
    /// Two-Key Live Safety rule: promotion to `LIVE` requires both
    /// `ENABLE_LIVE_TRADING` and `CONFIRM_LIVE_TRADING` to be `true`;
    /// otherwise the engine falls back to `PAPER` regardless of
    /// `TRADING_MODE`.
    pub fn from_env() -> Self {
        let requested_mode = match std::env::var("TRADING_MODE").as_deref() {
            Ok("LIVE") => TradingMode::Live,
            Ok("BACKTEST") => TradingMode::Backtest,
            _ => TradingMode::Paper,
        };

        let trading_mode = if requested_mode == TradingMode::Live {
            if two_key_live_safety_satisfied() {
                TradingMode::Live
            } else {
                warn!("TRADING_MODE=LIVE requested but ENABLE_LIVE_TRADING/CONFIRM_LIVE_TRADING gate not satisfied — falling back to PAPER");
                TradingMode::Paper
            }
        } else {
            requested_mode
        };

        let trading_pair = std::env::var("TRADING_PAIR")
            .map(|raw| canonicalize_pair(&raw))
            .unwrap_or_else(|_| default_trading_pair());

        let ws_port = std::env::var("WS_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_ws_port);

        let api_port = std::env::var("API_PORT").ok().and_then(|v| v.parse().ok());

        Self {
            trading_mode,
            trading_pair,
            ws_port,
            api_port,
            polygon_api_key: std::env::var("POLYGON_API_KEY").ok(),
            websocket_auth_token: std::env::var("WEBSOCKET_AUTH_TOKEN").ok(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), trading_mode = %config.trading_mode, "runtime config loaded");
        Ok(config)
    }

    /// Atomic write: write to a temporary sibling file, then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialize runtime config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content).with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path).with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

fn env_flag_true(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

fn two_key_live_safety_satisfied() -> bool {
    env_flag_true("ENABLE_LIVE_TRADING") && env_flag_true("CONFIRM_LIVE_TRADING")
}

/// Renders the startup banner text for live-mode activation. The actual
/// 10-second countdown sleep is performed by the caller (`main`) so this
/// stays synchronous and unit-testable.
pub fn live_mode_banner(trading_pair: &str) -> String {
    format!(
        "\n\
         ################################################################\n\
         #  LIVE TRADING MODE ACTIVE — real orders will be submitted   #\n\
         #  pair: {trading_pair:<54}#\n\
         #  Two-Key Live Safety satisfied (ENABLE_LIVE_TRADING +        #\n\
         #  CONFIRM_LIVE_TRADING). Starting in 10 seconds...            #\n\
         ################################################################\n"
    )
}

pub const LIVE_MODE_COUNTDOWN_SECS: u64 = 10;
