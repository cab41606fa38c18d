//! Configuration for the quoting engine.
//!
//! Supports loading from a TOML file with environment variable overrides
//! for credentials and CLI overrides for the runtime switches.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use quoter_common::StoreConfig;

/// Top-level configuration for the quoting engine.
#[derive(Debug, Clone)]
pub struct QuoterConfig {
    /// Token IDs to quote.
    pub assets: Vec<String>,
    /// Static market metadata keyed off the asset list.
    pub markets: Vec<MarketEntry>,
    /// Logging level.
    pub log_level: String,
    /// Log side-effectful calls instead of sending them.
    pub dry_run: bool,
    /// Run the quote cycle but never enqueue placements.
    pub detect_only: bool,

    /// Quote pricing and hysteresis.
    pub quoting: QuotingConfig,
    /// Momentum detection.
    pub momentum: MomentumConfig,
    /// Inventory limits.
    pub inventory: InventoryConfig,
    /// Risk and circuit breaker.
    pub risk: RiskConfig,
    /// Order placement and cadence.
    pub orders: OrdersConfig,
    /// WebSocket endpoints and reconnect policy.
    pub websocket: WebSocketConfig,
    /// Exchange REST endpoint.
    pub rest_url: String,
    /// State store.
    pub store: StoreSettings,
    /// API credentials (env only, never in the TOML file).
    pub credentials: Credentials,
}

/// Static metadata for one market token.
#[derive(Debug, Clone)]
pub struct MarketEntry {
    /// Token ID.
    pub token_id: String,
    /// The complementary token of the binary pair, if known.
    pub pair_token_id: Option<String>,
    /// Human-readable label for logs.
    pub label: Option<String>,
    /// When the market resolves; drives wind-down.
    pub end_time: Option<DateTime<Utc>>,
}

/// Quote pricing and refresh control.
#[derive(Debug, Clone)]
pub struct QuotingConfig {
    /// Nominal per-side size in shares.
    pub order_size: Decimal,
    /// Improve both sides by one tick when the spread is at least this
    /// many ticks.
    pub improve_when_spread_ticks: u32,
    /// Inventory skew coefficient: skew ticks = round(coef × inventory).
    pub skew_coefficient: Decimal,
    /// Only replace when a side deviates by at least this many ticks.
    pub refresh_threshold_ticks: u32,
    /// Per-market minimum interval between replacements.
    pub min_refresh_interval_ms: u64,
    /// Global replacement rate cap.
    pub global_refresh_cap_per_sec: u32,
}

/// Momentum detection parameters.
#[derive(Debug, Clone)]
pub struct MomentumConfig {
    /// Arm when the price moves at least this many ticks...
    pub threshold_ticks: u32,
    /// ...within this window.
    pub window_ms: u64,
    /// Arm when one side loses at least this fraction of visible depth.
    pub sweep_depth_threshold: Decimal,
    /// Top-of-book levels counted as visible depth.
    pub depth_levels: usize,
    /// Cooldown duration after arming.
    pub cooldown_seconds: f64,
}

impl MomentumConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.cooldown_seconds * 1000.0) as i64)
    }
}

/// Inventory limits.
#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Hard long cap per market, in shares.
    pub max_position_per_market: Decimal,
    /// Worst-case loss cap per market (USDC).
    pub max_liability_per_market: Decimal,
    /// Worst-case loss cap across all markets (USDC).
    pub max_total_liability: Decimal,
    /// Pending fills age out after this many seconds.
    pub pending_fill_ttl_s: u64,
}

/// Risk and circuit breaker parameters.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Per-market drawdown halt (USDC).
    pub max_drawdown_per_market: Decimal,
    /// Global drawdown halt (USDC).
    pub max_drawdown_global: Decimal,
    /// Single-trade loss halt (USDC).
    pub max_loss_per_trade: Decimal,
    /// Consecutive errors before halting.
    pub max_consecutive_errors: u32,
    /// Errors per hour before halting.
    pub max_errors_per_hour: u32,
    /// HALTED -> RECOVERING cooldown.
    pub circuit_breaker_cooldown_s: u64,
    /// RECOVERING -> NORMAL interval without new faults.
    pub circuit_breaker_recovery_s: u64,
    /// Allow automatic recovery after cooldown.
    pub auto_recover: bool,
    /// Stay HALTED until an operator resets.
    pub require_manual_reset: bool,
    /// Feed is stale after this many seconds without an update.
    pub stale_feed_threshold_s: u64,
    /// Halt when WebSocket gaps cannot be reconciled.
    pub halt_on_ws_gaps: bool,
    /// Reconciliation attempts before a gap halts.
    pub ws_gap_reconcile_attempts: u32,
    /// Interval between recovery attempts while gap-halted.
    pub ws_gap_recovery_interval_s: u64,
}

/// Order placement and periodic task cadence.
#[derive(Debug, Clone)]
pub struct OrdersConfig {
    /// Maximum orders per batch request.
    pub batch_size: usize,
    /// Fee rates are cached this long.
    pub fee_cache_ttl_s: u64,
    /// REST request timeout.
    pub request_timeout_s: u64,
    /// Open-order reconciliation interval.
    pub reconcile_interval_s: u64,
    /// Authoritative position refresh interval.
    pub position_refresh_interval_s: u64,
    /// Stop buying and quote sell-only this long before market end.
    pub wind_down_start_s: u64,
}

impl OrdersConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }
}

/// WebSocket endpoints and reconnect policy.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Public market channel URL.
    pub market_url: String,
    /// Authenticated user channel URL.
    pub user_url: String,
    /// Application-level ping interval.
    pub ping_interval_s: u64,
    /// Connect timeout.
    pub connect_timeout_s: u64,
    /// Reconnect backoff upper bound.
    pub max_reconnect_delay_s: u64,
}

/// State store settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Persistence can be disabled for dry runs without a database.
    pub enabled: bool,
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl StoreSettings {
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            url: self.url.clone(),
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

/// API credentials, loaded from the environment only.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_passphrase: Option<String>,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some() && self.api_passphrase.is_some()
    }
}

impl Default for QuotingConfig {
    fn default() -> Self {
        Self {
            order_size: Decimal::new(10, 0),
            improve_when_spread_ticks: 4,
            skew_coefficient: Decimal::new(1, 1), // 0.1
            refresh_threshold_ticks: 2,
            min_refresh_interval_ms: 500,
            global_refresh_cap_per_sec: 10,
        }
    }
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            threshold_ticks: 3,
            window_ms: 500,
            sweep_depth_threshold: Decimal::new(5, 1), // 0.5
            depth_levels: 5,
            cooldown_seconds: 2.0,
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            max_position_per_market: Decimal::new(100, 0),
            max_liability_per_market: Decimal::new(50, 0),
            max_total_liability: Decimal::new(500, 0),
            pending_fill_ttl_s: 30,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_per_market: Decimal::new(20, 0),
            max_drawdown_global: Decimal::new(100, 0),
            max_loss_per_trade: Decimal::new(10, 0),
            max_consecutive_errors: 5,
            max_errors_per_hour: 60,
            circuit_breaker_cooldown_s: 300,
            circuit_breaker_recovery_s: 60,
            auto_recover: true,
            require_manual_reset: false,
            stale_feed_threshold_s: 10,
            halt_on_ws_gaps: true,
            ws_gap_reconcile_attempts: 3,
            ws_gap_recovery_interval_s: 30,
        }
    }
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            batch_size: 15,
            fee_cache_ttl_s: 300,
            request_timeout_s: 10,
            reconcile_interval_s: 60,
            position_refresh_interval_s: 30,
            wind_down_start_s: 300,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            market_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            user_url: "wss://ws-subscriptions-clob.polymarket.com/ws/user".to_string(),
            ping_interval_s: 5,
            connect_timeout_s: 10,
            max_reconnect_delay_s: 60,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://localhost:8123".to_string(),
            database: "quoter".to_string(),
            user: None,
            password: None,
        }
    }
}

impl Default for QuoterConfig {
    fn default() -> Self {
        Self {
            assets: Vec::new(),
            markets: Vec::new(),
            log_level: "info".to_string(),
            dry_run: true,
            detect_only: false,
            quoting: QuotingConfig::default(),
            momentum: MomentumConfig::default(),
            inventory: InventoryConfig::default(),
            risk: RiskConfig::default(),
            orders: OrdersConfig::default(),
            websocket: WebSocketConfig::default(),
            rest_url: "https://clob.polymarket.com".to_string(),
            store: StoreSettings::default(),
            credentials: Credentials::default(),
        }
    }
}

impl QuoterConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides for sensitive values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("QUOTER_API_KEY") {
            self.credentials.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("QUOTER_API_SECRET") {
            self.credentials.api_secret = Some(secret);
        }
        if let Ok(pass) = std::env::var("QUOTER_API_PASSPHRASE") {
            self.credentials.api_passphrase = Some(pass);
        }
        if let Ok(url) = std::env::var("QUOTER_STORE_URL") {
            self.store.url = url;
        }
        if let Ok(user) = std::env::var("QUOTER_STORE_USER") {
            self.store.user = Some(user);
        }
        if let Ok(pass) = std::env::var("QUOTER_STORE_PASSWORD") {
            self.store.password = Some(pass);
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(
        &mut self,
        dry_run: bool,
        detect_only: bool,
        assets: Option<Vec<String>>,
        log_level: Option<String>,
    ) {
        if dry_run {
            self.dry_run = true;
        }
        if detect_only {
            self.detect_only = true;
        }
        if let Some(asset_list) = assets
            && !asset_list.is_empty()
        {
            self.assets = asset_list;
        }
        if let Some(level) = log_level {
            self.log_level = level;
        }
    }

    /// Look up market metadata for a token.
    pub fn market_entry(&self, token_id: &str) -> Option<&MarketEntry> {
        self.markets.iter().find(|m| m.token_id == token_id)
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.assets.is_empty() {
            bail!("At least one asset must be configured");
        }

        if !self.dry_run && !self.credentials.is_complete() {
            bail!(
                "Live mode requires QUOTER_API_KEY, QUOTER_API_SECRET and \
                 QUOTER_API_PASSPHRASE environment variables"
            );
        }

        // Quoting
        if self.quoting.order_size <= Decimal::ZERO {
            bail!("order_size must be positive");
        }
        if self.quoting.improve_when_spread_ticks < 1 {
            bail!("improve_when_spread_ticks must be >= 1");
        }
        if self.quoting.refresh_threshold_ticks < 1 {
            bail!("refresh_threshold_ticks must be >= 1");
        }
        if self.quoting.global_refresh_cap_per_sec < 1 {
            bail!("global_refresh_cap_per_sec must be >= 1");
        }
        if self.quoting.skew_coefficient < Decimal::ZERO {
            bail!("skew_coefficient must be >= 0");
        }

        // Momentum
        if self.momentum.threshold_ticks < 1 {
            bail!("momentum threshold_ticks must be >= 1");
        }
        if self.momentum.window_ms < 100 {
            bail!("momentum window_ms must be >= 100");
        }
        if self.momentum.sweep_depth_threshold <= Decimal::ZERO
            || self.momentum.sweep_depth_threshold > Decimal::ONE
        {
            bail!("sweep_depth_threshold must be in (0, 1]");
        }
        if self.momentum.cooldown_seconds < 0.0 {
            bail!("cooldown_seconds must be >= 0");
        }

        // Inventory
        if self.inventory.max_position_per_market <= Decimal::ZERO {
            bail!("max_position_per_market must be positive");
        }
        if self.inventory.max_liability_per_market <= Decimal::ZERO {
            bail!("max_liability_per_market must be positive");
        }
        if self.inventory.max_total_liability < self.inventory.max_liability_per_market {
            bail!("max_total_liability must be >= max_liability_per_market");
        }

        // Risk
        if self.risk.max_drawdown_per_market <= Decimal::ZERO {
            bail!("max_drawdown_per_market must be positive");
        }
        if self.risk.max_drawdown_global < self.risk.max_drawdown_per_market {
            bail!("max_drawdown_global must be >= max_drawdown_per_market");
        }
        if self.risk.max_consecutive_errors < 1 {
            bail!("max_consecutive_errors must be >= 1");
        }
        if self.risk.ws_gap_reconcile_attempts < 1 {
            bail!("ws_gap_reconcile_attempts must be >= 1");
        }
        if self.risk.stale_feed_threshold_s == 0 {
            bail!("stale_feed_threshold_s must be >= 1");
        }

        // Orders
        if !(1..=15).contains(&self.orders.batch_size) {
            bail!("batch_size must be between 1 and 15");
        }

        Ok(())
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    quoting: QuotingToml,
    #[serde(default)]
    momentum: MomentumToml,
    #[serde(default)]
    inventory: InventoryToml,
    #[serde(default)]
    risk: RiskToml,
    #[serde(default)]
    orders: OrdersToml,
    #[serde(default)]
    websocket: WebSocketToml,
    #[serde(default)]
    exchange: ExchangeToml,
    #[serde(default)]
    store: StoreToml,
    #[serde(default)]
    markets: Vec<MarketToml>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    assets: Vec<String>,
    log_level: String,
    dry_run: bool,
    detect_only: bool,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            assets: Vec::new(),
            log_level: "info".to_string(),
            dry_run: true,
            detect_only: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct QuotingToml {
    order_size: f64,
    improve_when_spread_ticks: u32,
    skew_coefficient: f64,
    refresh_threshold_ticks: u32,
    min_refresh_interval_ms: u64,
    global_refresh_cap_per_sec: u32,
}

impl Default for QuotingToml {
    fn default() -> Self {
        Self {
            order_size: 10.0,
            improve_when_spread_ticks: 4,
            skew_coefficient: 0.1,
            refresh_threshold_ticks: 2,
            min_refresh_interval_ms: 500,
            global_refresh_cap_per_sec: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MomentumToml {
    threshold_ticks: u32,
    window_ms: u64,
    sweep_depth_threshold: f64,
    depth_levels: usize,
    cooldown_seconds: f64,
}

impl Default for MomentumToml {
    fn default() -> Self {
        Self {
            threshold_ticks: 3,
            window_ms: 500,
            sweep_depth_threshold: 0.5,
            depth_levels: 5,
            cooldown_seconds: 2.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct InventoryToml {
    max_position_per_market: f64,
    max_liability_per_market: f64,
    max_total_liability: f64,
    pending_fill_ttl_s: u64,
}

impl Default for InventoryToml {
    fn default() -> Self {
        Self {
            max_position_per_market: 100.0,
            max_liability_per_market: 50.0,
            max_total_liability: 500.0,
            pending_fill_ttl_s: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RiskToml {
    max_drawdown_per_market: f64,
    max_drawdown_global: f64,
    max_loss_per_trade: f64,
    max_consecutive_errors: u32,
    max_errors_per_hour: u32,
    circuit_breaker_cooldown_s: u64,
    circuit_breaker_recovery_s: u64,
    auto_recover: bool,
    require_manual_reset: bool,
    stale_feed_threshold_s: u64,
    halt_on_ws_gaps: bool,
    ws_gap_reconcile_attempts: u32,
    ws_gap_recovery_interval_s: u64,
}

impl Default for RiskToml {
    fn default() -> Self {
        Self {
            max_drawdown_per_market: 20.0,
            max_drawdown_global: 100.0,
            max_loss_per_trade: 10.0,
            max_consecutive_errors: 5,
            max_errors_per_hour: 60,
            circuit_breaker_cooldown_s: 300,
            circuit_breaker_recovery_s: 60,
            auto_recover: true,
            require_manual_reset: false,
            stale_feed_threshold_s: 10,
            halt_on_ws_gaps: true,
            ws_gap_reconcile_attempts: 3,
            ws_gap_recovery_interval_s: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct OrdersToml {
    batch_size: usize,
    fee_cache_ttl_s: u64,
    request_timeout_s: u64,
    reconcile_interval_s: u64,
    position_refresh_interval_s: u64,
    wind_down_start_s: u64,
}

impl Default for OrdersToml {
    fn default() -> Self {
        Self {
            batch_size: 15,
            fee_cache_ttl_s: 300,
            request_timeout_s: 10,
            reconcile_interval_s: 60,
            position_refresh_interval_s: 30,
            wind_down_start_s: 300,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WebSocketToml {
    market_url: String,
    user_url: String,
    ping_interval_s: u64,
    connect_timeout_s: u64,
    max_reconnect_delay_s: u64,
}

impl Default for WebSocketToml {
    fn default() -> Self {
        let defaults = WebSocketConfig::default();
        Self {
            market_url: defaults.market_url,
            user_url: defaults.user_url,
            ping_interval_s: 5,
            connect_timeout_s: 10,
            max_reconnect_delay_s: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ExchangeToml {
    rest_url: String,
}

impl Default for ExchangeToml {
    fn default() -> Self {
        Self {
            rest_url: "https://clob.polymarket.com".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct StoreToml {
    enabled: bool,
    url: String,
    database: String,
}

impl Default for StoreToml {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://localhost:8123".to_string(),
            database: "quoter".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MarketToml {
    token_id: String,
    #[serde(default)]
    pair_token_id: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
}

/// Convert f64 to Decimal.
fn f64_to_decimal(val: f64) -> Decimal {
    Decimal::try_from(val).unwrap_or(Decimal::ZERO)
}

impl From<TomlConfig> for QuoterConfig {
    fn from(toml: TomlConfig) -> Self {
        Self {
            assets: toml.general.assets,
            markets: toml
                .markets
                .into_iter()
                .map(|m| MarketEntry {
                    token_id: m.token_id,
                    pair_token_id: m.pair_token_id,
                    label: m.label,
                    end_time: m.end_time,
                })
                .collect(),
            log_level: toml.general.log_level,
            dry_run: toml.general.dry_run,
            detect_only: toml.general.detect_only,
            quoting: QuotingConfig {
                order_size: f64_to_decimal(toml.quoting.order_size),
                improve_when_spread_ticks: toml.quoting.improve_when_spread_ticks,
                skew_coefficient: f64_to_decimal(toml.quoting.skew_coefficient),
                refresh_threshold_ticks: toml.quoting.refresh_threshold_ticks,
                min_refresh_interval_ms: toml.quoting.min_refresh_interval_ms,
                global_refresh_cap_per_sec: toml.quoting.global_refresh_cap_per_sec,
            },
            momentum: MomentumConfig {
                threshold_ticks: toml.momentum.threshold_ticks,
                window_ms: toml.momentum.window_ms,
                sweep_depth_threshold: f64_to_decimal(toml.momentum.sweep_depth_threshold),
                depth_levels: toml.momentum.depth_levels,
                cooldown_seconds: toml.momentum.cooldown_seconds,
            },
            inventory: InventoryConfig {
                max_position_per_market: f64_to_decimal(toml.inventory.max_position_per_market),
                max_liability_per_market: f64_to_decimal(toml.inventory.max_liability_per_market),
                max_total_liability: f64_to_decimal(toml.inventory.max_total_liability),
                pending_fill_ttl_s: toml.inventory.pending_fill_ttl_s,
            },
            risk: RiskConfig {
                max_drawdown_per_market: f64_to_decimal(toml.risk.max_drawdown_per_market),
                max_drawdown_global: f64_to_decimal(toml.risk.max_drawdown_global),
                max_loss_per_trade: f64_to_decimal(toml.risk.max_loss_per_trade),
                max_consecutive_errors: toml.risk.max_consecutive_errors,
                max_errors_per_hour: toml.risk.max_errors_per_hour,
                circuit_breaker_cooldown_s: toml.risk.circuit_breaker_cooldown_s,
                circuit_breaker_recovery_s: toml.risk.circuit_breaker_recovery_s,
                auto_recover: toml.risk.auto_recover,
                require_manual_reset: toml.risk.require_manual_reset,
                stale_feed_threshold_s: toml.risk.stale_feed_threshold_s,
                halt_on_ws_gaps: toml.risk.halt_on_ws_gaps,
                ws_gap_reconcile_attempts: toml.risk.ws_gap_reconcile_attempts,
                ws_gap_recovery_interval_s: toml.risk.ws_gap_recovery_interval_s,
            },
            orders: OrdersConfig {
                batch_size: toml.orders.batch_size,
                fee_cache_ttl_s: toml.orders.fee_cache_ttl_s,
                request_timeout_s: toml.orders.request_timeout_s,
                reconcile_interval_s: toml.orders.reconcile_interval_s,
                position_refresh_interval_s: toml.orders.position_refresh_interval_s,
                wind_down_start_s: toml.orders.wind_down_start_s,
            },
            websocket: WebSocketConfig {
                market_url: toml.websocket.market_url,
                user_url: toml.websocket.user_url,
                ping_interval_s: toml.websocket.ping_interval_s,
                connect_timeout_s: toml.websocket.connect_timeout_s,
                max_reconnect_delay_s: toml.websocket.max_reconnect_delay_s,
            },
            rest_url: toml.exchange.rest_url,
            store: StoreSettings {
                enabled: toml.store.enabled,
                url: toml.store.url,
                database: toml.store.database,
                user: None,
                password: None,
            },
            credentials: Credentials::default(), // Always from env vars
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn valid_config() -> QuoterConfig {
        let mut config = QuoterConfig::default();
        config.assets = vec!["token-up".to_string(), "token-down".to_string()];
        config
    }

    #[test]
    fn test_default_config() {
        let config = QuoterConfig::default();
        assert!(config.dry_run);
        assert!(!config.detect_only);
        assert_eq!(config.quoting.improve_when_spread_ticks, 4);
        assert_eq!(config.inventory.pending_fill_ttl_s, 30);
        assert_eq!(config.orders.fee_cache_ttl_s, 300);
        assert_eq!(config.risk.circuit_breaker_cooldown_s, 300);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [general]
            assets = ["tok-up", "tok-down"]
            log_level = "debug"
            dry_run = false

            [quoting]
            order_size = 25.0
            improve_when_spread_ticks = 6

            [inventory]
            max_position_per_market = 200.0

            [risk]
            max_consecutive_errors = 8

            [[markets]]
            token_id = "tok-up"
            pair_token_id = "tok-down"
            label = "BTC up"
        "#;

        let config = QuoterConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.assets.len(), 2);
        assert_eq!(config.log_level, "debug");
        assert!(!config.dry_run);
        assert_eq!(config.quoting.order_size, dec!(25));
        assert_eq!(config.quoting.improve_when_spread_ticks, 6);
        assert_eq!(config.inventory.max_position_per_market, dec!(200));
        assert_eq!(config.risk.max_consecutive_errors, 8);
        assert_eq!(
            config.market_entry("tok-up").unwrap().pair_token_id.as_deref(),
            Some("tok-down")
        );
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = valid_config();
        config.apply_cli_overrides(
            true,
            true,
            Some(vec!["other".to_string()]),
            Some("trace".to_string()),
        );

        assert!(config.dry_run);
        assert!(config.detect_only);
        assert_eq!(config.assets, vec!["other".to_string()]);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_cli_overrides_do_not_unset_dry_run() {
        let mut config = valid_config();
        config.dry_run = true;
        config.apply_cli_overrides(false, false, None, None);
        assert!(config.dry_run);
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_empty_assets() {
        let config = QuoterConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_live_requires_credentials() {
        let mut config = valid_config();
        config.dry_run = false;
        assert!(config.validate().is_err());

        config.credentials = Credentials {
            api_key: Some("k".to_string()),
            api_secret: Some("s".to_string()),
            api_passphrase: Some("p".to_string()),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bad_order_size() {
        let mut config = valid_config();
        config.quoting.order_size = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_sweep_threshold_bounds() {
        let mut config = valid_config();
        config.momentum.sweep_depth_threshold = dec!(1.5);
        assert!(config.validate().is_err());

        config.momentum.sweep_depth_threshold = dec!(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_liability_ordering() {
        let mut config = valid_config();
        config.inventory.max_total_liability = dec!(10);
        config.inventory.max_liability_per_market = dec!(50);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_batch_size_bounds() {
        let mut config = valid_config();
        config.orders.batch_size = 16;
        assert!(config.validate().is_err());
        config.orders.batch_size = 0;
        assert!(config.validate().is_err());
        config.orders.batch_size = 15;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_drawdown_ordering() {
        let mut config = valid_config();
        config.risk.max_drawdown_global = dec!(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_momentum_cooldown_duration() {
        let config = MomentumConfig::default();
        assert_eq!(config.cooldown(), chrono::Duration::seconds(2));
    }

    #[test]
    fn test_store_settings_conversion() {
        let settings = StoreSettings::default();
        let store_config = settings.to_store_config();
        assert_eq!(store_config.database, "quoter");
    }
}
