//! Order placement, cancellation, and rate control.
//!
//! Translates quote decisions into exchange requests:
//!
//! - Fee rates are fetched per asset and cached with a TTL; the rate is
//!   part of the signed payload, so a fetch failure skips the asset for
//!   the cycle.
//! - Every order is post-only.
//! - Placements are staged during a cycle and flushed in batches of up
//!   to the configured size, grouped across assets.
//! - Cancels go out individually for immediacy. Cancelling does not
//!   clear BUY reservations; only a terminal confirmation does.
//! - Replacement cadence is bounded per market and globally via a token
//!   bucket.
//! - In dry-run mode every side-effectful call is logged, not sent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quoter_common::Side;
use quoter_exchange::rest::{ExchangeClient, ExchangeError};
use quoter_exchange::types::PlaceOrderRequest;

use crate::config::QuoterConfig;
use crate::types::{Order, OrderStatus, Quote};

/// Errors from order management.
#[derive(Debug, Error)]
pub enum OrderManagerError {
    /// Fee fetch failed; skip the asset for this cycle.
    #[error("fee fetch failed: {0}")]
    FeeFetchFailed(String),

    /// Placement rejected by the exchange.
    #[error("placement rejected: {0}")]
    PlacementRejected(String),

    /// Post-only order would have crossed; recompute next tick.
    #[error("post-only order would cross")]
    PostOnlyCross,

    /// Risk state forbids placements.
    #[error("placements halted")]
    Halted,

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Result of one staged placement after a flush.
#[derive(Debug)]
pub struct PlacementResult {
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub outcome: Result<Order, OrderManagerError>,
}

/// Token bucket for the global replacement cap.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_sec: u32) -> Self {
        Self {
            capacity: per_sec as f64,
            tokens: per_sec as f64,
            refill_per_sec: per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Order placement and cancellation front-end.
pub struct OrderManager {
    client: Arc<ExchangeClient>,
    batch_size: usize,
    fee_ttl: Duration,
    min_refresh_interval: Duration,
    dry_run: bool,
    detect_only: bool,
    /// asset -> (fee bps, fetched at).
    fee_cache: DashMap<String, (u32, Instant)>,
    last_replace: HashMap<String, Instant>,
    refresh_bucket: TokenBucket,
    halted: bool,
    staged: Vec<PlaceOrderRequest>,
}

impl OrderManager {
    pub fn new(client: Arc<ExchangeClient>, config: &QuoterConfig) -> Self {
        Self {
            client,
            batch_size: config.orders.batch_size,
            fee_ttl: Duration::from_secs(config.orders.fee_cache_ttl_s),
            min_refresh_interval: Duration::from_millis(config.quoting.min_refresh_interval_ms),
            dry_run: config.dry_run,
            detect_only: config.detect_only,
            fee_cache: DashMap::new(),
            last_replace: HashMap::new(),
            refresh_bucket: TokenBucket::new(config.quoting.global_refresh_cap_per_sec),
            halted: false,
            staged: Vec::new(),
        }
    }

    /// Gate placements on the risk state. While halted, place requests
    /// are ignored.
    pub fn set_halted(&mut self, halted: bool) {
        if halted != self.halted {
            info!(halted, "Order manager halt state changed");
        }
        self.halted = halted;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    // --- Rate control ---

    /// Whether this token may replace its quotes now. Consumes a global
    /// bucket token and stamps the per-market interval on success.
    pub fn try_begin_replace(&mut self, token_id: &str, now: Instant) -> bool {
        if let Some(last) = self.last_replace.get(token_id)
            && now.duration_since(*last) < self.min_refresh_interval
        {
            return false;
        }
        if !self.refresh_bucket.try_acquire(now) {
            debug!(token_id = %token_id, "Global refresh cap reached");
            return false;
        }
        self.last_replace.insert(token_id.to_string(), now);
        true
    }

    // --- Fee rates ---

    /// Fee rate for an asset, cached with TTL.
    pub async fn fee_rate(&self, asset_id: &str) -> Result<u32, OrderManagerError> {
        let now = Instant::now();
        if let Some(entry) = self.fee_cache.get(asset_id)
            && now.duration_since(entry.1) < self.fee_ttl
        {
            return Ok(entry.0);
        }

        match self.client.get_fee_rate(asset_id).await {
            Ok(bps) => {
                self.fee_cache.insert(asset_id.to_string(), (bps, now));
                debug!(asset_id = %asset_id, bps, "Fee rate cached");
                Ok(bps)
            }
            Err(e) => Err(OrderManagerError::FeeFetchFailed(e.to_string())),
        }
    }

    /// Warm the fee cache for a set of assets. Failures are logged and
    /// do not stop other fetches.
    pub async fn prefetch_fee_rates(&self, asset_ids: &[String]) {
        for asset_id in asset_ids {
            if let Err(e) = self.fee_rate(asset_id).await {
                warn!(asset_id = %asset_id, error = %e, "Failed to prefetch fee rate");
            }
        }
    }

    /// Number of cached fee entries (stale ones included).
    pub fn fee_cache_size(&self) -> usize {
        self.fee_cache.len()
    }

    // --- Placement ---

    /// Stage both sides of a quote for the next flush. Returns how many
    /// orders were staged.
    pub fn stage_quote(&mut self, quote: &Quote, fee_rate_bps: u32) -> usize {
        if self.halted {
            debug!(token_id = %quote.token_id, "Place request ignored: halted");
            return 0;
        }

        let mut staged = 0;
        for (side, quote_side) in [(Side::Buy, &quote.bid), (Side::Sell, &quote.ask)] {
            let Some(qs) = quote_side else { continue };
            if qs.size <= Decimal::ZERO {
                continue;
            }
            self.staged.push(PlaceOrderRequest {
                asset_id: quote.token_id.clone(),
                side: side.to_string(),
                price: qs.price,
                size: qs.size,
                post_only: true,
                fee_rate_bps,
                client_order_id: format!("q-{}", Uuid::new_v4().simple()),
            });
            staged += 1;
        }
        staged
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Send all staged placements, batched across assets.
    pub async fn flush(&mut self) -> Vec<PlacementResult> {
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Vec::new();
        }

        if self.detect_only {
            for req in &staged {
                info!(
                    asset_id = %req.asset_id,
                    side = %req.side,
                    price = %req.price,
                    size = %req.size,
                    "[DETECT-ONLY] Would place order"
                );
            }
            return Vec::new();
        }

        if self.dry_run {
            return staged.into_iter().map(|req| simulate_placement(&req)).collect();
        }

        let mut results = Vec::with_capacity(staged.len());
        for chunk in staged.chunks(self.batch_size) {
            match self.client.place_orders_batch(chunk).await {
                Ok(responses) => {
                    for (req, resp) in chunk.iter().zip(responses) {
                        let outcome = if resp.success {
                            match resp.order_id {
                                Some(order_id) => Ok(build_order(req, order_id)),
                                None => Err(OrderManagerError::PlacementRejected(
                                    "no order ID in response".to_string(),
                                )),
                            }
                        } else {
                            Err(classify_rejection(resp.error_msg.as_deref()))
                        };
                        results.push(to_result(req, outcome));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Batch placement failed");
                    // The whole chunk is unknown; every order may exist.
                    // Callers reconcile before re-placing.
                    for req in chunk {
                        results.push(to_result(
                            req,
                            Err(OrderManagerError::Exchange(match &e {
                                ExchangeError::Api { status, body } => ExchangeError::Api {
                                    status: *status,
                                    body: body.clone(),
                                },
                                other => ExchangeError::Json(other.to_string()),
                            })),
                        ));
                    }
                }
            }
        }
        results
    }

    // --- Cancellation ---

    /// Cancel one order. Issued individually for immediacy.
    pub async fn cancel_order(&self, order: &Order) -> Result<(), OrderManagerError> {
        if self.dry_run || self.detect_only {
            info!(order_id = %order.order_id, "[DRY RUN] Cancel order");
            return Ok(());
        }
        self.client.cancel_order(&order.order_id).await?;
        debug!(order_id = %order.order_id, "Cancelled order");
        Ok(())
    }

    /// Cancel all orders for one asset.
    pub async fn cancel_asset(&self, asset_id: &str) -> Result<(), OrderManagerError> {
        if self.dry_run || self.detect_only {
            info!(asset_id = %asset_id, "[DRY RUN] Cancel all orders for asset");
            return Ok(());
        }
        self.client.cancel_asset(asset_id).await?;
        info!(asset_id = %asset_id, "Cancelled all orders for asset");
        Ok(())
    }

    /// Cancel all orders for a set of assets. Returns assets that failed.
    pub async fn cancel_all(&self, asset_ids: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        for asset_id in asset_ids {
            if let Err(e) = self.cancel_asset(asset_id).await {
                warn!(asset_id = %asset_id, error = %e, "Cancel-all failed for asset");
                failed.push(asset_id.clone());
            }
        }
        failed
    }
}

fn build_order(req: &PlaceOrderRequest, order_id: String) -> Order {
    let now = Utc::now();
    Order {
        order_id,
        token_id: req.asset_id.clone(),
        side: req.side.parse().unwrap_or(Side::Buy),
        price: req.price,
        original_size: req.size,
        remaining_size: req.size,
        status: OrderStatus::Live,
        fee_rate_bps: req.fee_rate_bps,
        created_at: now,
        updated_at: now,
    }
}

fn simulate_placement(req: &PlaceOrderRequest) -> PlacementResult {
    let order_id = format!("dry-{}", Uuid::new_v4().simple());
    info!(
        asset_id = %req.asset_id,
        side = %req.side,
        price = %req.price,
        size = %req.size,
        order_id = %order_id,
        "[DRY RUN] Placed order"
    );
    to_result(req, Ok(build_order(req, order_id)))
}

fn to_result(req: &PlaceOrderRequest, outcome: Result<Order, OrderManagerError>) -> PlacementResult {
    PlacementResult {
        token_id: req.asset_id.clone(),
        side: req.side.parse().unwrap_or(Side::Buy),
        price: req.price,
        size: req.size,
        outcome,
    }
}

/// Post-only crosses are handled softly; anything else counts toward
/// consecutive errors.
fn classify_rejection(error_msg: Option<&str>) -> OrderManagerError {
    let msg = error_msg.unwrap_or("unknown rejection");
    let lowered = msg.to_lowercase();
    if lowered.contains("cross") || lowered.contains("post only") || lowered.contains("post-only") {
        OrderManagerError::PostOnlyCross
    } else {
        OrderManagerError::PlacementRejected(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QuoteSide;
    use rust_decimal_macros::dec;

    fn test_config() -> QuoterConfig {
        let mut config = QuoterConfig::default();
        config.assets = vec!["token1".to_string()];
        config.dry_run = true;
        config
    }

    fn manager() -> OrderManager {
        let client = Arc::new(ExchangeClient::with_url("http://localhost:1"));
        OrderManager::new(client, &test_config())
    }

    fn quote() -> Quote {
        Quote {
            token_id: "token1".to_string(),
            bid: Some(QuoteSide::new(dec!(0.45), dec!(10))),
            ask: Some(QuoteSide::new(dec!(0.55), dec!(10))),
        }
    }

    #[test]
    fn test_stage_quote_both_sides() {
        let mut mgr = manager();
        assert_eq!(mgr.stage_quote(&quote(), 1000), 2);
        assert_eq!(mgr.staged_count(), 2);
    }

    #[test]
    fn test_stage_quote_skips_missing_and_zero_sides() {
        let mut mgr = manager();
        let mut q = quote();
        q.ask = None;
        assert_eq!(mgr.stage_quote(&q, 0), 1);

        let mut q = quote();
        q.bid = Some(QuoteSide::new(dec!(0.45), Decimal::ZERO));
        assert_eq!(mgr.stage_quote(&q, 0), 1);
    }

    #[test]
    fn test_halted_ignores_placements() {
        let mut mgr = manager();
        mgr.set_halted(true);
        assert_eq!(mgr.stage_quote(&quote(), 0), 0);
        assert_eq!(mgr.staged_count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_flush_simulates_orders() {
        let mut mgr = manager();
        mgr.stage_quote(&quote(), 1000);

        let results = mgr.flush().await;
        assert_eq!(results.len(), 2);
        for result in &results {
            let order = result.outcome.as_ref().unwrap();
            assert!(order.order_id.starts_with("dry-"));
            assert_eq!(order.status, OrderStatus::Live);
            assert_eq!(order.fee_rate_bps, 1000);
        }
        assert_eq!(mgr.staged_count(), 0);
    }

    #[tokio::test]
    async fn test_detect_only_flush_places_nothing() {
        let client = Arc::new(ExchangeClient::with_url("http://localhost:1"));
        let mut config = test_config();
        config.detect_only = true;
        let mut mgr = OrderManager::new(client, &config);

        mgr.stage_quote(&quote(), 0);
        let results = mgr.flush().await;
        assert!(results.is_empty());
        assert_eq!(mgr.staged_count(), 0);
    }

    #[test]
    fn test_refresh_interval_per_market() {
        let mut mgr = manager();
        let now = Instant::now();

        assert!(mgr.try_begin_replace("token1", now));
        // Immediately again: blocked by the 500ms interval
        assert!(!mgr.try_begin_replace("token1", now + Duration::from_millis(100)));
        // Another market is unaffected
        assert!(mgr.try_begin_replace("token2", now + Duration::from_millis(100)));
        // After the interval the market may refresh again
        assert!(mgr.try_begin_replace("token1", now + Duration::from_millis(600)));
    }

    #[test]
    fn test_global_refresh_cap() {
        let client = Arc::new(ExchangeClient::with_url("http://localhost:1"));
        let mut config = test_config();
        config.quoting.global_refresh_cap_per_sec = 2;
        config.quoting.min_refresh_interval_ms = 0;
        let mut mgr = OrderManager::new(client, &config);

        let now = Instant::now();
        assert!(mgr.try_begin_replace("a", now));
        assert!(mgr.try_begin_replace("b", now));
        assert!(!mgr.try_begin_replace("c", now));

        // Tokens refill with time
        assert!(mgr.try_begin_replace("c", now + Duration::from_secs(1)));
    }

    #[test]
    fn test_token_bucket_refill_capped() {
        let mut bucket = TokenBucket::new(5);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(bucket.try_acquire(now));
        }
        assert!(!bucket.try_acquire(now));

        // A long idle period refills to capacity, not beyond
        let later = now + Duration::from_secs(60);
        for _ in 0..5 {
            assert!(bucket.try_acquire(later));
        }
        assert!(!bucket.try_acquire(later));
    }

    #[test]
    fn test_classify_rejection() {
        assert!(matches!(
            classify_rejection(Some("order would cross the book")),
            OrderManagerError::PostOnlyCross
        ));
        assert!(matches!(
            classify_rejection(Some("post only rejected")),
            OrderManagerError::PostOnlyCross
        ));
        assert!(matches!(
            classify_rejection(Some("insufficient balance")),
            OrderManagerError::PlacementRejected(_)
        ));
        assert!(matches!(
            classify_rejection(None),
            OrderManagerError::PlacementRejected(_)
        ));
    }

    #[tokio::test]
    async fn test_dry_run_cancel_paths() {
        let mgr = manager();
        let order = Order {
            order_id: "ord1".to_string(),
            token_id: "token1".to_string(),
            side: Side::Buy,
            price: dec!(0.45),
            original_size: dec!(10),
            remaining_size: dec!(10),
            status: OrderStatus::Live,
            fee_rate_bps: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(mgr.cancel_order(&order).await.is_ok());
        assert!(mgr.cancel_asset("token1").await.is_ok());
        assert!(mgr.cancel_all(&["token1".to_string()]).await.is_empty());
    }

    #[test]
    fn test_staged_orders_are_post_only() {
        let mut mgr = manager();
        mgr.stage_quote(&quote(), 0);
        for req in &mgr.staged {
            assert!(req.post_only);
            assert!(req.client_order_id.starts_with("q-"));
        }
    }
}
