//! User channel state: the authoritative open-order map and fill events.
//!
//! Maintains order state from the authenticated stream and reconciles it
//! against periodic REST snapshots. Fill events are deduplicated by trade
//! ID (or the synthesized key when the exchange omits one) and forwarded
//! to inventory and analytics by the orchestrator.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use quoter_common::Side;
use quoter_exchange::types::{ApiOpenOrder, UserOrderMessage, UserTradeMessage};

use crate::types::{Fill, Order, OrderStatus, Quote, QuoteSide};

/// Result of reconciling against a REST open-orders snapshot.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Orders present in the snapshot but unknown locally. The caller
    /// reserves exposure for the BUY ones.
    pub inserted: Vec<Order>,
    /// Remaining-size corrections: (order, released size). Positive
    /// released size means the snapshot shrank the order.
    pub size_synced: Vec<(Order, Decimal)>,
    /// Orders that went terminal during this reconcile (local-only orders
    /// marked cancelled). The caller releases their BUY reservations.
    pub terminal: Vec<Order>,
}

/// Open-order map and fill dedup for the operator's own activity.
pub struct UserChannelManager {
    orders: HashMap<String, Order>,
    orders_by_token: HashMap<String, HashSet<String>>,
    /// IDs of orders already observed in a terminal state.
    terminal_ids: HashSet<String>,
    /// Processed fill keys; the stream can replay the same fill.
    processed_fill_keys: HashSet<String>,
    connected: bool,
    /// Cleared on disconnect; placements stay blocked until the next
    /// successful reconcile.
    reconciled_since_connect: bool,
}

impl UserChannelManager {
    pub fn new() -> Self {
        Self {
            orders: HashMap::new(),
            orders_by_token: HashMap::new(),
            terminal_ids: HashSet::new(),
            processed_fill_keys: HashSet::new(),
            connected: false,
            reconciled_since_connect: false,
        }
    }

    // --- Connection state ---

    pub fn on_connected(&mut self) {
        self.connected = true;
        self.reconciled_since_connect = false;
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.reconciled_since_connect = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Placements are allowed only after a reconcile has confirmed the
    /// open-order map since the last (re)connect.
    pub fn is_reconciled(&self) -> bool {
        self.reconciled_since_connect
    }

    // --- Order tracking ---

    /// Track an order we just placed (exchange ack).
    pub fn track_order(&mut self, order: Order) {
        self.orders_by_token
            .entry(order.token_id.clone())
            .or_default()
            .insert(order.order_id.clone());
        self.orders.insert(order.order_id.clone(), order);
    }

    pub fn get_order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// All open orders for a token.
    pub fn open_orders(&self, token_id: &str) -> Vec<&Order> {
        self.orders_by_token
            .get(token_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.orders.get(id))
                    .filter(|o| o.is_open())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All open orders across tokens.
    pub fn all_open_orders(&self) -> Vec<&Order> {
        self.orders.values().filter(|o| o.is_open()).collect()
    }

    pub fn open_order_count(&self) -> usize {
        self.orders.values().filter(|o| o.is_open()).count()
    }

    /// The currently resting two-sided quote for a token, derived from
    /// open orders. Used for hysteresis.
    pub fn resting_quote(&self, token_id: &str) -> Quote {
        let mut quote = Quote::empty(token_id);
        for order in self.open_orders(token_id) {
            let side = QuoteSide::new(order.price, order.remaining_size);
            match order.side {
                Side::Buy => quote.bid = Some(side),
                Side::Sell => quote.ask = Some(side),
            }
        }
        quote
    }

    // --- Stream events ---

    /// Apply an order status update. Returns the updated order; terminal
    /// orders are removed from the open map.
    pub fn handle_order(&mut self, msg: &UserOrderMessage) -> Option<Order> {
        let status = OrderStatus::from_exchange(&msg.status)?;
        let now = Utc::now();

        let order = match self.orders.get_mut(&msg.id) {
            Some(order) => {
                order.status = status;
                order.updated_at = now;
                if let Some(remaining) = parse_opt_decimal(msg.remaining_size.as_deref()) {
                    order.remaining_size = remaining;
                } else if let (Some(original), Some(matched)) = (
                    parse_opt_decimal(msg.original_size.as_deref()),
                    parse_opt_decimal(msg.size_matched.as_deref()),
                ) {
                    order.remaining_size = original - matched;
                }
                order.clone()
            }
            None => {
                let side = msg
                    .side
                    .as_deref()
                    .and_then(|s| s.parse::<Side>().ok())
                    .unwrap_or(Side::Buy);
                let original = parse_opt_decimal(msg.original_size.as_deref()).unwrap_or_default();
                let remaining =
                    parse_opt_decimal(msg.remaining_size.as_deref()).unwrap_or(original);
                let order = Order {
                    order_id: msg.id.clone(),
                    token_id: msg.asset_id.clone(),
                    side,
                    price: parse_opt_decimal(msg.price.as_deref()).unwrap_or_default(),
                    original_size: original,
                    remaining_size: remaining,
                    status,
                    fee_rate_bps: msg
                        .fee_rate_bps
                        .as_deref()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                    created_at: now,
                    updated_at: now,
                };
                self.track_order(order.clone());
                order
            }
        };

        debug!(order_id = %order.order_id, status = %order.status, "Order update");

        if status.is_terminal() {
            self.remove_order(&order.order_id);
        }

        Some(order)
    }

    /// Apply a fill event. Returns the fill unless it is a duplicate or
    /// not an executed trade.
    pub fn handle_trade(&mut self, msg: &UserTradeMessage) -> Option<Fill> {
        // Only MATCHED/CONFIRMED are executed fills; absent status is
        // treated as valid for simpler message shapes.
        if let Some(status) = msg.status.as_deref() {
            let status = status.to_uppercase();
            if status != "MATCHED" && status != "CONFIRMED" {
                debug!(status = %status, "Skipping non-executed trade event");
                return None;
            }
        }

        let price: Decimal = msg.price.parse().ok()?;
        let size: Decimal = msg.size.parse().ok()?;
        let fee = parse_opt_decimal(msg.fee.as_deref()).unwrap_or_default();

        let order_id = msg
            .order_id
            .clone()
            .or_else(|| msg.id.clone())
            .unwrap_or_else(|| "unknown".to_string());

        // Side can be missing; fall back to the tracked order's side.
        let side = msg
            .side
            .as_deref()
            .and_then(|s| s.parse::<Side>().ok())
            .or_else(|| self.orders.get(&order_id).map(|o| o.side))?;

        let timestamp = msg
            .timestamp
            .as_deref()
            .and_then(parse_fill_timestamp)
            .unwrap_or_else(Utc::now);

        let fill = Fill {
            trade_id: msg.id.clone(),
            order_id: order_id.clone(),
            token_id: msg.asset_id.clone(),
            side,
            price,
            size,
            fee,
            timestamp,
        };

        let key = fill.key();
        if !self.processed_fill_keys.insert(key.clone()) {
            debug!(key = %key, "Skipping duplicate fill");
            return None;
        }
        if fill.trade_id.is_none() {
            info!(key = %key, "Fill without trade_id, synthesized key");
        }

        // Update the owning order. A fill may legally arrive before the
        // terminal order update; only that update releases reservations.
        if let Some(order) = self.orders.get_mut(&order_id) {
            order.remaining_size -= size;
            order.updated_at = Utc::now();
            if order.remaining_size <= Decimal::ZERO {
                order.remaining_size = Decimal::ZERO;
                order.status = OrderStatus::Filled;
            } else {
                order.status = OrderStatus::Partial;
            }
        }

        info!(
            key = %key,
            token_id = %fill.token_id,
            side = %fill.side,
            price = %fill.price,
            size = %fill.size,
            "Fill"
        );

        Some(fill)
    }

    // --- Reconciliation ---

    /// Reconcile the local open-order map against a REST snapshot.
    ///
    /// - Local open orders absent from the snapshot and never observed as
    ///   terminal are marked CANCELLED.
    /// - Snapshot orders unknown locally are inserted.
    /// - `remaining_size` is taken from the snapshot when they differ.
    pub fn reconcile(&mut self, api_orders: &[ApiOpenOrder]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let now = Utc::now();
        let mut snapshot_ids: HashSet<&str> = HashSet::new();

        for api_order in api_orders {
            snapshot_ids.insert(api_order.order_id.as_str());

            let status =
                OrderStatus::from_exchange(&api_order.status).unwrap_or(OrderStatus::Live);
            let remaining = api_order
                .remaining_size
                .as_deref()
                .and_then(|s| s.parse::<Decimal>().ok());

            if let Some(order) = self.orders.get_mut(&api_order.order_id) {
                if order.status != status {
                    warn!(
                        order_id = %order.order_id,
                        local = %order.status,
                        api = %status,
                        "Reconcile: status mismatch"
                    );
                    order.status = status;
                    order.updated_at = now;
                }
                if let Some(remaining) = remaining
                    && order.remaining_size != remaining
                {
                    warn!(
                        order_id = %order.order_id,
                        local = %order.remaining_size,
                        api = %remaining,
                        "Reconcile: size mismatch"
                    );
                    let released = order.remaining_size - remaining;
                    order.remaining_size = remaining;
                    order.updated_at = now;
                    report.size_synced.push((order.clone(), released));
                }
                if status.is_terminal() {
                    let order = order.clone();
                    self.remove_order(&api_order.order_id);
                    report.terminal.push(order);
                }
            } else if !self.terminal_ids.contains(&api_order.order_id) && status.is_open() {
                let side = api_order.side.parse::<Side>().unwrap_or(Side::Buy);
                let size: Decimal = api_order.size.parse().unwrap_or_default();
                let order = Order {
                    order_id: api_order.order_id.clone(),
                    token_id: api_order.asset_id.clone(),
                    side,
                    price: api_order.price.parse().unwrap_or_default(),
                    original_size: size,
                    remaining_size: remaining.unwrap_or(size),
                    status,
                    fee_rate_bps: 0,
                    created_at: now,
                    updated_at: now,
                };
                warn!(order_id = %order.order_id, "Reconcile: inserting missing order");
                self.track_order(order.clone());
                report.inserted.push(order);
            }
        }

        // Local open orders not present in the snapshot are terminal; the
        // exchange no longer knows them.
        let missing: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.is_open() && !snapshot_ids.contains(o.order_id.as_str()))
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in missing {
            if let Some(order) = self.orders.get_mut(&order_id) {
                warn!(
                    order_id = %order_id,
                    "Reconcile: order not in snapshot, marking cancelled"
                );
                order.status = OrderStatus::Cancelled;
                order.updated_at = now;
                let order = order.clone();
                self.remove_order(&order_id);
                report.terminal.push(order);
            }
        }

        self.reconciled_since_connect = true;
        report
    }

    /// Simulate a terminal cancel locally (dry run, where the exchange
    /// will never confirm one).
    pub fn mark_cancelled(&mut self, order_id: &str) -> Option<Order> {
        let order = self.orders.get_mut(order_id)?;
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        let order = order.clone();
        self.remove_order(order_id);
        Some(order)
    }

    fn remove_order(&mut self, order_id: &str) {
        if let Some(order) = self.orders.remove(order_id) {
            if let Some(ids) = self.orders_by_token.get_mut(&order.token_id) {
                ids.remove(order_id);
            }
            self.terminal_ids.insert(order_id.to_string());
        }
    }
}

impl Default for UserChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_opt_decimal(s: Option<&str>) -> Option<Decimal> {
    s.and_then(|s| s.parse().ok())
}

/// Fill timestamps arrive either as epoch milliseconds or RFC 3339.
fn parse_fill_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    if let Ok(ms) = ts.parse::<i64>() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
