//! Component wiring and the main event loop.
//!
//! The orchestrator owns every piece of mutable engine state and mutates
//! it only while handling one event at a time. The streams are the only
//! other tasks; they push parsed events into a single queue. All REST
//! calls, placements, and persistence writes are suspension points of
//! this loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration as TokioDuration, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use quoter_common::{SessionRow, Side, StateStore};
use quoter_exchange::rest::{ApiCredentials, ExchangeClient, ExchangeConfig};

use crate::analytics::FillAnalytics;
use crate::book::{BookApplied, OrderbookManager};
use crate::config::QuoterConfig;
use crate::inventory::InventoryManager;
use crate::ledger::{EventLedger, LedgerKind};
use crate::momentum::MomentumDetector;
use crate::order_manager::{OrderManager, OrderManagerError};
use crate::pnl::PnlTracker;
use crate::quote_engine::{QuoteContext, QuoteEngine};
use crate::risk::{RiskEvent, RiskManager, RiskScope, RiskState};
use crate::streams::market::MarketStream;
use crate::streams::user::UserStream;
use crate::streams::{EngineEvent, MarketStreamEvent, UserStreamEvent};
use crate::types::{Order, QuoteDecision};
use crate::user_channel::UserChannelManager;

/// Engine event queue depth.
const EVENT_BUFFER: usize = 10_000;

/// Bounded retries for the shutdown cancel-all.
const SHUTDOWN_CANCEL_ATTEMPTS: u32 = 3;

/// Marker error for failures during the startup sequence. Maps to exit
/// code 2 in the binary.
#[derive(Debug, thiserror::Error)]
#[error("startup failed: {0}")]
pub struct StartupError(pub String);

/// Wires the managers together and drives the per-market quote cycle.
pub struct Orchestrator {
    config: QuoterConfig,
    client: Arc<ExchangeClient>,
    store: Option<StateStore>,
    session: SessionRow,

    books: OrderbookManager,
    user_channel: UserChannelManager,
    inventory: InventoryManager,
    momentum: MomentumDetector,
    quote_engine: QuoteEngine,
    order_manager: OrderManager,
    risk: RiskManager,
    pnl: PnlTracker,
    analytics: FillAnalytics,
    ledger: EventLedger,

    event_tx: mpsc::Sender<EngineEvent>,
    event_rx: mpsc::Receiver<EngineEvent>,
    shutdown_tx: broadcast::Sender<()>,
    /// Last resync attempt while a WS gap is outstanding.
    last_gap_recovery_at: Option<Instant>,
}

impl Orchestrator {
    pub fn new(config: QuoterConfig) -> Result<Self> {
        let credentials = ApiCredentials {
            api_key: config.credentials.api_key.clone().unwrap_or_default(),
            api_secret: config.credentials.api_secret.clone().unwrap_or_default(),
            api_passphrase: config.credentials.api_passphrase.clone().unwrap_or_default(),
        };
        let client = Arc::new(ExchangeClient::new(
            ExchangeConfig {
                base_url: config.rest_url.clone(),
                request_timeout: config.orders.request_timeout(),
            },
            credentials,
        ));

        let store = config
            .store
            .enabled
            .then(|| StateStore::new(config.store.to_store_config()));

        let pairs: HashMap<String, String> = config
            .markets
            .iter()
            .filter_map(|m| {
                m.pair_token_id
                    .as_ref()
                    .map(|p| (m.token_id.clone(), p.clone()))
            })
            .collect();

        let session_id = format!("s-{}", Uuid::new_v4().simple());
        let now = Utc::now();
        let session = SessionRow {
            session_id: session_id.clone(),
            started_at: now,
            ended_at: now,
            config_snapshot: json!({
                "assets": config.assets,
                "dry_run": config.dry_run,
                "detect_only": config.detect_only,
                "order_size": config.quoting.order_size.to_string(),
                "max_position_per_market": config.inventory.max_position_per_market.to_string(),
            })
            .to_string(),
            status: "running".to_string(),
        };

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, _) = broadcast::channel(16);

        let books = OrderbookManager::new(
            &config.assets,
            config.momentum.depth_levels,
            config.risk.stale_feed_threshold_s,
        );
        let inventory = InventoryManager::new(config.inventory.clone(), pairs);
        let momentum = MomentumDetector::new(config.momentum.clone());
        let quote_engine = QuoteEngine::new(config.quoting.clone());
        let order_manager = OrderManager::new(Arc::clone(&client), &config);
        let risk = RiskManager::new(config.risk.clone());

        Ok(Self {
            config,
            client,
            store,
            session,
            books,
            user_channel: UserChannelManager::new(),
            inventory,
            momentum,
            quote_engine,
            order_manager,
            risk,
            pnl: PnlTracker::new(60),
            analytics: FillAnalytics::new(),
            ledger: EventLedger::new(session_id),
            event_tx,
            event_rx,
            shutdown_tx,
            last_gap_recovery_at: None,
        })
    }

    /// Handle for requesting shutdown from a signal task.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the engine until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.startup().await?;
        self.main_loop().await;
        self.shutdown().await;
        Ok(())
    }

    // --- Startup ---

    async fn startup(&mut self) -> Result<()> {
        info!(
            assets = self.config.assets.len(),
            dry_run = self.config.dry_run,
            detect_only = self.config.detect_only,
            "Starting active quoting engine"
        );

        // Durable state first: restore positions and open the session.
        if let Some(store) = self.store.clone() {
            match store.ping().await {
                Ok(()) => {
                    store
                        .create_tables()
                        .await
                        .map_err(|e| StartupError(format!("schema creation: {}", e)))?;
                    store
                        .write_session(&self.session)
                        .await
                        .map_err(|e| StartupError(format!("session record: {}", e)))?;

                    let restored = store
                        .fetch_positions()
                        .await
                        .map_err(|e| StartupError(format!("position restore: {}", e)))?;
                    for row in restored {
                        if self.config.assets.contains(&row.token_id) {
                            info!(
                                token_id = %row.token_id,
                                size = %row.size,
                                "Restored position from store"
                            );
                            self.inventory.seed_position(
                                &row.token_id,
                                row.size,
                                row.avg_price,
                                row.updated_at,
                            );
                        }
                    }
                }
                Err(e) => {
                    if self.config.dry_run {
                        warn!(error = %e, "State store unavailable, continuing without persistence");
                        self.store = None;
                    } else {
                        return Err(StartupError(format!("state store unreachable: {}", e)).into());
                    }
                }
            }
        }

        for market in &self.config.markets {
            self.risk
                .set_market_end_time(&market.token_id, market.end_time);
            if let Some(label) = &market.label {
                self.pnl.set_market_label(&market.token_id, label);
            }
        }

        // Streams.
        let market_stream = MarketStream::new(
            self.config.websocket.clone(),
            self.config.assets.clone(),
        );
        let market_tx = self.event_tx.clone();
        let market_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = market_stream.run(market_tx, market_shutdown).await {
                error!(error = %e, "Market stream task ended");
            }
        });

        // Without credentials there is nothing to authenticate; a dry run
        // proceeds with an empty, trusted open-order map instead of
        // halting on a rejected subscription.
        if self.config.credentials.is_complete() {
            let user_stream = UserStream::new(
                self.config.websocket.clone(),
                self.config.credentials.clone(),
            );
            let user_tx = self.event_tx.clone();
            let user_shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = user_stream.run(user_tx, user_shutdown).await {
                    error!(error = %e, "User stream task ended");
                }
            });
        } else {
            warn!("No API credentials; user channel disabled (dry run only)");
            self.user_channel.on_connected();
            self.user_channel.reconcile(&[]);
            self.risk.on_user_reconciled();
        }

        // Initial authoritative snapshots. In dry-run the exchange may be
        // unreachable; start from empty state instead of failing.
        if !self.config.dry_run {
            self.refresh_positions()
                .await
                .map_err(|e| StartupError(format!("initial positions: {}", e)))?;
            self.reconcile_orders()
                .await
                .map_err(|e| StartupError(format!("initial open orders: {}", e)))?;
            self.order_manager
                .prefetch_fee_rates(&self.config.assets.clone())
                .await;
        }

        self.ledger.note(LedgerKind::Lifecycle, "", "startup complete");
        info!("Startup complete, entering main loop");
        Ok(())
    }

    // --- Main loop ---

    async fn main_loop(&mut self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let mut reconcile_timer = interval(TokioDuration::from_secs(
            self.config.orders.reconcile_interval_s,
        ));
        let mut position_timer = interval(TokioDuration::from_secs(
            self.config.orders.position_refresh_interval_s,
        ));
        let mut second_timer = interval(TokioDuration::from_secs(1));
        for timer in [&mut reconcile_timer, &mut position_timer, &mut second_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // The first tick of a tokio interval fires immediately.
        reconcile_timer.reset();
        position_timer.reset();

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(EngineEvent::Market(event)) => self.handle_market_event(event).await,
                        Some(EngineEvent::User(event)) => self.handle_user_event(event).await,
                        None => {
                            error!("Engine event channel closed");
                            break;
                        }
                    }
                }
                _ = reconcile_timer.tick() => {
                    // The authenticated endpoints have nothing to say
                    // about a credential-less dry run.
                    if self.config.credentials.is_complete()
                        && let Err(e) = self.reconcile_orders().await
                    {
                        warn!(error = %e, "Periodic order reconcile failed");
                        self.record_engine_error().await;
                    }
                }
                _ = position_timer.tick() => {
                    if self.config.credentials.is_complete()
                        && let Err(e) = self.refresh_positions().await
                    {
                        warn!(error = %e, "Periodic position refresh failed");
                        self.record_engine_error().await;
                    }
                }
                _ = second_timer.tick() => {
                    self.on_second_tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }
    }

    // --- Market events ---

    async fn handle_market_event(&mut self, event: MarketStreamEvent) {
        match &event {
            MarketStreamEvent::Connected => {
                self.risk.on_market_connected();
                return;
            }
            MarketStreamEvent::Disconnected(_) => {
                self.books.apply(&event);
                let risk_events = self.risk.on_market_disconnect(Utc::now());
                self.apply_risk_events(risk_events).await;
                return;
            }
            _ => {}
        }

        let Some(applied) = self.books.apply(&event) else {
            return;
        };
        let now = Utc::now();

        match applied {
            BookApplied::Updated {
                token_id,
                bid_depth_after,
                ask_depth_after,
                ..
            } => {
                self.risk.record_feed_update(&token_id, now);
                if let Some(momentum_event) =
                    self.momentum
                        .observe_depth(&token_id, bid_depth_after, ask_depth_after, now)
                {
                    self.ledger.record(
                        LedgerKind::Quote,
                        &token_id,
                        json!({ "momentum": momentum_event.kind.to_string(), "detail": momentum_event.detail }),
                    );
                }
                self.quote_cycle(&token_id).await;
            }
            BookApplied::Trade {
                token_id,
                price,
                timestamp,
            } => {
                self.risk.record_feed_update(&token_id, now);
                let tick = self.books.tick_size(&token_id).unwrap_or(Decimal::new(1, 2));
                if let Some(momentum_event) =
                    self.momentum.observe_trade(&token_id, price, tick, timestamp)
                {
                    self.ledger.record(
                        LedgerKind::Quote,
                        &token_id,
                        json!({ "momentum": momentum_event.kind.to_string(), "detail": momentum_event.detail }),
                    );
                    // Cooldown armed: pull quotes immediately.
                    self.quote_cycle(&token_id).await;
                }
            }
            BookApplied::TickSize { token_id, .. } => {
                self.risk.record_feed_update(&token_id, now);
                self.quote_cycle(&token_id).await;
            }
        }
    }

    // --- User events ---

    async fn handle_user_event(&mut self, event: UserStreamEvent) {
        match event {
            UserStreamEvent::Connected => {
                self.user_channel.on_connected();
                // Force reconciliation; placements stay blocked until it
                // completes.
                if self.config.dry_run {
                    self.user_channel.reconcile(&[]);
                    self.risk.on_user_reconciled();
                } else {
                    match self.reconcile_orders().await {
                        Ok(()) => {
                            if let Err(e) = self.refresh_positions().await {
                                warn!(error = %e, "Position refresh after reconnect failed");
                                self.record_engine_error().await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Reconcile after reconnect failed");
                            self.record_engine_error().await;
                        }
                    }
                }
            }
            UserStreamEvent::Disconnected(reason) => {
                self.user_channel.on_disconnected();
                self.ledger
                    .record(LedgerKind::RiskState, "", json!({ "user_disconnect": reason }));
                let risk_events = self.risk.on_user_disconnect(Utc::now());
                self.apply_risk_events(risk_events).await;
            }
            UserStreamEvent::SequenceGap { expected, got } => {
                self.ledger.record(
                    LedgerKind::Reconcile,
                    "",
                    json!({ "gap_expected": expected, "gap_got": got }),
                );
                let risk_events = self.risk.record_gap(Utc::now());
                self.apply_risk_events(risk_events).await;

                // Forced resynchronisation attempt.
                match self.reconcile_orders().await {
                    Ok(()) => match self.force_refresh_positions().await {
                        Ok(()) => self.risk.gap_resolved(),
                        Err(e) => {
                            warn!(error = %e, "Position resync after gap failed");
                            self.record_engine_error().await;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "Order resync after gap failed");
                        self.record_engine_error().await;
                    }
                }
            }
            UserStreamEvent::Order(msg) => {
                if let Some(order) = self.user_channel.handle_order(&msg) {
                    self.on_order_transition(&order);
                    self.quote_cycle(&order.token_id.clone()).await;
                }
            }
            UserStreamEvent::Trade(msg) => {
                if let Some(fill) = self.user_channel.handle_trade(&msg) {
                    self.on_fill(fill).await;
                }
            }
        }
    }

    /// Terminal order updates release what is left of the BUY
    /// reservation. Fills release their own portion on the fill path, so
    /// the reservation always mirrors the live remaining size.
    fn on_order_transition(&mut self, order: &Order) {
        self.ledger.record(
            LedgerKind::Order,
            &order.token_id,
            json!({
                "order_id": order.order_id,
                "status": order.status.to_string(),
                "remaining": order.remaining_size.to_string(),
            }),
        );

        if order.is_terminal() && order.side == Side::Buy && order.remaining_size > Decimal::ZERO {
            self.inventory
                .release_pending_buy(&order.token_id, order.remaining_size);
        }
    }

    async fn on_fill(&mut self, fill: crate::types::Fill) {
        let token_id = fill.token_id.clone();
        let mid = self
            .books
            .mid_price(&token_id)
            .unwrap_or(fill.price);

        let position_before = self.inventory.effective_size(&token_id);
        let avg_before = self.inventory.avg_entry_price(&token_id);

        self.inventory.on_fill(&fill);
        if fill.side == Side::Buy {
            // The filled portion moves from reservation to pending fill.
            self.inventory.release_pending_buy(&token_id, fill.size);
        }

        let outcome = self.pnl.record_fill(&fill, avg_before, position_before);
        if let Some(outcome) = &outcome {
            let risk_events =
                self.risk
                    .record_trade_loss(&token_id, outcome.net_pnl, Utc::now());
            self.apply_risk_events(risk_events).await;
        }

        let fill_row = self.analytics.record_fill(&fill, mid);
        if let Some(store) = &self.store
            && let Err(e) = store.insert_fills(std::slice::from_ref(&fill_row)).await
        {
            warn!(error = %e, "Failed to persist fill");
        }

        self.ledger.record(
            LedgerKind::Fill,
            &token_id,
            json!({
                "key": fill.key(),
                "side": fill.side.to_string(),
                "price": fill.price.to_string(),
                "size": fill.size.to_string(),
            }),
        );

        self.update_market_risk_pnl(&token_id).await;
        self.quote_cycle(&token_id).await;
    }

    async fn update_market_risk_pnl(&mut self, token_id: &str) {
        let realized = self.pnl.market_realized(token_id);
        let unrealized = match self.books.mid_price(token_id) {
            Some(mid) => PnlTracker::unrealized(
                self.inventory.effective_size(token_id),
                self.inventory.avg_entry_price(token_id),
                mid,
            ),
            None => Decimal::ZERO,
        };
        let risk_events = self
            .risk
            .update_market_pnl(token_id, realized, unrealized, Utc::now());
        self.apply_risk_events(risk_events).await;
    }

    // --- Quote cycle ---

    async fn quote_cycle(&mut self, token_id: &str) {
        if !self.config.assets.iter().any(|a| a == token_id) {
            return;
        }
        let now = Utc::now();

        let (allowed, reason) = self.risk.can_place(token_id, now);
        if !allowed {
            if !self.user_channel.open_orders(token_id).is_empty() {
                debug!(token_id = %token_id, reason = %reason, "Pulling quotes");
                self.cancel_market_quotes(token_id).await;
            }
            return;
        }

        // No placements until the open-order map is trustworthy.
        if !self.user_channel.is_reconciled() {
            return;
        }

        let top = self.books.get_top_of_book(token_id);
        let book_stale = self.books.is_stale(token_id, now) || top.is_none();
        let resting = self.user_channel.resting_quote(token_id);

        let decision = match top {
            Some(top) => {
                let sell_only = self.in_wind_down(token_id, now);
                let order_size = self.config.quoting.order_size;
                let bid_size = if sell_only {
                    Decimal::ZERO
                } else {
                    self.inventory.adjusted_buy_size(token_id, order_size)
                };
                let ask_size = self.inventory.adjusted_sell_size(token_id, order_size);

                let ctx = QuoteContext {
                    token_id: token_id.to_string(),
                    top,
                    effective_size: self.inventory.effective_size(token_id),
                    bid_size,
                    ask_size,
                    in_cooldown: self.momentum.in_cooldown(token_id, now),
                    book_stale,
                };
                self.quote_engine.decide(&ctx, &resting)
            }
            None => {
                if resting.is_empty() {
                    QuoteDecision::Keep
                } else {
                    QuoteDecision::cancel_all("no top of book")
                }
            }
        };

        match decision {
            QuoteDecision::Keep => {}
            QuoteDecision::CancelAll { reason } => {
                if !resting.is_empty() {
                    debug!(token_id = %token_id, reason = %reason, "Cancelling quotes");
                    self.cancel_market_quotes(token_id).await;
                }
            }
            QuoteDecision::Replace(quote) => {
                if !self.order_manager.try_begin_replace(token_id, Instant::now()) {
                    return;
                }

                let fee_rate = match self.order_manager.fee_rate(token_id).await {
                    Ok(bps) => bps,
                    Err(e) => {
                        // Warning only: skip this asset for the cycle.
                        warn!(token_id = %token_id, error = %e, "Fee fetch failed, skipping cycle");
                        return;
                    }
                };

                self.cancel_market_quotes(token_id).await;

                self.order_manager.stage_quote(&quote, fee_rate);
                let results = self.order_manager.flush().await;
                for result in results {
                    match result.outcome {
                        Ok(order) => {
                            if order.side == Side::Buy {
                                self.inventory
                                    .reserve_pending_buy(&order.token_id, order.original_size);
                            }
                            self.ledger.record(
                                LedgerKind::Quote,
                                &order.token_id,
                                json!({
                                    "order_id": order.order_id,
                                    "side": order.side.to_string(),
                                    "price": order.price.to_string(),
                                    "size": order.original_size.to_string(),
                                }),
                            );
                            self.user_channel.track_order(order);
                            self.risk.record_success();
                        }
                        Err(OrderManagerError::PostOnlyCross) => {
                            // Soft rejection: recompute next tick.
                            warn!(
                                token_id = %result.token_id,
                                side = %result.side,
                                price = %result.price,
                                "Post-only order would cross, will recompute"
                            );
                        }
                        Err(e) => {
                            warn!(
                                token_id = %result.token_id,
                                error = %e,
                                "Placement failed"
                            );
                            self.record_engine_error().await;
                        }
                    }
                }
            }
        }
    }

    fn in_wind_down(&self, token_id: &str, now: DateTime<Utc>) -> bool {
        self.config
            .market_entry(token_id)
            .and_then(|m| m.end_time)
            .is_some_and(|end| {
                let start = end - chrono::Duration::seconds(self.config.orders.wind_down_start_s as i64);
                now >= start && now < end
            })
    }

    /// Cancel all resting orders for one token, individually for
    /// immediacy. Reservations are left alone; terminal confirmations
    /// release them.
    async fn cancel_market_quotes(&mut self, token_id: &str) {
        let orders: Vec<Order> = self
            .user_channel
            .open_orders(token_id)
            .into_iter()
            .cloned()
            .collect();
        for order in orders {
            match self.order_manager.cancel_order(&order).await {
                Ok(()) => {
                    // Without a live exchange nothing will confirm the
                    // cancel; simulate the terminal transition locally.
                    if (self.config.dry_run || self.config.detect_only)
                        && let Some(order) = self.user_channel.mark_cancelled(&order.order_id)
                    {
                        self.on_order_transition(&order);
                    }
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "Cancel failed");
                    self.record_engine_error().await;
                }
            }
        }
    }

    // --- Risk plumbing ---

    async fn apply_risk_events(&mut self, events: Vec<RiskEvent>) {
        for event in events {
            match event {
                RiskEvent::StateChanged { old, new, reason } => {
                    self.ledger.record(
                        LedgerKind::RiskState,
                        "",
                        json!({
                            "old": old.to_string(),
                            "new": new.to_string(),
                            "reason": reason,
                        }),
                    );
                    self.inventory.set_risk_multiplier(new.multiplier());
                    self.order_manager.set_halted(new == RiskState::Halted);
                    if new == RiskState::Halted {
                        error!(reason = %reason, "HALTED: operator attention required");
                    }
                }
                RiskEvent::MarketHalted { token_id, reason } => {
                    self.ledger
                        .record(LedgerKind::RiskState, &token_id, json!({ "halt": reason }));
                }
                RiskEvent::KillSwitch { scope } => match scope {
                    RiskScope::Global => {
                        info!("Kill switch: cancelling all orders");
                        let assets = self.config.assets.clone();
                        let failed = self.order_manager.cancel_all(&assets).await;
                        if !failed.is_empty() {
                            warn!(failed = failed.len(), "Kill switch cancels incomplete");
                        }
                    }
                    RiskScope::Market(token_id) => {
                        info!(token_id = %token_id, "Kill switch: cancelling market orders");
                        if let Err(e) = self.order_manager.cancel_asset(&token_id).await {
                            warn!(token_id = %token_id, error = %e, "Market cancel failed");
                        }
                    }
                },
            }
        }
    }

    async fn record_engine_error(&mut self) {
        let events = self.risk.record_error(Utc::now());
        self.apply_risk_events(events).await;
    }

    // --- Periodic work ---

    async fn reconcile_orders(&mut self) -> Result<()> {
        let api_orders = self
            .client
            .get_open_orders()
            .await
            .context("fetching open orders")?;

        let report = self.user_channel.reconcile(&api_orders);
        if !report.inserted.is_empty() || !report.terminal.is_empty() || !report.size_synced.is_empty()
        {
            info!(
                inserted = report.inserted.len(),
                terminal = report.terminal.len(),
                size_synced = report.size_synced.len(),
                "Order reconcile applied changes"
            );
            self.ledger.record(
                LedgerKind::Reconcile,
                "",
                json!({
                    "inserted": report.inserted.len(),
                    "terminal": report.terminal.len(),
                    "size_synced": report.size_synced.len(),
                }),
            );
        }

        // Keep BUY reservations equal to the live remaining sizes the
        // snapshot reports.
        for order in &report.inserted {
            if order.side == Side::Buy && order.is_open() {
                self.inventory
                    .reserve_pending_buy(&order.token_id, order.remaining_size);
            }
        }
        for (order, released) in &report.size_synced {
            if order.side == Side::Buy && *released > Decimal::ZERO {
                self.inventory.release_pending_buy(&order.token_id, *released);
            }
        }
        for order in &report.terminal {
            if order.side == Side::Buy && order.remaining_size > Decimal::ZERO {
                self.inventory
                    .release_pending_buy(&order.token_id, order.remaining_size);
            }
        }

        self.risk.on_user_reconciled();
        self.risk.record_success();
        Ok(())
    }

    async fn refresh_positions(&mut self) -> Result<()> {
        let api_positions = self
            .client
            .get_positions()
            .await
            .context("fetching positions")?;
        self.apply_position_snapshot(&api_positions, false).await
    }

    async fn force_refresh_positions(&mut self) -> Result<()> {
        let api_positions = self
            .client
            .get_positions()
            .await
            .context("fetching positions")?;
        self.apply_position_snapshot(&api_positions, true).await
    }

    async fn apply_position_snapshot(
        &mut self,
        api_positions: &[quoter_exchange::types::ApiPosition],
        force: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let sizes: HashMap<&str, Decimal> = api_positions
            .iter()
            .filter_map(|p| p.size.parse().ok().map(|s| (p.asset_id.as_str(), s)))
            .collect();

        for token_id in self.config.assets.clone() {
            let size = sizes.get(token_id.as_str()).copied().unwrap_or(Decimal::ZERO);

            // Longs only: a negative authoritative size means the books
            // disagree about reality. Fatal.
            if size < Decimal::ZERO {
                error!(token_id = %token_id, size = %size, "Negative confirmed position");
                let events = self
                    .risk
                    .halt_fatal(&format!("negative confirmed position for {}", token_id), now);
                self.apply_risk_events(events).await;
                anyhow::bail!("negative confirmed position for {}", token_id);
            }

            if force {
                self.inventory.force_reconcile(&token_id, size, now);
            } else {
                let outcome = self.inventory.set_position(&token_id, size, now);
                if !outcome.aged_out.is_empty() || outcome.drift.abs() > Decimal::ZERO {
                    self.ledger.record(
                        LedgerKind::Reconcile,
                        &token_id,
                        json!({
                            "absorbed": outcome.absorbed.to_string(),
                            "consumed": outcome.consumed.len(),
                            "aged_out": outcome.aged_out.len(),
                            "drift": outcome.drift.to_string(),
                        }),
                    );
                }
            }
        }

        self.risk.record_success();
        Ok(())
    }

    async fn on_second_tick(&mut self) {
        let now = Utc::now();

        // Markout samples.
        let books = &self.books;
        let markout_rows = self
            .analytics
            .capture_due(now, |token_id| books.mid_price(token_id));
        if !markout_rows.is_empty()
            && let Some(store) = &self.store
            && let Err(e) = store.insert_markouts(&markout_rows).await
        {
            warn!(error = %e, "Failed to persist markouts");
        }

        // Pending fill TTL sweep.
        self.inventory.expire_pending_fills(now);

        // While a gap is outstanding, keep retrying the resync on its
        // own cadence.
        if self.risk.has_unresolved_gap() {
            let interval =
                std::time::Duration::from_secs(self.config.risk.ws_gap_recovery_interval_s);
            let due = self
                .last_gap_recovery_at
                .is_none_or(|at| at.elapsed() >= interval);
            if due {
                self.last_gap_recovery_at = Some(Instant::now());
                match self.reconcile_orders().await {
                    Ok(()) => match self.force_refresh_positions().await {
                        Ok(()) => self.risk.gap_resolved(),
                        Err(e) => warn!(error = %e, "Gap recovery position resync failed"),
                    },
                    Err(e) => warn!(error = %e, "Gap recovery order resync failed"),
                }
            }
        }

        // Feed freshness and state machine ticks.
        let events = self.risk.check_freshness(now);
        self.apply_risk_events(events).await;
        let events = self.risk.tick(now);
        self.apply_risk_events(events).await;

        // Mark-to-mid unrealized P&L per asset with inventory.
        for token_id in self.config.assets.clone() {
            if self.inventory.effective_size(&token_id) != Decimal::ZERO {
                self.update_market_risk_pnl(&token_id).await;
            }
        }

        self.pnl.maybe_log_summary(now, false);

        // Drain the ledger to the store.
        if self.ledger.buffered() > 0 {
            let rows = self.ledger.drain();
            if let Some(store) = &self.store
                && let Err(e) = store.insert_events(&rows).await
            {
                warn!(error = %e, rows = rows.len(), "Failed to persist ledger events");
            }
        }
    }

    // --- Shutdown ---

    async fn shutdown(&mut self) {
        info!("Shutting down: cancelling open orders");
        self.ledger.note(LedgerKind::Lifecycle, "", "shutdown started");

        // Best-effort cancel-all with bounded retry.
        for attempt in 1..=SHUTDOWN_CANCEL_ATTEMPTS {
            let failed = self
                .order_manager
                .cancel_all(&self.config.assets.clone())
                .await;
            if failed.is_empty() {
                break;
            }
            warn!(
                attempt,
                remaining = failed.len(),
                "Shutdown cancel-all incomplete, retrying"
            );
            tokio::time::sleep(TokioDuration::from_secs(1)).await;
        }

        // Stop the streams.
        let _ = self.shutdown_tx.send(());

        // Persist final state.
        let now = Utc::now();
        if let Some(store) = &self.store {
            let rows = self.inventory.snapshot_rows(now);
            if let Err(e) = store.insert_positions(&rows).await {
                warn!(error = %e, "Failed to persist final positions");
            }

            let ledger_rows = self.ledger.drain();
            if let Err(e) = store.insert_events(&ledger_rows).await {
                warn!(error = %e, "Failed to persist final ledger events");
            }

            let status = if self.risk.state() == RiskState::Halted {
                "halted"
            } else {
                "completed"
            };
            if let Err(e) = store.finalize_session(&self.session, status).await {
                warn!(error = %e, "Failed to finalize session");
            }
        }

        self.pnl.maybe_log_summary(now, true);
        info!(
            state = %self.risk.state(),
            "Shutdown complete"
        );
    }
}
