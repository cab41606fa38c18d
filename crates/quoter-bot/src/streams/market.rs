//! Public market channel task.
//!
//! Connects to the market WebSocket, subscribes to the configured token
//! set, and forwards parsed events to the engine queue. Reconnects with
//! exponential backoff; each disconnect is reported so book state can be
//! marked stale until the next snapshot.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use quoter_exchange::types::SubscribeMessage;

use super::{EngineEvent, MarketStreamEvent, StreamError, parse_market_frame};
use crate::config::WebSocketConfig;

/// Public market channel task.
pub struct MarketStream {
    config: WebSocketConfig,
    assets: Vec<String>,
}

impl MarketStream {
    pub fn new(config: WebSocketConfig, assets: Vec<String>) -> Self {
        Self { config, assets }
    }

    /// Run with automatic reconnection until shutdown.
    pub async fn run(
        self,
        tx: mpsc::Sender<EngineEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), StreamError> {
        let mut reconnect_delay = Duration::from_secs(1);
        let max_reconnect_delay = Duration::from_secs(self.config.max_reconnect_delay_s);

        loop {
            if shutdown.try_recv().is_ok() {
                info!("Market stream: shutdown signal received");
                return Ok(());
            }

            match self.run_session(&tx, &mut shutdown).await {
                Ok(()) => {
                    info!("Market stream: clean shutdown");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Market stream error: {e}, reconnecting in {:?}",
                        reconnect_delay
                    );

                    if tx
                        .send(EngineEvent::Market(MarketStreamEvent::Disconnected(
                            e.to_string(),
                        )))
                        .await
                        .is_err()
                    {
                        return Err(StreamError::ChannelClosed);
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_delay) => {}
                        _ = shutdown.recv() => {
                            info!("Market stream: shutdown during reconnect delay");
                            return Ok(());
                        }
                    }

                    reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
                }
            }
        }
    }

    /// Run a single WebSocket session.
    async fn run_session(
        &self,
        tx: &mpsc::Sender<EngineEvent>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), StreamError> {
        info!("Connecting to market WebSocket at {}", self.config.market_url);

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_s);
        let connect_result =
            timeout(connect_timeout, connect_async(self.config.market_url.as_str())).await;

        let (ws_stream, _) = match connect_result {
            Ok(Ok((stream, response))) => (stream, response),
            Ok(Err(e)) => return Err(StreamError::Connection(e.to_string())),
            Err(_) => return Err(StreamError::Timeout),
        };

        info!("Connected to market WebSocket");

        let (mut write, mut read) = ws_stream.split();

        let subscribe = SubscribeMessage {
            assets_ids: self.assets.clone(),
            msg_type: "market",
        };
        let msg =
            serde_json::to_string(&subscribe).map_err(|e| StreamError::WebSocket(e.to_string()))?;
        write
            .send(Message::Text(msg))
            .await
            .map_err(|e| StreamError::WebSocket(e.to_string()))?;
        info!("Subscribed to {} market tokens", self.assets.len());

        if tx
            .send(EngineEvent::Market(MarketStreamEvent::Connected))
            .await
            .is_err()
        {
            return Err(StreamError::ChannelClosed);
        }

        let mut ping_timer = interval(Duration::from_secs(self.config.ping_interval_s));

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for event in parse_market_frame(&text) {
                                if tx.send(EngineEvent::Market(event)).await.is_err() {
                                    return Err(StreamError::ChannelClosed);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await
                                .map_err(|e| StreamError::WebSocket(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Market WebSocket closed by server: {:?}", frame);
                            return Err(StreamError::StreamEnded);
                        }
                        Some(Err(e)) => {
                            return Err(StreamError::WebSocket(e.to_string()));
                        }
                        None => {
                            return Err(StreamError::StreamEnded);
                        }
                        _ => {}
                    }
                }
                _ = ping_timer.tick() => {
                    write.send(Message::Text("PING".to_string())).await
                        .map_err(|e| StreamError::WebSocket(e.to_string()))?;
                }
                _ = shutdown.recv() => {
                    info!("Market stream: shutdown signal received");
                    return Ok(());
                }
            }
        }
    }
}
