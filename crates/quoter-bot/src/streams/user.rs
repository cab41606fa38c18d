//! Authenticated user channel task.
//!
//! Carries the operator's own order updates and fills. A disconnect here
//! is a hard fault: without this channel fills cannot be tracked, so the
//! orchestrator halts until the channel is back and reconciled. Sequence
//! numbers, where the exchange provides them, are tracked per session and
//! gaps are reported.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use quoter_exchange::types::{UserAuth, UserSubscribeMessage};

use super::{EngineEvent, StreamError, UserStreamEvent, parse_user_frame};
use crate::config::{Credentials, WebSocketConfig};

/// Authenticated user channel task.
pub struct UserStream {
    config: WebSocketConfig,
    credentials: Credentials,
}

impl UserStream {
    pub fn new(config: WebSocketConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
        }
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
                info!("User stream: shutdown signal received");
                return Ok(());
            }

            match self.run_session(&tx, &mut shutdown).await {
                Ok(()) => {
                    info!("User stream: clean shutdown");
                    return Ok(());
                }
                Err(e) => {
                    warn!("User stream error: {e}, reconnecting in {:?}", reconnect_delay);

                    if tx
                        .send(EngineEvent::User(UserStreamEvent::Disconnected(
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
                            info!("User stream: shutdown during reconnect delay");
                            return Ok(());
                        }
                    }

                    reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
                }
            }
        }
    }

    /// Run a single authenticated session.
    async fn run_session(
        &self,
        tx: &mpsc::Sender<EngineEvent>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), StreamError> {
        info!("Connecting to user WebSocket at {}", self.config.user_url);

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_s);
        let connect_result =
            timeout(connect_timeout, connect_async(self.config.user_url.as_str())).await;

        let (ws_stream, _) = match connect_result {
            Ok(Ok((stream, response))) => (stream, response),
            Ok(Err(e)) => return Err(StreamError::Connection(e.to_string())),
            Err(_) => return Err(StreamError::Timeout),
        };

        info!("Connected to user WebSocket");

        let (mut write, mut read) = ws_stream.split();

        let auth = UserSubscribeMessage {
            msg_type: "user",
            auth: UserAuth {
                api_key: self.credentials.api_key.clone().unwrap_or_default(),
                secret: self.credentials.api_secret.clone().unwrap_or_default(),
                passphrase: self.credentials.api_passphrase.clone().unwrap_or_default(),
            },
        };
        let msg = serde_json::to_string(&auth).map_err(|e| StreamError::WebSocket(e.to_string()))?;
        write
            .send(Message::Text(msg))
            .await
            .map_err(|e| StreamError::WebSocket(e.to_string()))?;
        debug!("Sent user channel authentication");

        if tx
            .send(EngineEvent::User(UserStreamEvent::Connected))
            .await
            .is_err()
        {
            return Err(StreamError::ChannelClosed);
        }

        let mut ping_timer = interval(Duration::from_secs(self.config.ping_interval_s));
        // Sequence tracking is per session; a reconnect resets it.
        let mut last_seq: Option<u64> = None;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let (events, frame_seq) = parse_user_frame(&text);

                            if let Some(got) = frame_seq {
                                if let Some(last) = last_seq
                                    && got > last + 1
                                {
                                    warn!(
                                        expected = last + 1,
                                        got,
                                        "User channel sequence gap"
                                    );
                                    if tx.send(EngineEvent::User(UserStreamEvent::SequenceGap {
                                        expected: last + 1,
                                        got,
                                    })).await.is_err() {
                                        return Err(StreamError::ChannelClosed);
                                    }
                                }
                                if got > last_seq.unwrap_or(0) {
                                    last_seq = Some(got);
                                }
                            }

                            for event in events {
                                if tx.send(EngineEvent::User(event)).await.is_err() {
                                    return Err(StreamError::ChannelClosed);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await
                                .map_err(|e| StreamError::WebSocket(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("User WebSocket closed by server: {:?}", frame);
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
                    info!("User stream: shutdown signal received");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_stream_construction() {
        let stream = UserStream::new(
            WebSocketConfig::default(),
            Credentials {
                api_key: Some("k".to_string()),
                api_secret: Some("s".to_string()),
                api_passphrase: Some("p".to_string()),
            },
        );
        assert!(stream.credentials.is_complete());
    }
}
