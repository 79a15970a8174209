//! Reconnecting WebSocket runner.
//!
//! Per-exchange behaviour is a small capability set ([`ExchangeStream`]);
//! the runner owns the connection lifecycle: dial, subscribe, receive,
//! application-level ping, exponential-backoff reconnect and gap recovery.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Base reconnect delay.
const RECONNECT_DELAY_BASE: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(60);
/// Application-level ping cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Tear the connection when a ping goes unanswered this long.
const PING_TIMEOUT: Duration = Duration::from_secs(10);
/// Downtime beyond this triggers the gap-recovery hook.
const GAP_THRESHOLD: Duration = Duration::from_secs(5);

/// Exchange-specific behaviour plugged into the runner.
#[async_trait]
pub trait ExchangeStream: Send {
    fn name(&self) -> &'static str;

    fn url(&self) -> &str;

    /// Subscription frames sent after every (re)connect and on re-subscribe.
    fn subscription_payloads(&self) -> Vec<String>;

    /// Handle one inbound text frame. Hot path: parsing only, no I/O.
    fn on_message(&mut self, text: &str);

    /// Recovery after a reconnect (e.g. invalidate delta-based caches).
    fn on_reconnected(&mut self);

    /// REST backfill hook, invoked when downtime exceeded the gap threshold.
    async fn fetch_gap(&mut self, gap_seconds: f64);
}

/// Commands accepted by a running collector.
#[derive(Debug)]
pub enum CollectorCommand {
    /// Re-send the subscription payloads (after a market was added).
    Resubscribe,
    /// Close the socket and stop the runner.
    Close,
}

/// Connection-state observability shared with the health monitor.
#[derive(Debug, Default)]
pub struct ConnState {
    connected: AtomicBool,
    /// Unix millis of the last inbound frame; 0 = never.
    last_msg_ms: AtomicU64,
}

impl ConnState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Last message time as Unix seconds (0.0 = never).
    pub fn last_msg_time(&self) -> f64 {
        self.last_msg_ms.load(Ordering::Relaxed) as f64 / 1000.0
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    fn touch(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.last_msg_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// Handle for everything outside the runner task: health, listing monitor
/// (dynamic subscription) and the shutdown sequence.
#[derive(Clone)]
pub struct CollectorHandle {
    pub name: &'static str,
    state: Arc<ConnState>,
    markets: Arc<RwLock<Vec<String>>>,
    cmd_tx: mpsc::UnboundedSender<CollectorCommand>,
}

impl CollectorHandle {
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn last_msg_time(&self) -> f64 {
        self.state.last_msg_time()
    }

    pub fn market_count(&self) -> usize {
        self.markets.read().len()
    }

    /// Append a market and re-subscribe. Idempotent.
    pub fn add_market(&self, market: &str) {
        {
            let mut markets = self.markets.write();
            if markets.iter().any(|m| m == market) {
                return;
            }
            markets.push(market.to_string());
            info!(collector = self.name, market, total = markets.len(), "market added");
        }
        let _ = self.cmd_tx.send(CollectorCommand::Resubscribe);
    }

    /// Request a graceful close of the socket and runner.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(CollectorCommand::Close);
    }
}

enum SessionEnd {
    Closed,
    Disconnected,
}

/// Connection lifecycle driver for one [`ExchangeStream`].
pub struct WsRunner<S: ExchangeStream> {
    stream: S,
    state: Arc<ConnState>,
    cmd_rx: mpsc::UnboundedReceiver<CollectorCommand>,
}

impl<S: ExchangeStream> WsRunner<S> {
    /// Pair a runner with its external handle.
    pub fn new(stream: S, markets: Arc<RwLock<Vec<String>>>) -> (Self, CollectorHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnState::default());
        let handle = CollectorHandle {
            name: stream.name(),
            state: state.clone(),
            markets,
            cmd_tx,
        };
        (Self { stream, state, cmd_rx }, handle)
    }

    /// Main loop: connect, stream, reconnect with backoff until closed.
    pub async fn run(mut self) {
        let mut delay = RECONNECT_DELAY_BASE;
        let mut disconnect_at: Option<Instant> = None;

        loop {
            match self.connect_and_stream(&mut disconnect_at).await {
                Ok(SessionEnd::Closed) => {
                    info!(collector = self.stream.name(), "collector closed");
                    break;
                }
                Ok(SessionEnd::Disconnected) => {
                    // Connect + subscribe succeeded, so the backoff resets.
                    delay = RECONNECT_DELAY_BASE;
                    self.state.set_connected(false);
                    disconnect_at = Some(Instant::now());
                    warn!(
                        collector = self.stream.name(),
                        retry_in_s = delay.as_secs(),
                        "connection lost, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.state.set_connected(false);
                    if disconnect_at.is_none() {
                        disconnect_at = Some(Instant::now());
                    }
                    warn!(
                        collector = self.stream.name(),
                        error = %e,
                        retry_in_s = delay.as_secs(),
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RECONNECT_DELAY_MAX);
                }
            }
        }
    }

    async fn connect_and_stream(
        &mut self,
        disconnect_at: &mut Option<Instant>,
    ) -> anyhow::Result<SessionEnd> {
        let url = self.stream.url().to_string();
        info!(collector = self.stream.name(), url = %url, "connecting");
        let (ws, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws.split();

        for payload in self.stream.subscription_payloads() {
            write.send(Message::Text(payload)).await?;
        }
        self.state.set_connected(true);
        info!(collector = self.stream.name(), "connected and subscribed");

        // Reconnect recovery: cache reset + REST backfill for long gaps.
        if let Some(lost_at) = disconnect_at.take() {
            let gap = lost_at.elapsed();
            self.stream.on_reconnected();
            if gap >= GAP_THRESHOLD {
                info!(
                    collector = self.stream.name(),
                    gap_s = gap.as_secs_f64(),
                    "gap recovery"
                );
                self.stream.fetch_gap(gap.as_secs_f64()).await;
            } else {
                debug!(
                    collector = self.stream.name(),
                    gap_s = gap.as_secs_f64(),
                    "gap below threshold, recovery skipped"
                );
            }
        }

        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.reset();
        let mut awaiting_pong_since: Option<Instant> = None;

        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Ok(SessionEnd::Disconnected);
                    };
                    // Any inbound frame proves liveness.
                    awaiting_pong_since = None;
                    match msg {
                        Ok(Message::Text(text)) => {
                            self.state.touch();
                            self.stream.on_message(&text);
                        }
                        Ok(Message::Binary(data)) => {
                            self.state.touch();
                            if let Ok(text) = std::str::from_utf8(&data) {
                                self.stream.on_message(text);
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Pong(_)) => {}
                        Ok(Message::Close(_)) => return Ok(SessionEnd::Disconnected),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(collector = self.stream.name(), error = %e, "receive error");
                            return Ok(SessionEnd::Disconnected);
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(CollectorCommand::Resubscribe) => {
                            for payload in self.stream.subscription_payloads() {
                                write.send(Message::Text(payload)).await?;
                            }
                            info!(collector = self.stream.name(), "re-subscribed");
                        }
                        Some(CollectorCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            self.state.set_connected(false);
                            return Ok(SessionEnd::Closed);
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    if let Some(since) = awaiting_pong_since {
                        if since.elapsed() >= PING_TIMEOUT {
                            warn!(collector = self.stream.name(), "ping timeout, tearing connection");
                            return Ok(SessionEnd::Disconnected);
                        }
                    }
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return Ok(SessionEnd::Disconnected);
                    }
                    awaiting_pong_since = Some(Instant::now());
                }
            }
        }
    }
}
