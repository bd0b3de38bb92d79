use crate::market::binance::{connect_trade_stream, ExchangeWsStream};
use crate::market::history::PriceHistory;
use crate::market::types::{
    parse_trade_payload, ConnectionInfo, ConnectionStatus, Sample, StreamConfig,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOG_EVERY_N_MESSAGES: u64 = 100;

#[derive(Debug)]
pub(crate) struct StatusState {
    pub status: ConnectionStatus,
    pub symbol: Option<String>,
    pub last_update: f64,
    pub started_at: Option<Instant>,
    pub reason: Option<String>,
}

impl Default for StatusState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            symbol: None,
            last_update: 0.0,
            started_at: None,
            reason: Some("stream idle".to_string()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct StreamShared {
    pub history: PriceHistory,
    pub status: RwLock<StatusState>,
    pub epoch: AtomicU64,
    pub message_count: AtomicU64,
    pub error_count: AtomicU64,
}

impl StreamShared {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history: PriceHistory::new(history_capacity),
            status: RwLock::new(StatusState::default()),
            epoch: AtomicU64::new(0),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let status = self.status.read();
        ConnectionInfo {
            status: status.status,
            symbol: status.symbol.clone(),
            error_count: self.error_count.load(Ordering::Relaxed),
            message_count: self.message_count.load(Ordering::Relaxed),
            uptime_secs: status
                .started_at
                .map(|at| at.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            last_update: status.last_update,
            history_len: self.history.len(),
            latest_price: self.history.latest().map(|sample| sample.price),
            reason: status.reason.clone(),
        }
    }
}

// Captured at spawn; a session whose epoch no longer matches the client's
// must neither write samples nor touch the status.
pub(crate) struct SessionGuard {
    shared: Arc<StreamShared>,
    epoch: u64,
    symbol: String,
}

impl SessionGuard {
    pub fn new(shared: Arc<StreamShared>, epoch: u64, symbol: String) -> Self {
        Self {
            shared,
            epoch,
            symbol,
        }
    }

    pub fn shared(&self) -> &StreamShared {
        &self.shared
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn is_current(&self) -> bool {
        if self.shared.epoch.load(Ordering::Acquire) != self.epoch {
            return false;
        }
        let status = self.shared.status.read();
        status.symbol.as_deref() == Some(self.symbol.as_str())
    }

    fn set_status(&self, status: ConnectionStatus, reason: Option<String>) {
        let mut state = self.shared.status.write();
        if self.shared.epoch.load(Ordering::Acquire) != self.epoch {
            return;
        }
        state.status = status;
        state.reason = reason;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyOutcome {
    Applied,
    StaleSession,
}

pub(crate) fn apply_trade(guard: &SessionGuard, sample: Sample, now_secs: f64) -> ApplyOutcome {
    let shared = guard.shared();
    {
        // Epoch check and append under the status write lock, so a
        // concurrent start/stop cannot interleave between them.
        let mut status = shared.status.write();
        if shared.epoch.load(Ordering::Acquire) != guard.epoch
            || status.symbol.as_deref() != Some(guard.symbol.as_str())
        {
            return ApplyOutcome::StaleSession;
        }
        shared.history.append(sample);
        status.last_update = now_secs;
    }

    let count = shared.message_count.fetch_add(1, Ordering::Relaxed) + 1;
    if count == 1 || count % LOG_EVERY_N_MESSAGES == 0 {
        debug!(
            symbol = %guard.symbol(),
            price = sample.price,
            message = count,
            "trade sample applied"
        );
    }
    ApplyOutcome::Applied
}

enum StreamEnd {
    Cancelled,
    SessionReplaced,
    RemoteClosed,
    TransportError(Box<tokio_tungstenite::tungstenite::Error>),
    Stalled,
}

pub(crate) async fn run_price_stream(
    shared: Arc<StreamShared>,
    config: StreamConfig,
    symbol: String,
    epoch: u64,
    cancel_token: CancellationToken,
) {
    let guard = SessionGuard::new(shared, epoch, symbol.clone());
    let mut backoff = Backoff::new(
        Duration::from_millis(config.initial_backoff_ms),
        Duration::from_millis(config.max_backoff_ms),
    );

    while !cancel_token.is_cancelled() && guard.is_current() {
        guard.set_status(
            ConnectionStatus::Connecting,
            Some("opening websocket stream".to_string()),
        );

        match connect_trade_stream(&config.stream_base_url, &symbol).await {
            Ok(stream) => {
                backoff.reset();
                guard.set_status(
                    ConnectionStatus::Connected,
                    Some("websocket connected".to_string()),
                );
                info!(symbol = %symbol, "trade stream connected");

                match stream_messages(stream, &guard, &config, &cancel_token).await {
                    StreamEnd::Cancelled => break,
                    StreamEnd::SessionReplaced => {
                        debug!(symbol = %symbol, "session replaced, not reconnecting");
                        return;
                    }
                    StreamEnd::RemoteClosed => {
                        guard.shared().error_count.fetch_add(1, Ordering::Relaxed);
                        warn!(symbol = %symbol, "trade stream closed by remote");
                        guard.set_status(
                            ConnectionStatus::Reconnecting,
                            Some("connection closed by remote".to_string()),
                        );
                    }
                    StreamEnd::TransportError(error) => {
                        guard.shared().error_count.fetch_add(1, Ordering::Relaxed);
                        warn!(symbol = %symbol, error = %error, "trade stream transport error");
                        guard.set_status(
                            ConnectionStatus::Reconnecting,
                            Some(format!("transport error: {error}")),
                        );
                    }
                    StreamEnd::Stalled => {
                        guard.shared().error_count.fetch_add(1, Ordering::Relaxed);
                        warn!(symbol = %symbol, "trade stream stalled, no frames within keep-alive window");
                        guard.set_status(
                            ConnectionStatus::Reconnecting,
                            Some("keep-alive window elapsed without frames".to_string()),
                        );
                    }
                }
            }
            Err(error) => {
                guard.shared().error_count.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %symbol, error = %error, "trade stream connect failed");
                guard.set_status(
                    ConnectionStatus::Error,
                    Some(format!("connect failed: {error}")),
                );
            }
        }

        if cancel_token.is_cancelled() || !guard.is_current() {
            break;
        }

        let delay = backoff.next_delay();
        debug!(symbol = %symbol, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // stop() already published Disconnected; a replaced session must not
    // touch the new session's status, which set_status enforces.
    guard.set_status(
        ConnectionStatus::Disconnected,
        Some("stream task exited".to_string()),
    );
    debug!(symbol = %symbol, "stream task finished");
}

enum LoopTurn {
    Cancelled,
    PingDue,
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

async fn stream_messages(
    mut stream: ExchangeWsStream,
    guard: &SessionGuard,
    config: &StreamConfig,
    cancel_token: &CancellationToken,
) -> StreamEnd {
    let ping_interval = Duration::from_millis(config.ping_interval_ms);
    let idle_limit = ping_interval + Duration::from_millis(config.ping_timeout_ms);
    let mut ping_tick =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_rx = Instant::now();

    loop {
        let turn = tokio::select! {
            _ = cancel_token.cancelled() => LoopTurn::Cancelled,
            _ = ping_tick.tick() => LoopTurn::PingDue,
            frame = stream.next() => LoopTurn::Frame(frame),
        };

        match turn {
            LoopTurn::Cancelled => return StreamEnd::Cancelled,
            LoopTurn::PingDue => {
                if last_rx.elapsed() > idle_limit {
                    return StreamEnd::Stalled;
                }
                if let Err(error) = stream.send(Message::Ping(Vec::new())).await {
                    return StreamEnd::TransportError(Box::new(error));
                }
            }
            LoopTurn::Frame(None) => return StreamEnd::RemoteClosed,
            LoopTurn::Frame(Some(Err(error))) => {
                return StreamEnd::TransportError(Box::new(error))
            }
            LoopTurn::Frame(Some(Ok(message))) => {
                last_rx = Instant::now();
                if !guard.is_current() {
                    return StreamEnd::SessionReplaced;
                }
                match handle_message(message, guard) {
                    MessageDirective::Continue => {}
                    MessageDirective::Closed => return StreamEnd::RemoteClosed,
                    MessageDirective::Replaced => return StreamEnd::SessionReplaced,
                }
            }
        }
    }
}

enum MessageDirective {
    Continue,
    Closed,
    Replaced,
}

fn handle_message(message: Message, guard: &SessionGuard) -> MessageDirective {
    match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            ingest_frame(owned_payload.as_mut_slice(), guard)
        }
        Message::Binary(mut binary_payload) => ingest_frame(binary_payload.as_mut_slice(), guard),
        Message::Close(_) => MessageDirective::Closed,
        // Inbound pings are answered by the protocol layer on the next poll.
        _ => MessageDirective::Continue,
    }
}

fn ingest_frame(payload: &mut [u8], guard: &SessionGuard) -> MessageDirective {
    match parse_trade_payload(payload) {
        Ok(sample) => match apply_trade(guard, sample, now_unix_secs()) {
            ApplyOutcome::Applied => MessageDirective::Continue,
            ApplyOutcome::StaleSession => MessageDirective::Replaced,
        },
        Err(error) => {
            // A bad frame is dropped; it never tears the connection down.
            warn!(symbol = %guard.symbol(), error = %error, "skipping malformed trade frame");
            MessageDirective::Continue
        }
    }
}

#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

pub(crate) fn now_unix_secs() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs_f64(),
        Err(_) => 0.0,
    }
}
