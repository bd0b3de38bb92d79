use crate::error::StreamError;
use crate::market::pipeline::{now_unix_secs, run_price_stream, StreamShared};
use crate::market::reader::StreamReader;
use crate::market::types::{normalize_symbol, ConnectionInfo, ConnectionStatus, StreamConfig};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct StreamSession {
    symbol: String,
    cancel_token: CancellationToken,
    _join_handle: JoinHandle<()>,
}

pub struct PriceStreamClient {
    config: StreamConfig,
    shared: Arc<StreamShared>,
    session: Mutex<Option<StreamSession>>,
    runtime: Handle,
}

impl PriceStreamClient {
    // Must be called from within a tokio runtime; use with_runtime otherwise.
    pub fn new(config: StreamConfig) -> Self {
        Self::with_runtime(config, Handle::current())
    }

    pub fn with_runtime(config: StreamConfig, runtime: Handle) -> Self {
        let shared = Arc::new(StreamShared::new(config.history_capacity));
        Self {
            config,
            shared,
            session: Mutex::new(None),
            runtime,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn start(&self, symbol: &str) -> Result<(), StreamError> {
        let stream_symbol = normalize_symbol(symbol)?;
        let mut session_slot = self.session.lock();

        if let Some(session) = session_slot.as_ref() {
            if session.symbol == stream_symbol && !session.cancel_token.is_cancelled() {
                debug!(symbol = %stream_symbol, "stream already running");
                return Ok(());
            }
        }

        if let Some(old_session) = session_slot.take() {
            // Signal only; the epoch bump below fences the old writer, so
            // there is no need to wait for it to unwind.
            old_session.cancel_token.cancel();
        }

        let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut status = self.shared.status.write();
            status.status = ConnectionStatus::Connecting;
            status.symbol = Some(stream_symbol.clone());
            status.last_update = now_unix_secs();
            status.started_at = Some(Instant::now());
            status.reason = Some("opening websocket stream".to_string());
            self.shared.history.clear();
            self.shared.message_count.store(0, Ordering::Relaxed);
            self.shared.error_count.store(0, Ordering::Relaxed);
        }

        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();
        let task_shared = Arc::clone(&self.shared);
        let task_config = self.config.clone();
        let task_symbol = stream_symbol.clone();
        let join_handle = self.runtime.spawn(async move {
            run_price_stream(task_shared, task_config, task_symbol, epoch, task_token).await;
        });

        *session_slot = Some(StreamSession {
            symbol: stream_symbol.clone(),
            cancel_token,
            _join_handle: join_handle,
        });
        info!(symbol = %stream_symbol, "price stream started");
        Ok(())
    }

    pub fn stop(&self) {
        let mut session_slot = self.session.lock();
        let had_session = session_slot.is_some();

        if let Some(session) = session_slot.take() {
            session.cancel_token.cancel();
        }

        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        {
            let mut status = self.shared.status.write();
            status.status = ConnectionStatus::Disconnected;
            status.symbol = None;
            status.started_at = None;
            status.reason = Some("stream stopped".to_string());
            self.shared.history.clear();
        }

        if had_session {
            info!("price stream stopped");
        }
    }

    pub fn latest_price(&self) -> Option<f64> {
        self.shared.history.latest().map(|sample| sample.price)
    }

    pub fn series(&self) -> (Vec<f64>, Vec<f64>) {
        self.shared.history.snapshot()
    }

    pub fn price_change(&self, window_seconds: f64) -> Option<f64> {
        self.shared.history.change_over(window_seconds)
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.shared.connection_info()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.read().status
    }

    pub fn current_symbol(&self) -> Option<String> {
        self.shared.status.read().symbol.clone()
    }

    pub fn reader(&self) -> StreamReader {
        StreamReader::new(Arc::clone(&self.shared))
    }
}

impl Drop for PriceStreamClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel_token.cancel();
        }
    }
}
