use crate::market::pipeline::StreamShared;
use crate::market::types::{ConnectionInfo, ConnectionStatus};
use std::sync::Arc;

// Read-only facade handed to the polling render loop. Every call copies out
// and returns immediately; before the first message the sentinels are
// None/empty rather than errors.
#[derive(Clone)]
pub struct StreamReader {
    shared: Arc<StreamShared>,
}

impl StreamReader {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    pub fn latest_price(&self) -> Option<f64> {
        self.shared.history.latest().map(|sample| sample.price)
    }

    pub fn series(&self) -> (Vec<f64>, Vec<f64>) {
        self.shared.history.snapshot()
    }

    pub fn change(&self, window_seconds: f64) -> Option<f64> {
        self.shared.history.change_over(window_seconds)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.read().status
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.shared.connection_info()
    }
}
