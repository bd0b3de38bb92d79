use crate::market::types::Sample;
use parking_lot::Mutex;
use std::collections::VecDeque;

// Appends and reads go through one lock, so a snapshot can never observe a
// half-appended sample or timestamp/price vectors of different lengths.
#[derive(Debug)]
pub struct PriceHistory {
    capacity: usize,
    inner: Mutex<VecDeque<Sample>>,
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, sample: Sample) {
        let mut inner = self.inner.lock();
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(sample);
    }

    pub fn snapshot(&self) -> (Vec<f64>, Vec<f64>) {
        let inner = self.inner.lock();
        let mut timestamps = Vec::with_capacity(inner.len());
        let mut prices = Vec::with_capacity(inner.len());
        for sample in inner.iter() {
            timestamps.push(sample.ts);
            prices.push(sample.price);
        }
        (timestamps, prices)
    }

    pub fn latest(&self) -> Option<Sample> {
        self.inner.lock().back().copied()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn change_over(&self, window_seconds: f64) -> Option<f64> {
        let inner = self.inner.lock();
        if inner.len() < 2 {
            return None;
        }

        let latest = *inner.back()?;
        for sample in inner.iter().rev().skip(1) {
            if latest.ts - sample.ts >= window_seconds {
                return Some((latest.price - sample.price) / sample.price * 100.0);
            }
        }
        None
    }
}
