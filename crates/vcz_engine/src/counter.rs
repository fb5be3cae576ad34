use std::sync::atomic::{AtomicU64, Ordering};

use tokio::{sync::Mutex, time::Instant};

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

/// Counter of the bytes that went through the engine.
///
/// `written` counts every block stored, `verified` the bytes of pieces that
/// passed the hash check, and `wasted` the bytes of pieces that failed it and
/// must be downloaded again.
#[derive(Debug)]
pub struct Counter {
    pub total_written: AtomicU64,
    pub total_verified: AtomicU64,
    pub total_wasted: AtomicU64,

    /// Smoothed write rate in bytes per second.
    pub write_rate: AtomicU64,

    window_written: AtomicU64,
    last_update: Mutex<Instant>,
    ema_write: Mutex<f64>,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_written: AtomicU64::new(0),
            total_verified: AtomicU64::new(0),
            total_wasted: AtomicU64::new(0),
            write_rate: AtomicU64::new(0),
            window_written: AtomicU64::new(0),
            last_update: Mutex::new(Instant::now()),
            ema_write: Mutex::new(0.0),
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, bytes: u64) {
        self.total_written.fetch_add(bytes, Ordering::Relaxed);
        self.window_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_verified(&self, bytes: u64) {
        self.total_verified.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_wasted(&self, bytes: u64) {
        self.total_wasted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn written(&self) -> u64 {
        self.total_written.load(Ordering::Relaxed)
    }

    pub fn verified(&self) -> u64 {
        self.total_verified.load(Ordering::Relaxed)
    }

    pub fn wasted(&self) -> u64 {
        self.total_wasted.load(Ordering::Relaxed)
    }

    /// Update the write rate with EMA smoothing.
    pub async fn update_rates(&self) {
        let now = Instant::now();
        let mut last_update = self.last_update.lock().await;
        let elapsed = now.duration_since(*last_update).as_secs_f64();

        // at least 1ms between updates
        if elapsed < 0.001 {
            return;
        }

        let written = self.window_written.swap(0, Ordering::Relaxed);
        let rate = written as f64 / elapsed;

        let mut ema = self.ema_write.lock().await;
        *ema = if *ema == 0.0 {
            rate
        } else {
            EMA_ALPHA * rate + (1.0 - EMA_ALPHA) * *ema
        };

        self.write_rate.store(*ema as u64, Ordering::Relaxed);
        *last_update = now;
    }
}
