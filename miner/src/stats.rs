use colored::*;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

// ═══════════════════════════════════════════════════════════════════════
// RATE AGGREGATION — per-index sliding windows, total = sum of averages
// ═══════════════════════════════════════════════════════════════════════

struct RateWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RateWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, khash: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(khash);
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// Samples are keyed by kernel and an optional thread/device index within it.
type RateKey = (usize, Option<usize>);

/// Throughput samples per reporting source.
pub struct RateAggregator {
    window: usize,
    windows: HashMap<RateKey, RateWindow>,
}

impl RateAggregator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            windows: HashMap::new(),
        }
    }

    /// Record a sample in kH/s and return the new total.
    pub fn update(&mut self, khash: f64, kernel: usize, index: Option<usize>) -> f64 {
        let window = self.window;
        self.windows
            .entry((kernel, index))
            .or_insert_with(|| RateWindow::new(window))
            .push(khash.max(0.0));
        self.total()
    }

    pub fn total(&self) -> f64 {
        self.windows.values().map(RateWindow::average).sum()
    }

    /// Drop every window belonging to `kernel`.
    pub fn forget(&mut self, kernel: usize) {
        self.windows.retain(|(k, _), _| *k != kernel);
    }

    pub fn reset(&mut self) {
        self.windows.clear();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// MINER STATS
// ═══════════════════════════════════════════════════════════════════════

pub struct MinerStats {
    start_time: Instant,
    shares_accepted: u64,
    shares_rejected: u64,
    rates: RateAggregator,
    backend: String,
    connected: bool,
    idle: bool,
    last_event: Option<String>,
}

impl MinerStats {
    pub fn new(sample_window: usize) -> Self {
        Self {
            start_time: Instant::now(),
            shares_accepted: 0,
            shares_rejected: 0,
            rates: RateAggregator::new(sample_window),
            backend: String::new(),
            connected: false,
            idle: false,
            last_event: None,
        }
    }

    // ──── Connection state ────

    pub fn set_backend(&mut self, name: &str) {
        self.backend = name.to_string();
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn set_idle(&mut self, idle: bool) {
        self.idle = idle;
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn set_event(&mut self, msg: String) {
        self.last_event = Some(msg);
    }

    // ──── Rate tracking ────

    pub fn update_rate(&mut self, khash: f64, kernel: usize, index: Option<usize>) -> f64 {
        self.rates.update(khash, kernel, index)
    }

    /// Stop counting a kernel that is no longer running.
    pub fn remove_kernel(&mut self, kernel: usize) {
        self.rates.forget(kernel);
    }

    /// Aggregate rate in kH/s
    pub fn rate(&self) -> f64 {
        self.rates.total()
    }

    // ──── Share tracking ────

    pub fn share_accepted(&mut self) {
        self.shares_accepted += 1;
        self.set_event(format!(
            "accepted {}/{} ({})",
            self.shares_accepted,
            self.shares_rejected,
            self.share_pct()
        ));
    }

    pub fn share_rejected(&mut self) {
        self.shares_rejected += 1;
        self.set_event(format!(
            "rejected {}/{} ({})",
            self.shares_accepted,
            self.shares_rejected,
            self.share_pct()
        ));
    }

    pub fn shares_accepted(&self) -> u64 {
        self.shares_accepted
    }

    pub fn shares_rejected(&self) -> u64 {
        self.shares_rejected
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    // ──── Formatting helpers ────

    /// Format a rate given in kH/s.
    pub fn fmt_rate(khash: f64) -> String {
        let h = khash * 1e3;
        if h >= 1e12 {
            format!("{:.2} TH/s", h / 1e12)
        } else if h >= 1e9 {
            format!("{:.2} GH/s", h / 1e9)
        } else if h >= 1e6 {
            format!("{:.2} MH/s", h / 1e6)
        } else if h >= 1e3 {
            format!("{:.2} kH/s", h / 1e3)
        } else {
            format!("{:.1} H/s", h)
        }
    }

    fn fmt_uptime(secs: u64) -> String {
        let d = secs / 86400;
        let h = (secs % 86400) / 3600;
        let m = (secs % 3600) / 60;
        let s = secs % 60;
        if d > 0 {
            format!("{}d {:02}:{:02}:{:02}", d, h, m, s)
        } else {
            format!("{:02}:{:02}:{:02}", h, m, s)
        }
    }

    fn share_pct(&self) -> String {
        let total = self.shares_accepted + self.shares_rejected;
        if total == 0 {
            return "-".to_string();
        }
        let pct = (self.shares_accepted as f64 / total as f64) * 100.0;
        format!("{:.1}%", pct)
    }

    /// One-line status summary for the periodic log.
    pub fn status_line(&self) -> String {
        let state = if !self.connected {
            "disconnected".bright_red()
        } else if self.idle {
            "idle".bright_yellow()
        } else {
            "mining".bright_green()
        };
        let rate = if self.idle {
            "-".to_string()
        } else {
            Self::fmt_rate(self.rate())
        };

        format!(
            "[{}] {} {}  A: {}  R: {}  up {}  {}",
            state,
            rate.bright_cyan().bold(),
            self.backend.bright_white(),
            self.shares_accepted.to_string().bright_green().bold(),
            self.shares_rejected.to_string().bright_red(),
            Self::fmt_uptime(self.uptime_seconds()),
            self.last_event.as_deref().unwrap_or("").bright_black(),
        )
    }
}

impl Default for MinerStats {
    fn default() -> Self {
        Self::new(10)
    }
}
