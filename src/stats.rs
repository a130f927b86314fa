use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use serde::Serialize;
use tracing::{info, trace, warn};

/// Number of instantaneous samples kept for the moving average.
pub const WINDOW_LEN: usize = 20;

/// Throughput in bits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BitRate(pub u64);

impl BitRate {
    /// Rate of `bytes` moved over `elapsed`. Zero when no time has passed.
    pub fn from_bytes(bytes: u64, elapsed: Duration) -> Self {
        let nanos = elapsed.as_nanos();
        if nanos == 0 {
            return BitRate(0);
        }
        let bps = (bytes as u128) * 8 * 1_000_000_000 / nanos;
        BitRate(bps.min(u64::MAX as u128) as u64)
    }

    pub fn bps(self) -> u64 {
        self.0
    }
    pub fn mbps(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
    pub fn kbps(self) -> f64 {
        self.0 as f64 / 1_000.0
    }
    pub fn mega_bytes_ps(self) -> f64 {
        self.0 as f64 / 8_000_000.0
    }
    pub fn kilo_bytes_ps(self) -> f64 {
        self.0 as f64 / 8_000.0
    }

    /// Byte rate scaled to KB/s or MB/s.
    pub fn byte_rate(self) -> String {
        if self.0 >= 8_000_000 {
            format!("{:.2} MB/s", self.mega_bytes_ps())
        } else {
            format!("{:.2} KB/s", self.kilo_bytes_ps())
        }
    }
}

/// Bit rate scaled to bps, kbps or Mbps.
impl fmt::Display for BitRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            n if n >= 1_000_000 => write!(f, "{:.2} Mbps", self.mbps()),
            n if n >= 1_000 => write!(f, "{:.2} kbps", self.kbps()),
            n => write!(f, "{n} bps"),
        }
    }
}

/// FIFO of the most recent samples, oldest evicted first.
#[derive(Debug, Clone, Default)]
pub struct SampleWindow {
    samples: VecDeque<BitRate>,
}

impl SampleWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_LEN + 1),
        }
    }
    pub fn push(&mut self, rate: BitRate) {
        self.samples.push_back(rate);
        while self.samples.len() > WINDOW_LEN {
            self.samples.pop_front();
        }
    }
    pub fn len(&self) -> usize {
        self.samples.len()
    }
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
    pub fn average(&self) -> BitRate {
        if self.is_empty() {
            return BitRate(0);
        }
        let sum: u128 = self.samples.iter().map(|r| r.0 as u128).sum();
        BitRate((sum / self.len() as u128) as u64)
    }
}

/// Byte accounting for one measurement: totals, the current interval and the
/// sliding window of interval rates.
#[derive(Debug, Clone)]
pub struct Sampler {
    pub total: u64,
    interval: u64,
    window: SampleWindow,
    t0: Instant,
    last: Instant,
}

impl Sampler {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            total: 0,
            interval: 0,
            window: SampleWindow::new(),
            t0: now,
            last: now,
        }
    }
    pub fn add_bytes(&mut self, n: u64) {
        self.total = self.total.saturating_add(n);
        self.interval = self.interval.saturating_add(n);
    }

    /// Closes the current interval, pushes its rate and returns the window average.
    pub fn sample(&mut self) -> BitRate {
        let now = Instant::now();
        self.window
            .push(BitRate::from_bytes(self.interval, now - self.last));
        self.interval = 0;
        self.last = now;
        self.window.average()
    }

    #[cfg(test)]
    pub fn window(&self) -> &SampleWindow {
        &self.window
    }

    /// Exact session throughput from the running total and wall time.
    pub fn session_average(&self) -> BitRate {
        BitRate::from_bytes(self.total, self.t0.elapsed())
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatStatus {
    Running,
    Stopped,
    Error,
}

/// One throughput report published by the client side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEvent {
    pub status: StatStatus,
    pub test_name: String,
    pub rate: BitRate,
}

impl StatEvent {
    pub fn running(test_name: &str, rate: BitRate) -> Self {
        Self {
            status: StatStatus::Running,
            test_name: test_name.to_string(),
            rate,
        }
    }
    pub fn stopped() -> Self {
        Self {
            status: StatStatus::Stopped,
            test_name: String::new(),
            rate: BitRate(0),
        }
    }
    pub fn error(test_name: String) -> Self {
        Self {
            status: StatStatus::Error,
            test_name,
            rate: BitRate(0),
        }
    }
}

/// Poll-friendly view of a [`StatEvent`], rate in Mbps.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatReport {
    pub status: StatStatus,
    pub test_name: String,
    pub rate: f64,
}

impl StatReport {
    /// Maps a polled event; `None` means the sink is closed.
    pub fn from_polled(event: Option<&StatEvent>) -> Self {
        match event {
            Some(ev) => Self {
                status: ev.status,
                test_name: ev.test_name.clone(),
                rate: ev.rate.mbps(),
            },
            None => Self {
                status: StatStatus::Error,
                test_name: String::new(),
                rate: 0.0,
            },
        }
    }
}

/// Drains `events` until the producer closes it, logging every event and
/// printing Running reports as JSON lines on stdout.
pub fn log_stats(events: Receiver<StatEvent>) {
    for ev in events.iter() {
        match ev.status {
            StatStatus::Running => {
                info!(test = %ev.test_name, bps = ev.rate.bps(), rate = %ev.rate, "rate");
                match serde_json::to_string(&StatReport::from_polled(Some(&ev))) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("stats encode: {e}"),
                }
            }
            StatStatus::Stopped => trace!("idle"),
            StatStatus::Error => warn!(test = %ev.test_name, "test request rejected"),
        }
    }
    info!("stats sink closed");
}
