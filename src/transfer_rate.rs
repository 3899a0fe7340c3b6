use tokio::time::{Duration, Instant};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const NEW_SAMPLE_WEIGHT: f64 = 0.25;

/// Exponentially smoothed throughput of a session, for logging
#[derive(Debug, Default)]
pub struct TransferRate {
    sample_start: Option<Instant>,
    bytes_in_sample: u64,
    total_bytes: u64,
    smoothed_bytes_per_second: Option<f64>,
}

impl TransferRate {
    pub fn on_bytes(&mut self, num_bytes: u64, now: Instant) {
        let sample_start = *self.sample_start.get_or_insert(now);

        self.total_bytes += num_bytes;
        self.bytes_in_sample += num_bytes;

        let elapsed = now.saturating_duration_since(sample_start);
        if elapsed < SAMPLE_INTERVAL {
            return;
        }

        let sample = self.bytes_in_sample as f64 / elapsed.as_secs_f64();
        self.smoothed_bytes_per_second = Some(match self.smoothed_bytes_per_second {
            None => sample,
            Some(previous) => previous + NEW_SAMPLE_WEIGHT * (sample - previous),
        });

        self.bytes_in_sample = 0;
        self.sample_start = Some(now);
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.smoothed_bytes_per_second.unwrap_or(0.0)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
