//! Adaptive bitrate control
//!
//! Watches a sliding window of network metrics and adjusts chunk-size tier,
//! target rate, and send concurrency: additive increase on sustained health,
//! immediate multiplicative decrease on any congestion signal.

use crate::crypto::AEAD_TAG_LEN;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Chunk-size tier ladder for local/low-latency links
pub const LOCAL_TIERS: &[usize] = &[
    512 * 1024,
    1024 * 1024,
    2 * 1024 * 1024,
    4 * 1024 * 1024,
];

/// Chunk-size tier ladder for wide-area links
pub const WIDE_AREA_TIERS: &[usize] = &[
    16 * 1024,
    32 * 1024,
    64 * 1024,
    128 * 1024,
    256 * 1024,
];

/// Link class a transfer runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkProfile {
    /// LAN or loopback: large tiers, generous rate
    Local,
    /// Internet path: conservative tiers
    WideArea,
}

impl LinkProfile {
    /// Tier ladder for this profile
    pub fn tiers(self) -> &'static [usize] {
        match self {
            LinkProfile::Local => LOCAL_TIERS,
            LinkProfile::WideArea => WIDE_AREA_TIERS,
        }
    }

    /// Largest chunk plaintext this profile will ever produce
    pub fn max_chunk_size(self) -> usize {
        match self {
            LinkProfile::Local => 4 * 1024 * 1024,
            LinkProfile::WideArea => 256 * 1024,
        }
    }

    /// Receive-side ciphertext bound: top tier plus the AEAD tag
    pub fn max_ciphertext(self) -> usize {
        self.max_chunk_size() + AEAD_TAG_LEN
    }

    fn initial_rate(self) -> u64 {
        match self {
            LinkProfile::Local => 32 * 1024 * 1024,
            LinkProfile::WideArea => 2 * 1024 * 1024,
        }
    }
}

/// One observation of network conditions
#[derive(Debug, Clone, Copy)]
pub struct NetworkSample {
    /// Round-trip time
    pub rtt: Duration,
    /// Loss fraction in `[0, 1]`
    pub loss: f64,
    /// RTT jitter
    pub jitter: Duration,
    /// Receiver buffer occupancy in `[0, 1]`
    pub buffer: f64,
}

/// Classification of one sample against the established baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// All metrics inside the healthy envelope
    Healthy,
    /// At least one congestion signal fired
    Congested,
    /// Between the two envelopes; breaks a healthy streak, triggers nothing
    Neutral,
}

/// Controller tuning knobs
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// Link class selecting the tier ladder
    pub profile: LinkProfile,
    /// Maximum retained samples
    pub window: usize,
    /// Minimum spacing between samples counted toward a healthy streak
    pub sample_interval: Duration,
    /// Concurrency ceiling
    pub max_concurrency: u32,
    /// Target-rate floor in bytes/sec
    pub min_rate: u64,
    /// Target-rate ceiling in bytes/sec
    pub max_rate: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            profile: LinkProfile::WideArea,
            window: 50,
            sample_interval: Duration::from_millis(500),
            max_concurrency: 16,
            min_rate: 16 * 1024,
            max_rate: 1024 * 1024 * 1024,
        }
    }
}

/// Congestion-responsive controller for one session
///
/// Sampling runs at a lower frequency than chunk send/ack events; decisions
/// never block the chunk path.
#[derive(Debug)]
pub struct BitrateController {
    config: AdaptiveConfig,
    window: VecDeque<NetworkSample>,
    baseline_rtt: Option<Duration>,
    tier: usize,
    rate: u64,
    concurrency: u32,
    healthy_streak: u32,
    last_counted: Option<Instant>,
}

impl BitrateController {
    /// Create a controller starting at the profile's default posture
    pub fn new(config: AdaptiveConfig) -> Self {
        let tiers = config.profile.tiers();
        // Start one rung above the bottom so a first congestion event still
        // has somewhere to go
        let tier = 1.min(tiers.len() - 1);
        Self {
            rate: config.profile.initial_rate().clamp(config.min_rate, config.max_rate),
            tier,
            concurrency: 4.min(config.max_concurrency),
            healthy_streak: 0,
            last_counted: None,
            baseline_rtt: None,
            window: VecDeque::with_capacity(config.window),
            config,
        }
    }

    /// Current chunk-size tier in bytes
    pub fn chunk_size(&self) -> usize {
        self.config.profile.tiers()[self.tier]
    }

    /// Current target rate in bytes/sec
    pub fn target_rate(&self) -> u64 {
        self.rate
    }

    /// Current concurrency bound (unacknowledged chunks in flight)
    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    /// Established RTT baseline, if any
    pub fn baseline_rtt(&self) -> Option<Duration> {
        self.baseline_rtt
    }

    /// Classify one sample against the baseline
    pub fn classify(&self, sample: &NetworkSample) -> Health {
        let baseline = match self.baseline_rtt {
            Some(b) if !b.is_zero() => b,
            _ => return Health::Neutral,
        };
        let rtt = sample.rtt.as_secs_f64();
        let threshold = baseline.as_secs_f64() * 1.5;
        let jitter = sample.jitter.as_secs_f64();

        if rtt > threshold || sample.loss >= 0.01 || jitter > rtt / 2.0 || sample.buffer > 0.90 {
            return Health::Congested;
        }
        if rtt < threshold && sample.loss < 0.01 && jitter < rtt / 3.0 && sample.buffer < 0.80 {
            return Health::Healthy;
        }
        Health::Neutral
    }

    fn severity(&self, sample: &NetworkSample) -> f64 {
        let baseline = self
            .baseline_rtt
            .unwrap_or(sample.rtt)
            .as_secs_f64()
            .max(f64::EPSILON);
        let rtt = sample.rtt.as_secs_f64();
        let rtt_over = (rtt / (baseline * 1.5) - 1.0).clamp(0.0, 1.0);
        let loss_over = ((sample.loss - 0.01) / 0.09).clamp(0.0, 1.0);
        let jitter_over = if rtt > 0.0 {
            (sample.jitter.as_secs_f64() / (rtt / 2.0) - 1.0).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let buffer_over = ((sample.buffer - 0.90) / 0.10).clamp(0.0, 1.0);
        rtt_over.max(loss_over).max(jitter_over).max(buffer_over)
    }

    /// Record one sample and apply any rate decision it triggers
    pub fn observe(&mut self, sample: NetworkSample) -> Health {
        self.baseline_rtt = Some(match self.baseline_rtt {
            Some(b) => b.min(sample.rtt),
            None => sample.rtt,
        });
        if self.window.len() == self.config.window {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        let health = self.classify(&sample);
        match health {
            Health::Congested => {
                // Multiplicative decrease, applied immediately
                let severity = self.severity(&sample);
                let cut = 0.2 + 0.3 * severity;
                self.tier = self.tier.saturating_sub(1);
                self.rate = (((self.rate as f64) * (1.0 - cut)) as u64)
                    .clamp(self.config.min_rate, self.config.max_rate);
                self.concurrency = self.concurrency.saturating_sub(1).max(1);
                self.healthy_streak = 0;
                metrics::counter!("pqdrop_adaptive_backoff_total", 1);
                tracing::debug!(
                    severity,
                    chunk_size = self.chunk_size(),
                    rate = self.rate,
                    concurrency = self.concurrency,
                    "congestion detected, backing off"
                );
            }
            Health::Healthy => {
                let now = Instant::now();
                let counted = match self.last_counted {
                    Some(last) => now.duration_since(last) >= self.config.sample_interval,
                    None => true,
                };
                if counted {
                    self.last_counted = Some(now);
                    self.healthy_streak += 1;
                    if self.healthy_streak >= 3 {
                        // Additive increase after sustained health
                        let tiers = self.config.profile.tiers();
                        self.tier = (self.tier + 1).min(tiers.len() - 1);
                        self.rate = (((self.rate as f64) * 1.10) as u64)
                            .clamp(self.config.min_rate, self.config.max_rate);
                        self.concurrency = (self.concurrency + 1).min(self.config.max_concurrency);
                        self.healthy_streak = 0;
                        tracing::debug!(
                            chunk_size = self.chunk_size(),
                            rate = self.rate,
                            concurrency = self.concurrency,
                            "sustained health, ramping up"
                        );
                    }
                }
            }
            Health::Neutral => {
                self.healthy_streak = 0;
            }
        }
        metrics::histogram!("pqdrop_sample_rtt_ms", sample.rtt.as_secs_f64() * 1000.0);
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AdaptiveConfig {
        AdaptiveConfig {
            sample_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn healthy_sample() -> NetworkSample {
        NetworkSample {
            rtt: Duration::from_millis(10),
            loss: 0.0,
            jitter: Duration::from_millis(1),
            buffer: 0.1,
        }
    }

    #[test]
    fn test_sustained_health_ramps_up() {
        let mut controller = BitrateController::new(test_config());
        let tier_before = controller.chunk_size();
        let concurrency_before = controller.concurrency();
        let rate_before = controller.target_rate();

        // First sample establishes the baseline (neutral), then three healthy
        controller.observe(healthy_sample());
        for _ in 0..3 {
            controller.observe(healthy_sample());
        }

        assert!(controller.chunk_size() > tier_before);
        assert_eq!(controller.concurrency(), concurrency_before + 1);
        assert!(controller.target_rate() > rate_before);
    }

    #[test]
    fn test_healthy_samples_inside_interval_count_once() {
        let config = AdaptiveConfig {
            sample_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let mut controller = BitrateController::new(config);
        let tier_before = controller.chunk_size();
        let concurrency_before = controller.concurrency();

        // Burst of healthy samples well inside one interval: only the first
        // extends the streak, so no ramp happens
        for _ in 0..8 {
            controller.observe(healthy_sample());
        }

        assert_eq!(controller.chunk_size(), tier_before);
        assert_eq!(controller.concurrency(), concurrency_before);
    }

    #[test]
    fn test_loss_backs_off_within_one_sample() {
        let mut controller = BitrateController::new(test_config());
        controller.observe(healthy_sample());
        for _ in 0..3 {
            controller.observe(healthy_sample());
        }
        let tier_before = controller.chunk_size();
        let rate_before = controller.target_rate();
        let concurrency_before = controller.concurrency();

        let health = controller.observe(NetworkSample {
            loss: 0.05,
            ..healthy_sample()
        });

        assert_eq!(health, Health::Congested);
        assert!(controller.chunk_size() < tier_before);
        assert!(controller.target_rate() < rate_before);
        assert_eq!(controller.concurrency(), concurrency_before - 1);
    }

    #[test]
    fn test_rate_cut_bounded_20_to_50_percent() {
        for loss in [0.011, 0.05, 0.50] {
            let mut controller = BitrateController::new(test_config());
            controller.observe(healthy_sample());
            let before = controller.target_rate();
            controller.observe(NetworkSample {
                loss,
                ..healthy_sample()
            });
            let after = controller.target_rate();
            let cut = 1.0 - (after as f64 / before as f64);
            assert!((0.19..=0.51).contains(&cut), "cut {} for loss {}", cut, loss);
        }
    }

    #[test]
    fn test_concurrency_floor_is_one() {
        let mut controller = BitrateController::new(test_config());
        controller.observe(healthy_sample());
        for _ in 0..20 {
            controller.observe(NetworkSample {
                loss: 0.10,
                ..healthy_sample()
            });
        }
        assert_eq!(controller.concurrency(), 1);
        assert_eq!(controller.chunk_size(), WIDE_AREA_TIERS[0]);
    }

    #[test]
    fn test_tier_capped_at_ladder_top() {
        let mut controller = BitrateController::new(test_config());
        controller.observe(healthy_sample());
        for _ in 0..100 {
            controller.observe(healthy_sample());
        }
        assert_eq!(controller.chunk_size(), *WIDE_AREA_TIERS.last().unwrap());
        assert!(controller.concurrency() <= controller.config.max_concurrency);
    }

    #[test]
    fn test_rtt_spike_is_congestion() {
        let mut controller = BitrateController::new(test_config());
        controller.observe(healthy_sample());
        let health = controller.observe(NetworkSample {
            rtt: Duration::from_millis(50),
            jitter: Duration::from_millis(1),
            loss: 0.0,
            buffer: 0.1,
        });
        assert_eq!(health, Health::Congested);
    }

    #[test]
    fn test_neutral_breaks_streak() {
        let mut controller = BitrateController::new(test_config());
        controller.observe(healthy_sample());
        controller.observe(healthy_sample());
        controller.observe(healthy_sample());
        // Buffer between the healthy and congested envelopes
        let health = controller.observe(NetworkSample {
            buffer: 0.85,
            ..healthy_sample()
        });
        assert_eq!(health, Health::Neutral);
        let tier_before = controller.chunk_size();
        // Two more healthy samples must not ramp (streak was reset)
        controller.observe(healthy_sample());
        controller.observe(healthy_sample());
        assert_eq!(controller.chunk_size(), tier_before);
    }

    #[test]
    fn test_profile_ladders() {
        assert_eq!(LinkProfile::Local.max_chunk_size(), 4 * 1024 * 1024);
        assert_eq!(LinkProfile::WideArea.max_chunk_size(), 256 * 1024);
        assert_eq!(
            LinkProfile::WideArea.max_ciphertext(),
            256 * 1024 + AEAD_TAG_LEN
        );
    }

    #[test]
    fn test_window_bounded() {
        let mut controller = BitrateController::new(test_config());
        for _ in 0..200 {
            controller.observe(healthy_sample());
        }
        assert!(controller.window.len() <= 50);
    }
}
