//! Outcome and latency accounting.
//!
//! The sink trait is the seam external collectors plug into; the default
//! collector keeps bounded in-memory accumulators suitable for the stats
//! surface and for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::challenges::classifier::ChallengeKind;
use crate::task::OutcomeKind;

/// Receives one record per completed task and one per solver invocation.
/// Implementations must be cheap and infallible; they run on the submit path.
pub trait MetricsSink: Send + Sync {
    fn record_timing(&self, domain: &str, outcome: OutcomeKind, elapsed: Duration);
    fn record_challenge(&self, kind: ChallengeKind, solved: bool, elapsed: Duration);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_timing(&self, _domain: &str, _outcome: OutcomeKind, _elapsed: Duration) {}
    fn record_challenge(&self, _kind: ChallengeKind, _solved: bool, _elapsed: Duration) {}
}

#[derive(Debug, Default, Clone)]
struct Accumulator {
    outcomes: HashMap<OutcomeKind, u64>,
    latencies: VecDeque<Duration>,
    total_latency: Duration,
    completed: u64,
}

impl Accumulator {
    fn record(&mut self, outcome: OutcomeKind, elapsed: Duration, window: usize) {
        *self.outcomes.entry(outcome).or_insert(0) += 1;
        self.completed += 1;
        self.total_latency += elapsed;
        self.latencies.push_back(elapsed);
        while self.latencies.len() > window {
            self.latencies.pop_front();
        }
    }

    fn count(&self, outcome: OutcomeKind) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    fn mean_latency(&self) -> Option<Duration> {
        if self.completed == 0 {
            return None;
        }
        Some(self.total_latency / self.completed as u32)
    }

    /// p95 over the retained window, by nearest-rank.
    fn p95_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (sorted.len() as f64 * 0.95).ceil() as usize;
        Some(sorted[rank.saturating_sub(1)])
    }
}

#[derive(Debug)]
struct MetricsState {
    global: Accumulator,
    domains: HashMap<String, Accumulator>,
    challenges: HashMap<ChallengeKind, ChallengeCounters>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChallengeCounters {
    attempts: u64,
    solved: u64,
    total_solve_time: Duration,
}

/// Point-in-time counters for one domain.
#[derive(Debug, Clone)]
pub struct DomainMetrics {
    pub domain: String,
    pub completed: u64,
    pub successes: u64,
    pub rate_limited: u64,
    pub transport_failed: u64,
    pub mean_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

/// Per-kind solver counters.
#[derive(Debug, Clone, Copy)]
pub struct ChallengeMetrics {
    pub kind: ChallengeKind,
    pub attempts: u64,
    pub solved: u64,
    pub mean_solve_time: Option<Duration>,
}

/// Everything the collector knows, cloned out under one lock hold.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub completed: u64,
    pub successes: u64,
    pub mean_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub domains: Vec<DomainMetrics>,
    pub challenges: Vec<ChallengeMetrics>,
}

impl MetricsSnapshot {
    pub fn success_ratio(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.successes as f64 / self.completed as f64
    }

    pub fn domain(&self, name: &str) -> Option<&DomainMetrics> {
        self.domains.iter().find(|d| d.domain == name)
    }
}

/// Default in-process collector behind the orchestrator's `metrics()` call.
pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
    started_at: DateTime<Utc>,
    window: usize,
}

impl MetricsCollector {
    pub fn new(window: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState {
                global: Accumulator::default(),
                domains: HashMap::new(),
                challenges: HashMap::new(),
            })),
            started_at: Utc::now(),
            window: window.max(1),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().expect("metrics lock poisoned");
        let mut domains: Vec<DomainMetrics> = state
            .domains
            .iter()
            .map(|(name, acc)| DomainMetrics {
                domain: name.clone(),
                completed: acc.completed,
                successes: acc.count(OutcomeKind::Success),
                rate_limited: acc.count(OutcomeKind::RateLimited),
                transport_failed: acc.count(OutcomeKind::TransportFailed),
                mean_latency: acc.mean_latency(),
                p95_latency: acc.p95_latency(),
            })
            .collect();
        domains.sort_by(|a, b| a.domain.cmp(&b.domain));

        let mut challenges: Vec<ChallengeMetrics> = state
            .challenges
            .iter()
            .map(|(kind, counters)| ChallengeMetrics {
                kind: *kind,
                attempts: counters.attempts,
                solved: counters.solved,
                mean_solve_time: (counters.attempts > 0)
                    .then(|| counters.total_solve_time / counters.attempts as u32),
            })
            .collect();
        challenges.sort_by_key(|c| c.kind as u8);

        MetricsSnapshot {
            started_at: self.started_at,
            completed: state.global.completed,
            successes: state.global.count(OutcomeKind::Success),
            mean_latency: state.global.mean_latency(),
            p95_latency: state.global.p95_latency(),
            domains,
            challenges,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(128)
    }
}

impl MetricsSink for MetricsCollector {
    fn record_timing(&self, domain: &str, outcome: OutcomeKind, elapsed: Duration) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        state.global.record(outcome, elapsed, self.window);
        state
            .domains
            .entry(domain.to_string())
            .or_default()
            .record(outcome, elapsed, self.window);
    }

    fn record_challenge(&self, kind: ChallengeKind, solved: bool, elapsed: Duration) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        let counters = state.challenges.entry(kind).or_default();
        counters.attempts += 1;
        counters.total_solve_time += elapsed;
        if solved {
            counters.solved += 1;
        }
    }
}
