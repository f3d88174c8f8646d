//! Orchestrator configuration.
//!
//! One strongly-typed struct with named, validated fields. Validation runs
//! once at construction; the runtime-adjustable subset travels in
//! [`TuningUpdate`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::challenges::classifier::ChallengeKind;

/// Per-kind solver time boxes. Kinds that never reach a solver (`None`,
/// `RateLimit`) have no budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverTimeouts {
    pub javascript: Duration,
    pub turnstile: Duration,
    pub managed: Duration,
    pub unknown: Duration,
}

impl Default for SolverTimeouts {
    fn default() -> Self {
        Self {
            javascript: Duration::from_secs(10),
            turnstile: Duration::from_secs(120),
            managed: Duration::from_secs(30),
            unknown: Duration::from_secs(30),
        }
    }
}

impl SolverTimeouts {
    pub fn for_kind(&self, kind: ChallengeKind) -> Duration {
        match kind {
            ChallengeKind::Javascript => self.javascript,
            ChallengeKind::Turnstile => self.turnstile,
            ChallengeKind::Managed => self.managed,
            ChallengeKind::Unknown => self.unknown,
            ChallengeKind::None | ChallengeKind::RateLimit => Duration::ZERO,
        }
    }
}

/// What happens when a task arrives and no admission capacity is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait up to the task deadline (or indefinitely without one).
    #[default]
    Block,
    /// Fail fast when the task cannot be admitted immediately.
    Reject,
    /// Wait in a bounded per-domain queue; overflow evicts the
    /// lowest-priority youngest waiter.
    QueueBounded(usize),
}

/// Complete orchestrator configuration. `Default` gives a conservative
/// profile suitable for a handful of targets; bulk deployments raise the
/// concurrency fields and the tracked-domain cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on in-flight requests across all domains.
    pub global_concurrency: usize,
    /// Upper bound on in-flight requests per domain.
    pub per_domain_concurrency: usize,
    /// Configured token-bucket refill rate per domain. The adaptive loop
    /// never raises the effective rate above this ceiling.
    pub requests_per_second: f64,
    /// Token-bucket capacity (burst size) per domain.
    pub burst_capacity: f64,
    /// Floor the adaptive loop will not halve the effective rate below.
    pub min_rate_per_second: f64,
    /// Multiplicative step applied after `recovery_streak` consecutive
    /// successes, moving the effective rate back toward the ceiling.
    pub rate_recovery_step: f64,
    /// Consecutive successes required before one recovery step.
    pub recovery_streak: u32,
    /// Base for the exponential domain backoff applied on 429s and repeated
    /// transport failures.
    pub backoff_base: Duration,
    /// Cap on the exponential domain backoff.
    pub max_backoff: Duration,
    pub backpressure: BackpressurePolicy,
    /// When set, a queued waiter older than this is promoted one priority
    /// class. Disabled by default so admission stays strictly
    /// priority-then-FIFO.
    pub priority_aging: Option<Duration>,
    /// Transport-failure budget per task. Independent from the solve budget.
    pub max_transport_attempts: u32,
    /// Solver-invocation budget per task. Independent from the transport
    /// budget.
    pub max_solve_attempts: u32,
    /// Base for the jittered exponential pause between transport retries.
    pub retry_backoff_base: Duration,
    /// Cap on the pause between transport retries.
    pub retry_backoff_cap: Duration,
    /// Per-attempt network timeout, further bounded by the task deadline.
    pub request_timeout: Duration,
    pub solver_timeouts: SolverTimeouts,
    /// Validity window for cached challenge solutions.
    pub solution_ttl: Duration,
    /// Capacity of the domain-state map; idle entries past the LRU bound are
    /// evicted, busy ones never are.
    pub max_tracked_domains: usize,
    /// Idle time after which an unused domain entry may be evicted.
    pub domain_idle_ttl: Duration,
    /// Header names (case-insensitive) a caller may override even when the
    /// browser identity also sets them.
    pub overridable_headers: Vec<String>,
    /// Latency samples retained per domain by the metrics collector.
    pub metrics_window: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 64,
            per_domain_concurrency: 8,
            requests_per_second: 4.0,
            burst_capacity: 8.0,
            min_rate_per_second: 0.1,
            rate_recovery_step: 1.1,
            recovery_streak: 20,
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(300),
            backpressure: BackpressurePolicy::Block,
            priority_aging: None,
            max_transport_attempts: 3,
            max_solve_attempts: 3,
            retry_backoff_base: Duration::from_millis(250),
            retry_backoff_cap: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            solver_timeouts: SolverTimeouts::default(),
            solution_ttl: Duration::from_secs(600),
            max_tracked_domains: 1024,
            domain_idle_ttl: Duration::from_secs(600),
            overridable_headers: vec![
                "accept".into(),
                "accept-language".into(),
                "referer".into(),
                "origin".into(),
                "cookie".into(),
                "content-type".into(),
                "cache-control".into(),
            ],
            metrics_window: 128,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_concurrency == 0 {
            return Err(ConfigError::ZeroLimit("global_concurrency"));
        }
        if self.per_domain_concurrency == 0 {
            return Err(ConfigError::ZeroLimit("per_domain_concurrency"));
        }
        if self.per_domain_concurrency > self.global_concurrency {
            return Err(ConfigError::DomainLimitAboveGlobal {
                per_domain: self.per_domain_concurrency,
                global: self.global_concurrency,
            });
        }
        if !(self.requests_per_second > 0.0) || !self.requests_per_second.is_finite() {
            return Err(ConfigError::NonPositiveRate("requests_per_second"));
        }
        if !(self.burst_capacity >= 1.0) || !self.burst_capacity.is_finite() {
            return Err(ConfigError::BurstBelowOne(self.burst_capacity));
        }
        if !(self.min_rate_per_second > 0.0) {
            return Err(ConfigError::NonPositiveRate("min_rate_per_second"));
        }
        if self.min_rate_per_second > self.requests_per_second {
            return Err(ConfigError::MinRateAboveCeiling {
                min: self.min_rate_per_second,
                ceiling: self.requests_per_second,
            });
        }
        if !(self.rate_recovery_step > 1.0) {
            return Err(ConfigError::RecoveryStepNotAboveOne(self.rate_recovery_step));
        }
        if self.recovery_streak == 0 {
            return Err(ConfigError::ZeroLimit("recovery_streak"));
        }
        if self.max_transport_attempts == 0 {
            return Err(ConfigError::ZeroLimit("max_transport_attempts"));
        }
        if self.backoff_base > self.max_backoff {
            return Err(ConfigError::BackoffBaseAboveCap {
                base: self.backoff_base,
                cap: self.max_backoff,
            });
        }
        if self.max_tracked_domains == 0 {
            return Err(ConfigError::ZeroLimit("max_tracked_domains"));
        }
        if let BackpressurePolicy::QueueBounded(0) = self.backpressure {
            return Err(ConfigError::ZeroLimit("backpressure queue bound"));
        }
        Ok(())
    }
}

/// Runtime-adjustable subset of the configuration. Absent fields keep their
/// current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningUpdate {
    pub global_concurrency: Option<usize>,
    pub per_domain_concurrency: Option<usize>,
    pub requests_per_second: Option<f64>,
    pub solver_timeouts: Option<SolverTimeouts>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
    #[error("{0} must be a positive finite number")]
    NonPositiveRate(&'static str),
    #[error("per_domain_concurrency {per_domain} exceeds global_concurrency {global}")]
    DomainLimitAboveGlobal { per_domain: usize, global: usize },
    #[error("burst_capacity {0} must be at least 1")]
    BurstBelowOne(f64),
    #[error("min_rate_per_second {min} exceeds requests_per_second {ceiling}")]
    MinRateAboveCeiling { min: f64, ceiling: f64 },
    #[error("rate_recovery_step {0} must be greater than 1")]
    RecoveryStepNotAboveOne(f64),
    #[error("backoff_base {base:?} exceeds max_backoff {cap:?}")]
    BackoffBaseAboveCap { base: Duration, cap: Duration },
}
