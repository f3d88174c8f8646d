//! Admission control.
//!
//! Owns the global concurrency budget and the per-domain gates. `acquire`
//! suspends cooperatively until a global slot, a domain slot, a rate token,
//! and a cleared backoff line up, or until the task deadline wins. The
//! returned [`Permit`] releases exactly once; dropping it mid-flight counts
//! as cancellation.

pub mod domain;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout_at};

use crate::challenges::context::ChallengeSolution;
use crate::config::{BackpressurePolicy, OrchestratorConfig};
use crate::task::RequestTask;

pub use domain::{BackoffReport, DomainSnapshot, ReleaseOutcome};
use domain::{DomainGate, DomainRegistry, GateParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// No capacity under the configured backpressure policy.
    #[error("admission rejected: no capacity under the configured backpressure policy")]
    Rejected,
    /// The task deadline elapsed while waiting for capacity.
    #[error("admission wait exceeded the task deadline")]
    DeadlineExceeded,
}

/// Global-plus-domain view for `stats()`.
#[derive(Debug, Clone)]
pub struct GlobalAdmissionStats {
    pub in_flight: usize,
    pub queued: usize,
    pub limit: usize,
    pub tracked_domains: usize,
}

pub(crate) struct AdmissionController {
    global: Arc<Semaphore>,
    global_limit: Mutex<usize>,
    backpressure: BackpressurePolicy,
    registry: DomainRegistry,
}

impl AdmissionController {
    pub(crate) fn new(config: &OrchestratorConfig) -> Self {
        let params = GateParams {
            limit: config.per_domain_concurrency,
            base_rate: config.requests_per_second,
            burst: config.burst_capacity,
            min_rate: config.min_rate_per_second,
            recovery_streak: config.recovery_streak,
            recovery_step: config.rate_recovery_step,
            backoff_base: config.backoff_base,
            max_backoff: config.max_backoff,
            aging: config.priority_aging,
        };
        Self {
            global: Arc::new(Semaphore::new(config.global_concurrency)),
            global_limit: Mutex::new(config.global_concurrency),
            backpressure: config.backpressure,
            registry: DomainRegistry::new(
                params,
                config.max_tracked_domains,
                config.domain_idle_ttl,
            ),
        }
    }

    /// Acquires the domain gate first, then a global slot, so a backed-off
    /// domain never pins global capacity while it waits out its penalty.
    pub(crate) async fn acquire(&self, task: &RequestTask) -> Result<Permit, AdmissionError> {
        if task.deadline_expired(Instant::now()) {
            return Err(AdmissionError::DeadlineExceeded);
        }

        let gate = self.registry.gate(&task.domain);
        gate.acquire(task.priority, task.deadline, self.backpressure)
            .await?;

        let global = match task.deadline {
            Some(deadline) => {
                match timeout_at(deadline, Arc::clone(&self.global).acquire_owned()).await {
                    Ok(permit) => permit,
                    Err(_) => {
                        // No request went out; the domain token goes back.
                        gate.refund();
                        return Err(AdmissionError::DeadlineExceeded);
                    }
                }
            }
            None => Arc::clone(&self.global).acquire_owned().await,
        }
        .expect("global admission semaphore closed");

        Ok(Permit {
            gate: Some(gate),
            _global: global,
        })
    }

    /// The moment the named domain's backoff clears, if one is pending.
    /// Unknown domains answer `None` without getting tracked.
    pub(crate) fn backoff_until(&self, domain: &str) -> Option<Instant> {
        self.registry.peek(domain).and_then(|gate| gate.backoff_until())
    }

    pub(crate) fn apply_tuning(
        &self,
        global: Option<usize>,
        per_domain: Option<usize>,
        base_rate: Option<f64>,
    ) {
        if let Some(new_limit) = global {
            let mut limit = self.global_limit.lock().expect("limit lock poisoned");
            let new_limit = new_limit.max(1);
            if new_limit > *limit {
                self.global.add_permits(new_limit - *limit);
            } else if new_limit < *limit {
                // Shrinking takes effect as in-flight permits drain.
                self.global.forget_permits(*limit - new_limit);
            }
            *limit = new_limit;
        }
        if per_domain.is_some() || base_rate.is_some() {
            self.registry.apply_tuning(per_domain, base_rate);
        }
    }

    pub(crate) fn stats(&self) -> GlobalAdmissionStats {
        let limit = *self.global_limit.lock().expect("limit lock poisoned");
        GlobalAdmissionStats {
            in_flight: limit.saturating_sub(self.global.available_permits()),
            queued: self.registry.queued_total(),
            limit,
            tracked_domains: self.registry.tracked(),
        }
    }

    pub(crate) fn domain_snapshots(&self) -> Vec<DomainSnapshot> {
        self.registry.snapshots()
    }
}

/// The right to one in-flight request against the global and per-domain
/// budgets. Held across the whole solve-and-retry cycle of a task.
pub struct Permit {
    gate: Option<Arc<DomainGate>>,
    _global: OwnedSemaphorePermit,
}

impl Permit {
    /// Releases with an explicit outcome, feeding the domain's adaptive
    /// rate. Consumes the permit, so release happens exactly once.
    pub(crate) fn release(mut self, outcome: ReleaseOutcome) -> Option<BackoffReport> {
        self.gate
            .take()
            .map(|gate| gate.release(outcome))
            .unwrap_or(None)
    }

    pub(crate) fn cached_solution(&self) -> Option<ChallengeSolution> {
        self.gate.as_ref().and_then(|gate| gate.cached_solution())
    }

    pub(crate) fn store_solution(&self, solution: ChallengeSolution) {
        if let Some(gate) = &self.gate {
            gate.store_solution(solution);
        }
    }

    pub(crate) fn invalidate_solution(&self) {
        if let Some(gate) = &self.gate {
            gate.invalidate_solution();
        }
    }

    #[cfg(test)]
    pub(crate) fn domain(&self) -> Option<&str> {
        self.gate.as_deref().map(DomainGate::domain)
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("domain", &self.gate.as_deref().map(DomainGate::domain))
            .finish_non_exhaustive()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        // Not released explicitly: the task was cancelled or panicked.
        if let Some(gate) = self.gate.take() {
            gate.release(ReleaseOutcome::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            global_concurrency: 4,
            per_domain_concurrency: 2,
            requests_per_second: 100.0,
            burst_capacity: 100.0,
            ..OrchestratorConfig::default()
        }
    }

    fn task(url: &str) -> RequestTask {
        RequestTask::get(url).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn global_budget_spans_domains() {
        let controller = AdmissionController::new(&config());
        let a1 = controller.acquire(&task("https://a.test/")).await.unwrap();
        let a2 = controller.acquire(&task("https://a.test/")).await.unwrap();
        let b1 = controller.acquire(&task("https://b.test/")).await.unwrap();
        let b2 = controller.acquire(&task("https://b.test/")).await.unwrap();
        assert_eq!(controller.stats().in_flight, 4);

        let blocked = {
            let t = task("https://c.test/");
            let deadline = Instant::now() + Duration::from_millis(50);
            let t = t.with_deadline(deadline);
            controller.acquire(&t).await
        };
        assert_eq!(blocked.unwrap_err(), AdmissionError::DeadlineExceeded);

        a1.release(ReleaseOutcome::Success { latency: None });
        a2.release(ReleaseOutcome::Success { latency: None });
        b1.release(ReleaseOutcome::Success { latency: None });
        b2.release(ReleaseOutcome::Success { latency: None });
        assert_eq!(controller.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_domain_cap_enforced_under_concurrency() {
        let controller = Arc::new(AdmissionController::new(&OrchestratorConfig {
            global_concurrency: 64,
            per_domain_concurrency: 5,
            requests_per_second: 1000.0,
            burst_capacity: 1000.0,
            ..OrchestratorConfig::default()
        }));
        let active = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let submits = (0..50).map(|_| {
            let controller = Arc::clone(&controller);
            let active = Arc::clone(&active);
            let high_water = Arc::clone(&high_water);
            async move {
                let permit = controller.acquire(&task("https://a.test/")).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                permit.release(ReleaseOutcome::Success { latency: None });
            }
        });
        join_all(submits).await;
        assert!(high_water.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_permit_releases_both_budgets() {
        let controller = AdmissionController::new(&OrchestratorConfig {
            global_concurrency: 1,
            per_domain_concurrency: 1,
            ..config()
        });
        let permit = controller.acquire(&task("https://a.test/")).await.unwrap();
        assert_eq!(permit.domain(), Some("a.test"));
        drop(permit);
        assert_eq!(controller.stats().in_flight, 0);

        // Both the domain slot and the global slot came back.
        let again = controller.acquire(&task("https://a.test/")).await.unwrap();
        again.release(ReleaseOutcome::Success { latency: None });
    }

    #[tokio::test(start_paused = true)]
    async fn pre_expired_deadline_rejected_before_any_wait() {
        let controller = AdmissionController::new(&config());
        let expired = task("https://a.test/").with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(
            controller.acquire(&expired).await.unwrap_err(),
            AdmissionError::DeadlineExceeded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_in_global_wait_refunds_the_domain_token() {
        let controller = AdmissionController::new(&OrchestratorConfig {
            global_concurrency: 1,
            per_domain_concurrency: 2,
            requests_per_second: 0.01,
            burst_capacity: 2.0,
            ..OrchestratorConfig::default()
        });
        let holder = controller.acquire(&task("https://a.test/")).await.unwrap();

        let late = task("https://b.test/")
            .with_deadline(Instant::now() + Duration::from_millis(50));
        assert_eq!(
            controller.acquire(&late).await.unwrap_err(),
            AdmissionError::DeadlineExceeded
        );

        // b.test never sent anything; its bucket is full again.
        let tokens = controller
            .domain_snapshots()
            .into_iter()
            .find(|s| s.domain == "b.test")
            .unwrap()
            .tokens;
        assert!((tokens - 2.0).abs() < 0.01);
        holder.release(ReleaseOutcome::Success { latency: None });
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_query_never_registers_a_domain() {
        let controller = AdmissionController::new(&config());
        assert_eq!(controller.backoff_until("unseen.test"), None);
        assert_eq!(controller.stats().tracked_domains, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tuning_resizes_global_budget() {
        let controller = AdmissionController::new(&OrchestratorConfig {
            global_concurrency: 1,
            per_domain_concurrency: 1,
            ..config()
        });
        let held = controller.acquire(&task("https://a.test/")).await.unwrap();

        controller.apply_tuning(Some(2), Some(2), None);
        assert_eq!(controller.stats().limit, 2);
        let second = controller.acquire(&task("https://a.test/")).await.unwrap();

        held.release(ReleaseOutcome::Success { latency: None });
        second.release(ReleaseOutcome::Success { latency: None });
    }

    #[tokio::test(start_paused = true)]
    async fn high_admitted_before_low_on_freed_slot() {
        let controller = Arc::new(AdmissionController::new(&OrchestratorConfig {
            global_concurrency: 8,
            per_domain_concurrency: 1,
            requests_per_second: 100.0,
            burst_capacity: 100.0,
            ..OrchestratorConfig::default()
        }));
        let holder = controller.acquire(&task("https://a.test/")).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let low = {
            let controller = Arc::clone(&controller);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let permit = controller
                    .acquire(&task("https://a.test/").with_priority(Priority::Low))
                    .await
                    .unwrap();
                order.lock().unwrap().push("low");
                permit.release(ReleaseOutcome::Success { latency: None });
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let high = {
            let controller = Arc::clone(&controller);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let permit = controller
                    .acquire(&task("https://a.test/").with_priority(Priority::High))
                    .await
                    .unwrap();
                order.lock().unwrap().push("high");
                permit.release(ReleaseOutcome::Success { latency: None });
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        holder.release(ReleaseOutcome::Success { latency: None });
        low.await.unwrap();
        high.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }
}
