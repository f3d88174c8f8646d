//! Per-domain scheduling state.
//!
//! Each target host gets one [`DomainGate`]: a slot count, a token bucket,
//! the adaptive-rate bookkeeping, priority wait queues, and the cached
//! challenge solution. Gates live in a [`DomainRegistry`], an LRU-bounded map
//! that evicts idle entries but never busy ones.
//!
//! Locking: every gate holds a `std::sync::Mutex` around its state, taken
//! only for token/count mutation and never across an await. Waiters park on
//! a `Notify` and re-check eligibility under the lock when woken.

use lru::LruCache;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

use crate::challenges::context::ChallengeSolution;
use crate::config::BackpressurePolicy;
use crate::task::Priority;

use super::AdmissionError;

/// Scheduling parameters a gate is created with. The registry keeps the
/// current set so tuning applies to existing and future gates alike.
#[derive(Debug, Clone)]
pub(crate) struct GateParams {
    pub limit: usize,
    pub base_rate: f64,
    pub burst: f64,
    pub min_rate: f64,
    pub recovery_streak: u32,
    pub recovery_step: f64,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub aging: Option<Duration>,
}

/// How a permit holder's attempt ended, as far as the rate loop cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The request completed; `latency` feeds the moving average.
    Success { latency: Option<Duration> },
    /// The target signalled 429. Halves the rate and backs the domain off.
    RateLimited,
    /// The wire failed. Backs off; halves the rate from the second
    /// consecutive failure.
    TransportFailure,
    /// Terminal failure with no adversarial signal (unsolved challenge).
    Failure,
    /// The task was cancelled or timed out; frees the slot, adjusts nothing.
    Cancelled,
}

/// Backoff bookkeeping produced by an adverse release.
#[derive(Debug, Clone, Copy)]
pub struct BackoffReport {
    pub consecutive_failures: u32,
    pub backoff_until: Instant,
    pub effective_rate: f64,
}

/// Point-in-time view of one gate, for `stats()`.
#[derive(Debug, Clone)]
pub struct DomainSnapshot {
    pub domain: String,
    pub active: usize,
    pub queued: usize,
    pub effective_rate: f64,
    pub tokens: f64,
    pub backoff_remaining: Option<Duration>,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub mean_latency: Option<Duration>,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct GateState {
    limit: usize,
    active: usize,
    tokens: f64,
    capacity: f64,
    rate: f64,
    base_rate: f64,
    min_rate: f64,
    last_refill: Instant,
    recovery_streak: u32,
    recovery_step: f64,
    backoff_base: Duration,
    max_backoff: Duration,
    aging: Option<Duration>,
    consecutive_failures: u32,
    success_streak: u32,
    backoff_until: Option<Instant>,
    ewma_latency: Option<Duration>,
    total_successes: u64,
    total_failures: u64,
    // One queue per priority class, FIFO within each.
    waiters: [VecDeque<Waiter>; 3],
    next_ticket: u64,
    solution: Option<ChallengeSolution>,
    last_touched: Instant,
}

impl GateState {
    fn new(params: &GateParams, now: Instant) -> Self {
        Self {
            limit: params.limit,
            active: 0,
            tokens: params.burst,
            capacity: params.burst,
            rate: params.base_rate,
            base_rate: params.base_rate,
            min_rate: params.min_rate,
            last_refill: now,
            recovery_streak: params.recovery_streak,
            recovery_step: params.recovery_step,
            backoff_base: params.backoff_base,
            max_backoff: params.max_backoff,
            aging: params.aging,
            consecutive_failures: 0,
            success_streak: 0,
            backoff_until: None,
            ewma_latency: None,
            total_successes: 0,
            total_failures: 0,
            waiters: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            next_ticket: 1,
            solution: None,
            last_touched: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    fn apply_aging(&mut self, now: Instant) {
        let Some(threshold) = self.aging else {
            return;
        };
        // Walk Normal then Low; a promoted waiter joins the back of the next
        // class up with a fresh age.
        for class in (1..3).rev() {
            let mut index = 0;
            while index < self.waiters[class].len() {
                if now.saturating_duration_since(self.waiters[class][index].enqueued_at)
                    >= threshold
                {
                    let mut waiter = self.waiters[class].remove(index).expect("index checked");
                    waiter.enqueued_at = now;
                    self.waiters[class - 1].push_back(waiter);
                } else {
                    index += 1;
                }
            }
        }
    }

    fn can_admit(&self, now: Instant) -> bool {
        self.active < self.limit
            && self.tokens >= 1.0
            && self.backoff_until.is_none_or(|until| now >= until)
    }

    fn admit(&mut self, now: Instant) {
        debug_assert!(self.tokens >= 1.0);
        self.tokens -= 1.0;
        self.active += 1;
        self.last_touched = now;
    }

    fn waiter_count(&self) -> usize {
        self.waiters.iter().map(VecDeque::len).sum()
    }

    /// Whether a caller (queued under `ticket`, or a newcomer when `None`)
    /// is next in the priority-then-FIFO order.
    fn is_next(&self, class: usize, ticket: Option<u64>) -> bool {
        match ticket {
            Some(ticket) => self
                .waiters
                .iter()
                .find(|queue| !queue.is_empty())
                .and_then(|queue| queue.front())
                .is_some_and(|front| front.ticket == ticket),
            None => self.waiters[..=class].iter().all(VecDeque::is_empty),
        }
    }

    fn enqueue(&mut self, class: usize, now: Instant) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiters[class].push_back(Waiter {
            ticket,
            enqueued_at: now,
        });
        ticket
    }

    fn remove_waiter(&mut self, ticket: u64) -> bool {
        for queue in &mut self.waiters {
            if let Some(index) = queue.iter().position(|w| w.ticket == ticket) {
                queue.remove(index);
                return true;
            }
        }
        false
    }

    fn contains_waiter(&self, ticket: u64) -> bool {
        self.waiters
            .iter()
            .any(|queue| queue.iter().any(|w| w.ticket == ticket))
    }

    /// Evicts the youngest waiter of the lowest class strictly below
    /// `class`. Returns false when every queued waiter is at `class` or
    /// above, meaning the newcomer is the one to reject.
    fn evict_below(&mut self, class: usize) -> bool {
        for lower in ((class + 1)..3).rev() {
            if self.waiters[lower].pop_back().is_some() {
                return true;
            }
        }
        false
    }

    /// Earliest instant at which time alone could make admission possible.
    /// `None` means only a slot release can help, which arrives via notify.
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        if let Some(until) = self.backoff_until
            && until > now
        {
            return Some(until);
        }
        if self.tokens < 1.0 && self.rate > 0.0 {
            let wait = Duration::from_secs_f64((1.0 - self.tokens) / self.rate);
            return Some(now + wait);
        }
        None
    }

    fn apply_backoff(&mut self, now: Instant, halve_rate: bool) -> BackoffReport {
        self.success_streak = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;
        if halve_rate {
            self.rate = (self.rate / 2.0).max(self.min_rate);
        }
        let exponent = self.consecutive_failures.min(16);
        let backoff = Duration::from_secs_f64(
            self.backoff_base.as_secs_f64() * f64::from(2u32.pow(exponent)),
        )
        .min(self.max_backoff);
        self.backoff_until = Some(now + backoff);
        BackoffReport {
            consecutive_failures: self.consecutive_failures,
            backoff_until: now + backoff,
            effective_rate: self.rate,
        }
    }

    fn record_success(&mut self, latency: Option<Duration>) {
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.success_streak = self.success_streak.saturating_add(1);
        if let Some(latency) = latency {
            self.ewma_latency = Some(match self.ewma_latency {
                None => latency,
                Some(current) => Duration::from_secs_f64(
                    current.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1,
                ),
            });
        }
        if self.success_streak >= self.recovery_streak {
            self.rate = (self.rate * self.recovery_step).min(self.base_rate);
            self.success_streak = 0;
        }
    }
}

/// Scheduling gate for one domain.
pub(crate) struct DomainGate {
    domain: String,
    state: Mutex<GateState>,
    notify: Notify,
}

/// Removes a parked waiter from its queue when the acquiring future is
/// dropped mid-wait, then wakes the rest so the next-in-line recomputes.
struct QueueGuard {
    gate: Arc<DomainGate>,
    ticket: u64,
    armed: bool,
}

impl QueueGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        if self.armed {
            let removed = {
                let mut state = self.gate.state.lock().expect("gate lock poisoned");
                state.remove_waiter(self.ticket)
            };
            if removed {
                self.gate.notify.notify_waiters();
            }
        }
    }
}

impl DomainGate {
    pub(crate) fn new(domain: impl Into<String>, params: &GateParams) -> Self {
        Self {
            domain: domain.into(),
            state: Mutex::new(GateState::new(params, Instant::now())),
            notify: Notify::new(),
        }
    }

    pub(crate) fn domain(&self) -> &str {
        &self.domain
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().expect("gate lock poisoned")
    }

    /// Waits for a domain slot, a token, and a cleared backoff, in
    /// priority-then-FIFO order. Never consumes a token on failure.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        priority: Priority,
        deadline: Option<Instant>,
        policy: BackpressurePolicy,
    ) -> Result<(), AdmissionError> {
        let class = priority.queue_index();
        let mut queue_guard: Option<QueueGuard> = None;

        loop {
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Err(AdmissionError::DeadlineExceeded);
            }

            // Register interest before checking state so a release between
            // the check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut evicted_someone = false;
            let wake_at = {
                let mut state = self.lock();
                state.refill(now);
                state.apply_aging(now);

                let ticket = queue_guard.as_ref().map(|g| g.ticket);
                if let Some(ticket) = ticket
                    && !state.contains_waiter(ticket)
                {
                    // A bounded queue pushed us out while we slept.
                    queue_guard
                        .as_mut()
                        .expect("guard present when ticket is")
                        .disarm();
                    return Err(AdmissionError::Rejected);
                }

                if state.is_next(class, ticket) && state.can_admit(now) {
                    if let Some(ticket) = ticket {
                        state.remove_waiter(ticket);
                    }
                    state.admit(now);
                    if let Some(mut guard) = queue_guard.take() {
                        guard.disarm();
                    }
                    return Ok(());
                }

                if queue_guard.is_none() {
                    match policy {
                        BackpressurePolicy::Reject => return Err(AdmissionError::Rejected),
                        BackpressurePolicy::QueueBounded(bound)
                            if state.waiter_count() >= bound =>
                        {
                            if !state.evict_below(class) {
                                return Err(AdmissionError::Rejected);
                            }
                            evicted_someone = true;
                            let ticket = state.enqueue(class, now);
                            queue_guard = Some(QueueGuard {
                                gate: Arc::clone(self),
                                ticket,
                                armed: true,
                            });
                        }
                        BackpressurePolicy::Block | BackpressurePolicy::QueueBounded(_) => {
                            let ticket = state.enqueue(class, now);
                            queue_guard = Some(QueueGuard {
                                gate: Arc::clone(self),
                                ticket,
                                armed: true,
                            });
                        }
                    }
                }

                state.next_wake(now)
            };

            if evicted_someone {
                // The evicted waiter is no longer queued; wake it so it can
                // observe the rejection.
                self.notify.notify_waiters();
            }

            let sleep_target = match (wake_at, deadline) {
                (Some(wake), Some(d)) => Some(wake.min(d)),
                (Some(wake), None) => Some(wake),
                (None, Some(d)) => Some(d),
                (None, None) => None,
            };
            match sleep_target {
                Some(target) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(target) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Frees the slot and feeds the adaptive-rate loop. Returns the backoff
    /// applied, if any, so the caller can surface it.
    pub(crate) fn release(&self, outcome: ReleaseOutcome) -> Option<BackoffReport> {
        let report = {
            let mut state = self.lock();
            let now = Instant::now();
            state.active = state.active.saturating_sub(1);
            state.last_touched = now;
            match outcome {
                ReleaseOutcome::Success { latency } => {
                    state.record_success(latency);
                    None
                }
                ReleaseOutcome::RateLimited => Some(state.apply_backoff(now, true)),
                ReleaseOutcome::TransportFailure => {
                    let repeated = state.consecutive_failures >= 1;
                    Some(state.apply_backoff(now, repeated))
                }
                ReleaseOutcome::Failure => {
                    state.success_streak = 0;
                    state.total_failures += 1;
                    None
                }
                ReleaseOutcome::Cancelled => None,
            }
        };
        self.notify.notify_waiters();
        report
    }

    /// Frees the slot and restores the token spent at admission. For holders
    /// that never reached the wire, so a timed-out wait costs no rate.
    pub(crate) fn refund(&self) {
        {
            let mut state = self.lock();
            let now = Instant::now();
            state.refill(now);
            state.active = state.active.saturating_sub(1);
            state.tokens = (state.tokens + 1.0).min(state.capacity);
            state.last_touched = now;
        }
        self.notify.notify_waiters();
    }

    /// Still-fresh cached solution for this domain, if any. Stale entries
    /// are dropped on read.
    pub(crate) fn cached_solution(&self) -> Option<ChallengeSolution> {
        let mut state = self.lock();
        let now = Instant::now();
        if state.solution.as_ref().is_some_and(|s| !s.is_fresh(now)) {
            state.solution = None;
        }
        state.solution.clone()
    }

    pub(crate) fn store_solution(&self, solution: ChallengeSolution) {
        self.lock().solution = Some(solution);
    }

    /// Called on every fresh challenge classification: whatever we cached no
    /// longer clears the protection.
    pub(crate) fn invalidate_solution(&self) {
        self.lock().solution = None;
    }

    pub(crate) fn set_limit(&self, limit: usize) {
        self.lock().limit = limit.max(1);
        self.notify.notify_waiters();
    }

    pub(crate) fn set_base_rate(&self, base_rate: f64) {
        {
            let mut state = self.lock();
            state.base_rate = base_rate;
            state.min_rate = state.min_rate.min(base_rate);
            state.rate = state.rate.min(base_rate);
        }
        self.notify.notify_waiters();
    }

    /// Next instant before which `acquire` cannot succeed because of
    /// backoff. `None` when the domain is not backed off.
    pub(crate) fn backoff_until(&self) -> Option<Instant> {
        let state = self.lock();
        state.backoff_until.filter(|until| *until > Instant::now())
    }

    fn is_quiescent(&self) -> bool {
        let state = self.lock();
        state.active == 0 && state.waiter_count() == 0
    }

    fn idle_since(&self) -> Instant {
        self.lock().last_touched
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.lock().waiter_count()
    }

    pub(crate) fn snapshot(&self) -> DomainSnapshot {
        let mut state = self.lock();
        let now = Instant::now();
        state.refill(now);
        let total = state.total_successes + state.total_failures;
        DomainSnapshot {
            domain: self.domain.clone(),
            active: state.active,
            queued: state.waiter_count(),
            effective_rate: state.rate,
            tokens: state.tokens,
            backoff_remaining: state
                .backoff_until
                .and_then(|until| (until > now).then(|| until - now)),
            consecutive_failures: state.consecutive_failures,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            success_rate: if total == 0 {
                1.0
            } else {
                state.total_successes as f64 / total as f64
            },
            mean_latency: state.ewma_latency,
        }
    }
}

/// LRU-bounded map of gates. Lazily creates entries, sweeps idle ones past
/// the TTL, and refuses to evict a gate with active or queued work.
pub(crate) struct DomainRegistry {
    gates: Mutex<LruCache<String, Arc<DomainGate>>>,
    params: Mutex<GateParams>,
    capacity: usize,
    idle_ttl: Duration,
}

impl DomainRegistry {
    pub(crate) fn new(params: GateParams, capacity: usize, idle_ttl: Duration) -> Self {
        Self {
            gates: Mutex::new(LruCache::unbounded()),
            params: Mutex::new(params),
            capacity: capacity.max(1),
            idle_ttl,
        }
    }

    pub(crate) fn gate(&self, domain: &str) -> Arc<DomainGate> {
        let params = self.params.lock().expect("params lock poisoned").clone();
        let mut gates = self.gates.lock().expect("registry lock poisoned");
        if let Some(gate) = gates.get(domain) {
            return Arc::clone(gate);
        }

        self.sweep_idle(&mut gates);
        // At capacity, drop quiescent entries starting from the LRU end.
        // A fully busy registry may briefly exceed the cap rather than
        // break a live gate's accounting.
        while gates.len() >= self.capacity {
            match gates.peek_lru() {
                Some((_, gate)) if gate.is_quiescent() => {
                    gates.pop_lru();
                }
                _ => break,
            }
        }

        let gate = Arc::new(DomainGate::new(domain, &params));
        gates.put(domain.to_string(), Arc::clone(&gate));
        gate
    }

    fn sweep_idle(&self, gates: &mut LruCache<String, Arc<DomainGate>>) {
        let now = Instant::now();
        let expired: Vec<String> = gates
            .iter()
            .filter(|(_, gate)| {
                gate.is_quiescent()
                    && now.saturating_duration_since(gate.idle_since()) >= self.idle_ttl
            })
            .map(|(domain, _)| domain.clone())
            .collect();
        for domain in expired {
            gates.pop(&domain);
        }
    }

    /// Non-creating lookup. Read-only queries must not register a domain.
    pub(crate) fn peek(&self, domain: &str) -> Option<Arc<DomainGate>> {
        self.gates
            .lock()
            .expect("registry lock poisoned")
            .peek(domain)
            .cloned()
    }

    pub(crate) fn apply_tuning(&self, limit: Option<usize>, base_rate: Option<f64>) {
        {
            let mut params = self.params.lock().expect("params lock poisoned");
            if let Some(limit) = limit {
                params.limit = limit;
            }
            if let Some(rate) = base_rate {
                params.base_rate = rate;
                params.min_rate = params.min_rate.min(rate);
            }
        }
        let gates = self.gates.lock().expect("registry lock poisoned");
        for (_, gate) in gates.iter() {
            if let Some(limit) = limit {
                gate.set_limit(limit);
            }
            if let Some(rate) = base_rate {
                gate.set_base_rate(rate);
            }
        }
    }

    pub(crate) fn snapshots(&self) -> Vec<DomainSnapshot> {
        let gates = self.gates.lock().expect("registry lock poisoned");
        gates.iter().map(|(_, gate)| gate.snapshot()).collect()
    }

    pub(crate) fn queued_total(&self) -> usize {
        let gates = self.gates.lock().expect("registry lock poisoned");
        gates.iter().map(|(_, gate)| gate.waiter_count()).sum()
    }

    pub(crate) fn tracked(&self) -> usize {
        self.gates.lock().expect("registry lock poisoned").len()
    }
}
