//! The orchestrator: admission, execution, classification, and resolution
//! wired into one submit loop.
//!
//! `submit` drives a single task through its whole lifecycle and always
//! returns a terminal [`TaskOutcome`]. The admission permit is held across
//! the entire solve-and-retry cycle, so a task mid-resolution keeps its
//! concurrency slot instead of racing its own domain.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

use crate::admission::{
    AdmissionController, AdmissionError, BackoffReport, DomainSnapshot, Permit, ReleaseOutcome,
};
use crate::challenges::classifier::{ChallengeKind, classify};
use crate::challenges::context::{ChallengeContext, ChallengeSolution};
use crate::challenges::solvers::{
    ChallengeSolver, JavascriptSolver, ScriptEngine, SolveError, SolverRegistry, TurnstileSolver,
    TurnstileTokenProvider,
};
use crate::config::{ConfigError, OrchestratorConfig, TuningUpdate};
use crate::events::{
    BackoffEvent, ChallengeEvent, EventDispatcher, EventHandler, LoggingHandler, OrchestratorEvent,
    PreRequestEvent, ResponseEvent, RetryEvent, SinkHandler, TaskCompletedEvent,
};
use crate::identity::{FingerprintProvider, StaticIdentityProvider};
use crate::metrics::{MetricsCollector, MetricsSink, MetricsSnapshot};
use crate::session::{MemorySessionStore, SessionStore};
use crate::task::{RequestTask, TaskBuildError, TaskId, TaskOutcome, TaskResponse};
use crate::transport::{RequestExecutor, ReqwestTransport, Transport, TransportError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("transport construction failed: {0}")]
    Transport(TransportError),
}

/// Point-in-time counters for the whole orchestrator.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub in_flight: usize,
    pub queued: usize,
    pub global_limit: usize,
    pub tracked_domains: usize,
    pub domains: Vec<DomainSnapshot>,
}

impl StatsSnapshot {
    pub fn domain(&self, name: &str) -> Option<&DomainSnapshot> {
        self.domains.iter().find(|d| d.domain == name)
    }
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    transport: Option<Arc<dyn Transport>>,
    identity: Option<Arc<dyn FingerprintProvider>>,
    sessions: Option<Arc<dyn SessionStore>>,
    script_engine: Option<Arc<dyn ScriptEngine>>,
    turnstile_tokens: Option<Arc<dyn TurnstileTokenProvider>>,
    extra_solvers: Vec<(ChallengeKind, Arc<dyn ChallengeSolver>)>,
    sink: Option<Arc<dyn MetricsSink>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    logging: bool,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            transport: None,
            identity: None,
            sessions: None,
            script_engine: None,
            turnstile_tokens: None,
            extra_solvers: Vec::new(),
            sink: None,
            handlers: Vec::new(),
            logging: true,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn FingerprintProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Enables the script-challenge solver. Without an engine, script
    /// challenges fail fast as unsolvable.
    pub fn with_script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.script_engine = Some(engine);
        self
    }

    /// Enables the Turnstile solver. Without a provider, widget challenges
    /// fail fast as unsolvable.
    pub fn with_turnstile_tokens(mut self, provider: Arc<dyn TurnstileTokenProvider>) -> Self {
        self.turnstile_tokens = Some(provider);
        self
    }

    /// Registers a custom strategy for one challenge kind, replacing any
    /// built-in solver for that kind.
    pub fn with_solver(mut self, kind: ChallengeKind, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.extra_solvers.push((kind, solver));
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn without_logging(mut self) -> Self {
        self.logging = false;
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new().map_err(OrchestratorError::Transport)?),
        };
        let identity: Arc<dyn FingerprintProvider> = self
            .identity
            .unwrap_or_else(|| Arc::new(StaticIdentityProvider::chrome()));
        let sessions: Arc<dyn SessionStore> = self
            .sessions
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        let mut solvers = SolverRegistry::new(self.config.solver_timeouts);
        if let Some(engine) = self.script_engine {
            solvers.register(
                ChallengeKind::Javascript,
                Arc::new(JavascriptSolver::new(engine).with_solution_ttl(self.config.solution_ttl)),
            );
        }
        if let Some(provider) = self.turnstile_tokens {
            solvers.register(
                ChallengeKind::Turnstile,
                Arc::new(
                    TurnstileSolver::new(provider).with_solution_ttl(self.config.solution_ttl),
                ),
            );
        }
        for (kind, solver) in self.extra_solvers {
            solvers.register(kind, solver);
        }

        let collector = Arc::new(MetricsCollector::new(self.config.metrics_window));
        let mut events = EventDispatcher::new();
        if self.logging {
            events.register(Arc::new(LoggingHandler));
        }
        events.register(Arc::new(SinkHandler::new(
            Arc::clone(&collector) as Arc<dyn MetricsSink>
        )));
        if let Some(sink) = self.sink {
            events.register(Arc::new(SinkHandler::new(sink)));
        }
        for handler in self.handlers {
            events.register(handler);
        }

        let executor = RequestExecutor::new(
            Arc::clone(&transport),
            identity,
            sessions,
            self.config.request_timeout,
            &self.config.overridable_headers,
        );

        Ok(Orchestrator {
            admission: AdmissionController::new(&self.config),
            executor,
            transport,
            solvers,
            events,
            collector,
            config: RwLock::new(self.config),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        })
    }
}

pub struct Orchestrator {
    admission: AdmissionController,
    executor: RequestExecutor,
    transport: Arc<dyn Transport>,
    solvers: SolverRegistry,
    events: EventDispatcher,
    collector: Arc<MetricsCollector>,
    config: RwLock<OrchestratorConfig>,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Default stack with the built-in transport, identity, and store.
    pub fn new(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        Self::builder(config).build()
    }

    /// Drives one task to a terminal outcome. Never returns early: every
    /// submitted task produces exactly one outcome and one completion event.
    pub async fn submit(&self, task: RequestTask) -> TaskOutcome {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let task_id = task.id;
        let domain = task.domain.clone();

        let outcome = self.run(task).await;

        self.completed.fetch_add(1, Ordering::Relaxed);
        self.events
            .emit(OrchestratorEvent::TaskCompleted(TaskCompletedEvent {
                task_id,
                domain,
                outcome: outcome.kind(),
                elapsed: Instant::now() - started,
            }));
        outcome
    }

    /// Fans a batch out concurrently; each task is admitted independently.
    pub async fn submit_batch(&self, tasks: Vec<RequestTask>) -> Vec<(TaskId, TaskOutcome)> {
        join_all(tasks.into_iter().map(|task| async {
            let id = task.id;
            (id, self.submit(task).await)
        }))
        .await
    }

    /// Convenience GET against the default task settings.
    pub async fn get(&self, url: impl AsRef<str>) -> Result<TaskOutcome, TaskBuildError> {
        Ok(self.submit(RequestTask::get(url)?).await)
    }

    async fn run(&self, task: RequestTask) -> TaskOutcome {
        let permit = match self.admission.acquire(&task).await {
            Ok(permit) => permit,
            Err(AdmissionError::Rejected) => return TaskOutcome::AdmissionRejected,
            Err(AdmissionError::DeadlineExceeded) => return TaskOutcome::DeadlineExceeded,
        };
        self.resolve(task, permit).await
    }

    /// The per-task state machine, entered with an admission permit held.
    async fn resolve(&self, task: RequestTask, permit: Permit) -> TaskOutcome {
        let (max_transport, max_solve, retry_base, retry_cap) = {
            let config = self.config.read().expect("config lock poisoned");
            (
                task.max_transport_attempts
                    .unwrap_or(config.max_transport_attempts)
                    .max(1),
                task.max_solve_attempts.unwrap_or(config.max_solve_attempts),
                config.retry_backoff_base,
                config.retry_backoff_cap,
            )
        };

        let mut solution: Option<ChallengeSolution> = permit
            .cached_solution()
            .filter(|cached| cached.is_fresh(Instant::now()));
        let mut attempt: u32 = 0;
        let mut transport_failures: u32 = 0;
        let mut solve_attempts: u32 = 0;

        loop {
            if task.deadline_expired(Instant::now()) {
                permit.release(ReleaseOutcome::Cancelled);
                return TaskOutcome::DeadlineExceeded;
            }

            attempt += 1;
            self.events
                .emit(OrchestratorEvent::PreRequest(PreRequestEvent {
                    task_id: task.id,
                    domain: task.domain.clone(),
                    method: task.method.clone(),
                    url: task.url.clone(),
                    attempt,
                }));

            let report = match self
                .executor
                .execute(&task, solution.as_ref(), task.deadline)
                .await
            {
                Ok(report) => report,
                Err(error) => {
                    if task.deadline_expired(Instant::now()) {
                        permit.release(ReleaseOutcome::Cancelled);
                        return TaskOutcome::DeadlineExceeded;
                    }
                    transport_failures += 1;
                    if transport_failures >= max_transport {
                        let backoff = permit.release(ReleaseOutcome::TransportFailure);
                        self.emit_backoff(&task.domain, backoff);
                        return TaskOutcome::TransportFailed {
                            error,
                            attempts: transport_failures,
                        };
                    }
                    let pause = retry_pause(retry_base, retry_cap, transport_failures);
                    self.events.emit(OrchestratorEvent::Retry(RetryEvent {
                        task_id: task.id,
                        domain: task.domain.clone(),
                        attempt: attempt + 1,
                        pause,
                    }));
                    self.pause_within_deadline(pause, task.deadline).await;
                    continue;
                }
            };

            self.events.emit(OrchestratorEvent::Response(ResponseEvent {
                task_id: task.id,
                domain: task.domain.clone(),
                status: report.response.status,
                elapsed: report.timing.total,
            }));

            let body = report.response.text().into_owned();
            let kind = classify(report.response.status, &report.response.headers, &body);

            match kind {
                ChallengeKind::None => {
                    permit.release(ReleaseOutcome::Success {
                        latency: Some(report.timing.total),
                    });
                    return TaskOutcome::Success(TaskResponse::from_transport(report.response));
                }
                ChallengeKind::RateLimit => {
                    let backoff = permit.release(ReleaseOutcome::RateLimited);
                    self.emit_backoff(&task.domain, backoff.clone());
                    let backoff_until = backoff
                        .map(|report| report.backoff_until)
                        .unwrap_or_else(Instant::now);
                    return TaskOutcome::RateLimited { backoff_until };
                }
                kind => {
                    debug_assert!(kind.is_solvable_kind());
                    // Whatever we were presenting did not clear the edge.
                    permit.invalidate_solution();
                    solution = None;

                    if !self.solvers.supports(kind) {
                        permit.release(ReleaseOutcome::Failure);
                        return TaskOutcome::ChallengeUnsolved { kind, attempts: 0 };
                    }
                    if solve_attempts >= max_solve {
                        permit.release(ReleaseOutcome::Failure);
                        return TaskOutcome::ChallengeUnsolved {
                            kind,
                            attempts: solve_attempts,
                        };
                    }
                    solve_attempts += 1;

                    let now = Instant::now();
                    let mut solve_deadline = now + self.solvers.timeout_for(kind);
                    if let Some(deadline) = task.deadline {
                        solve_deadline = solve_deadline.min(deadline);
                    }
                    let ctx = ChallengeContext {
                        kind,
                        detected_at: now,
                        url: &report.response.url,
                        status: report.response.status,
                        headers: &report.response.headers,
                        body: &body,
                        solve_attempt: solve_attempts,
                        solve_deadline,
                    };

                    let result = self.solvers.solve(&ctx, &self.transport).await;
                    let elapsed = Instant::now() - now;
                    self.events
                        .emit(OrchestratorEvent::Challenge(ChallengeEvent {
                            task_id: task.id,
                            domain: task.domain.clone(),
                            kind,
                            solved: result.is_ok(),
                            elapsed,
                            attempt: solve_attempts,
                        }));

                    match result {
                        Ok(solved) => {
                            permit.store_solution(solved.clone());
                            solution = Some(solved);
                        }
                        Err(SolveError::Unsolvable { .. }) => {
                            permit.release(ReleaseOutcome::Failure);
                            return TaskOutcome::ChallengeUnsolved {
                                kind,
                                attempts: solve_attempts - 1,
                            };
                        }
                        Err(err) => {
                            log::debug!("{}: {}", task.id, err);
                            if solve_attempts >= max_solve {
                                permit.release(ReleaseOutcome::Failure);
                                return TaskOutcome::ChallengeUnsolved {
                                    kind,
                                    attempts: solve_attempts,
                                };
                            }
                            // Loop back to refetch a fresh interstitial.
                        }
                    }
                }
            }
        }
    }

    async fn pause_within_deadline(&self, pause: Duration, deadline: Option<Instant>) {
        let wake = Instant::now() + pause;
        match deadline {
            Some(deadline) => tokio::time::sleep_until(wake.min(deadline)).await,
            None => tokio::time::sleep_until(wake).await,
        }
    }

    fn emit_backoff(&self, domain: &str, report: Option<BackoffReport>) {
        if let Some(report) = report {
            self.events.emit(OrchestratorEvent::Backoff(BackoffEvent {
                domain: domain.to_string(),
                consecutive_failures: report.consecutive_failures,
                backoff_until: report.backoff_until,
                effective_rate: report.effective_rate,
            }));
        }
    }

    /// When the named domain's current backoff clears, if one is pending.
    pub fn backoff_until(&self, domain: &str) -> Option<Instant> {
        self.admission.backoff_until(domain)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let admission = self.admission.stats();
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            in_flight: admission.in_flight,
            queued: admission.queued,
            global_limit: admission.limit,
            tracked_domains: admission.tracked_domains,
            domains: self.admission.domain_snapshots(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.collector.snapshot()
    }

    /// Applies a runtime tuning update atomically: the merged configuration
    /// is validated before any limit changes.
    pub fn apply_tuning(&self, update: TuningUpdate) -> Result<(), ConfigError> {
        let mut config = self.config.write().expect("config lock poisoned");
        let mut candidate = config.clone();
        if let Some(global) = update.global_concurrency {
            candidate.global_concurrency = global;
        }
        if let Some(per_domain) = update.per_domain_concurrency {
            candidate.per_domain_concurrency = per_domain;
        }
        if let Some(rate) = update.requests_per_second {
            candidate.requests_per_second = rate;
        }
        if let Some(timeouts) = update.solver_timeouts {
            candidate.solver_timeouts = timeouts;
        }
        candidate.validate()?;

        self.admission.apply_tuning(
            update.global_concurrency,
            update.per_domain_concurrency,
            update.requests_per_second,
        );
        if let Some(timeouts) = update.solver_timeouts {
            self.solvers.set_timeouts(timeouts);
        }
        *config = candidate;
        Ok(())
    }
}

/// Jittered exponential pause between transport retries.
fn retry_pause(base: Duration, cap: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let scaled = base.saturating_mul(1u32 << exponent).min(cap);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    scaled.mul_f64(jitter).min(cap)
}
