//! Challenge solver registry.
//!
//! One pluggable strategy per challenge kind, each independently time-boxed.
//! Kinds without a registered strategy fail fast as unsolvable so no attempt
//! budget or wall clock is wasted on them.

pub mod javascript;
pub mod turnstile;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use super::classifier::ChallengeKind;
use super::context::{ChallengeContext, ChallengeSolution};
use crate::config::SolverTimeouts;
use crate::transport::Transport;

pub use javascript::{JavascriptSolver, ScriptEngine, ScriptError};
pub use turnstile::{
    TokenProviderError, TokenRequest, TurnstileSolver, TurnstileToken, TurnstileTokenProvider,
};

/// A resolution strategy for one challenge kind.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn solve(
        &self,
        ctx: &ChallengeContext<'_>,
        transport: &Arc<dyn Transport>,
    ) -> Result<ChallengeSolution, SolveError>;
}

#[derive(Debug, Error)]
pub enum SolveError {
    /// No strategy can resolve this kind. Terminal for the task; consumes no
    /// solve attempt.
    #[error("no solver registered for {kind} challenges")]
    Unsolvable { kind: ChallengeKind },
    /// The strategy ran past its per-kind budget. Retryable.
    #[error("{kind} solver exceeded its {limit:?} budget")]
    Timeout { kind: ChallengeKind, limit: Duration },
    /// The strategy ran and failed. Retryable within the solve budget.
    #[error("{kind} solver failed: {reason}")]
    Failed { kind: ChallengeKind, reason: String },
}

impl SolveError {
    pub fn failed(kind: ChallengeKind, reason: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_unsolvable(&self) -> bool {
        matches!(self, SolveError::Unsolvable { .. })
    }
}

/// Maps challenge kinds to strategies and enforces their time boxes.
/// Read-only after construction apart from the tunable timeouts.
pub struct SolverRegistry {
    solvers: HashMap<ChallengeKind, Arc<dyn ChallengeSolver>>,
    timeouts: Mutex<SolverTimeouts>,
}

impl SolverRegistry {
    pub fn new(timeouts: SolverTimeouts) -> Self {
        Self {
            solvers: HashMap::new(),
            timeouts: Mutex::new(timeouts),
        }
    }

    pub fn register(&mut self, kind: ChallengeKind, solver: Arc<dyn ChallengeSolver>) {
        self.solvers.insert(kind, solver);
    }

    pub fn supports(&self, kind: ChallengeKind) -> bool {
        self.solvers.contains_key(&kind)
    }

    pub fn set_timeouts(&self, timeouts: SolverTimeouts) {
        *self.timeouts.lock().expect("solver timeouts lock poisoned") = timeouts;
    }

    pub fn timeout_for(&self, kind: ChallengeKind) -> Duration {
        self.timeouts
            .lock()
            .expect("solver timeouts lock poisoned")
            .for_kind(kind)
    }

    /// Runs the registered strategy under the deadline carried by the
    /// context. The caller builds that deadline from the per-kind budget and
    /// the task deadline, whichever is tighter.
    pub async fn solve(
        &self,
        ctx: &ChallengeContext<'_>,
        transport: &Arc<dyn Transport>,
    ) -> Result<ChallengeSolution, SolveError> {
        let Some(solver) = self.solvers.get(&ctx.kind) else {
            return Err(SolveError::Unsolvable { kind: ctx.kind });
        };

        let limit = self.timeout_for(ctx.kind);
        log::debug!(
            "solving {} challenge for {} with {} (attempt {})",
            ctx.kind,
            ctx.url,
            solver.name(),
            ctx.solve_attempt
        );
        match tokio::time::timeout_at(ctx.solve_deadline, solver.solve(ctx, transport)).await {
            Ok(result) => result,
            Err(_) => Err(SolveError::Timeout {
                kind: ctx.kind,
                limit,
            }),
        }
    }
}
