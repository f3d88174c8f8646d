//! # floodgate
//!
//! Concurrent request orchestration for bulk HTTP access against targets
//! behind bot-mitigation layers.
//!
//! Callers submit tasks; the orchestrator owns admission (a global budget
//! plus per-domain slots and adaptive token buckets), drives each request
//! over a pluggable transport, classifies every response for mitigation
//! interstitials, and routes challenges through per-kind solvers before
//! returning one terminal outcome per task.
//!
//! ## Example
//!
//! ```no_run
//! use floodgate::{Orchestrator, OrchestratorConfig, RequestTask, TaskOutcome};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::new(OrchestratorConfig::default())?;
//!     let task = RequestTask::get("https://example.com/")?;
//!     match orchestrator.submit(task).await {
//!         TaskOutcome::Success(response) => println!("{}", response.text()),
//!         other => eprintln!("request did not complete: {:?}", other.kind()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod challenges;
pub mod config;
pub mod events;
pub mod identity;
pub mod metrics;
pub mod orchestrator;
pub mod session;
pub mod task;
pub mod transport;

pub use crate::admission::{AdmissionError, DomainSnapshot};
pub use crate::challenges::classifier::{ChallengeKind, classify};
pub use crate::challenges::context::{ChallengeContext, ChallengeSolution};
pub use crate::challenges::solvers::{
    ChallengeSolver, JavascriptSolver, ScriptEngine, ScriptError, SolveError, SolverRegistry,
    TokenProviderError, TokenRequest, TurnstileSolver, TurnstileToken, TurnstileTokenProvider,
};
pub use crate::config::{
    BackpressurePolicy, ConfigError, OrchestratorConfig, SolverTimeouts, TuningUpdate,
};
pub use crate::events::{EventHandler, OrchestratorEvent};
pub use crate::identity::{BrowserIdentity, FingerprintProvider, StaticIdentityProvider, TlsIdentity};
pub use crate::metrics::{MetricsCollector, MetricsSink, MetricsSnapshot};
pub use crate::orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorError, StatsSnapshot,
};
pub use crate::session::{CookiePair, MemorySessionStore, SessionStore};
pub use crate::task::{
    OutcomeKind, Priority, RequestTask, TaskBuildError, TaskId, TaskOutcome, TaskResponse,
};
pub use crate::transport::{
    ReqwestTransport, Transport, TransportError, TransportRequest, TransportResponse,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
