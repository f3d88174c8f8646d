//! End-to-end orchestrator behavior against a scripted transport.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{COOKIE, SERVER, SET_COOKIE};
use http::{HeaderMap, HeaderValue, Method};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use floodgate::transport::WireTiming;
use floodgate::{
    ChallengeKind, Orchestrator, OrchestratorConfig, OutcomeKind, RequestTask, ScriptEngine,
    ScriptError, TaskOutcome, Transport, TransportError, TransportRequest, TransportResponse,
};

type Handler =
    Box<dyn Fn(&TransportRequest) -> Result<TransportResponse, TransportError> + Send + Sync>;

/// Transport driven by a closure, recording every request it sees along with
/// concurrency high-water marks.
struct ScriptedTransport {
    handler: Handler,
    seen: Mutex<Vec<TransportRequest>>,
    active: AtomicUsize,
    high_water: AtomicUsize,
    delay: Duration,
}

impl ScriptedTransport {
    fn new(
        handler: impl Fn(&TransportRequest) -> Result<TransportResponse, TransportError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            seen: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            delay: Duration::ZERO,
        })
    }

    fn with_delay(
        delay: Duration,
        handler: impl Fn(&TransportRequest) -> Result<TransportResponse, TransportError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            seen: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            delay,
        })
    }

    fn requests(&self) -> Vec<TransportRequest> {
        self.seen.lock().unwrap().clone()
    }

    fn request_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.clone());
        (self.handler)(&request)
    }
}

fn response(status: u16, headers: Vec<(&str, &str)>, body: &str, url: &Url) -> TransportResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    TransportResponse {
        status,
        headers: map,
        body: Bytes::from(body.to_string()),
        url: url.clone(),
        timing: WireTiming::default(),
    }
}

fn content(url: &Url) -> TransportResponse {
    response(200, vec![("server", "cloudflare")], "real content", url)
}

const CHALLENGE_PAGE: &str = r#"
<html><head><title>Just a moment...</title></head>
<body>
  <script>window._cf_chl_opt = {cvId: "3"};</script>
  <form id='challenge-form' action='/cdn-cgi/l/chk_jschl?__cf_chl_f_tk=tok' method='POST'>
    <input type='hidden' name='r' value='abc'/>
    <input type='hidden' name='pass' value='ghi'/>
  </form>
</body></html>
"#;

fn challenge_page(url: &Url) -> TransportResponse {
    response(503, vec![("server", "cloudflare")], CHALLENGE_PAGE, url)
}

fn has_clearance(request: &TransportRequest) -> bool {
    request
        .headers
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|cookie| cookie.contains("cf_clearance=cleared"))
}

struct StubEngine;

impl ScriptEngine for StubEngine {
    fn evaluate_challenge(&self, _page_html: &str, _host: &str) -> Result<String, ScriptError> {
        Ok("42.195".into())
    }
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        requests_per_second: 1000.0,
        burst_capacity: 1000.0,
        ..OrchestratorConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn plain_success_flows_through() {
    let transport = ScriptedTransport::new(|request| Ok(content(&request.url)));
    let orchestrator = Orchestrator::builder(fast_config())
        .with_transport(transport.clone())
        .without_logging()
        .build()
        .unwrap();

    let outcome = orchestrator.get("https://plain.test/data").await.unwrap();
    let response = outcome.into_response().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "real content");

    let stats = orchestrator.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(orchestrator.metrics().successes, 1);
}

#[tokio::test(start_paused = true)]
async fn per_domain_cap_holds_under_batch_load() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_millis(20), |request| Ok(content(&request.url)));
    let orchestrator = Orchestrator::builder(OrchestratorConfig {
        global_concurrency: 64,
        per_domain_concurrency: 5,
        ..fast_config()
    })
    .with_transport(transport.clone())
    .without_logging()
    .build()
    .unwrap();

    let tasks: Vec<RequestTask> = (0..50)
        .map(|i| RequestTask::get(format!("https://capped.test/item/{i}")).unwrap())
        .collect();
    let results = orchestrator.submit_batch(tasks).await;

    assert_eq!(results.len(), 50);
    assert!(results.iter().all(|(_, outcome)| outcome.is_success()));
    assert!(transport.high_water.load(Ordering::SeqCst) <= 5);
    assert_eq!(orchestrator.metrics().domain("capped.test").unwrap().completed, 50);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_backs_off_and_delays_the_next_admission() {
    let transport = ScriptedTransport::new(|request| {
        Ok(response(
            429,
            vec![("server", "cloudflare")],
            "slow down",
            &request.url,
        ))
    });
    let orchestrator = Orchestrator::builder(OrchestratorConfig {
        requests_per_second: 4.0,
        burst_capacity: 8.0,
        ..OrchestratorConfig::default()
    })
    .with_transport(transport.clone())
    .without_logging()
    .build()
    .unwrap();

    let outcome = orchestrator.get("https://limited.test/").await.unwrap();
    let TaskOutcome::RateLimited { backoff_until } = outcome else {
        panic!("expected RateLimited, got {:?}", outcome.kind());
    };
    assert!(backoff_until > Instant::now());
    assert!(orchestrator.backoff_until("limited.test").is_some());

    let snapshot = orchestrator.stats();
    let domain = snapshot.domain("limited.test").unwrap();
    assert_eq!(domain.effective_rate, 2.0);
    assert_eq!(domain.consecutive_failures, 1);

    // The next task to the same domain waits out the penalty in admission.
    let started = Instant::now();
    let second = orchestrator.get("https://limited.test/").await.unwrap();
    assert_eq!(second.kind(), OutcomeKind::RateLimited);
    assert!(Instant::now() - started >= Duration::from_millis(900));
}

#[tokio::test(start_paused = true)]
async fn script_challenge_solves_and_reexecutes_once() {
    let transport = ScriptedTransport::new(|request| {
        if request.method == Method::POST {
            let mut resp = response(302, vec![], "", &request.url);
            resp.headers.append(
                SET_COOKIE,
                HeaderValue::from_static("cf_clearance=cleared; Path=/"),
            );
            return Ok(resp);
        }
        if has_clearance(request) {
            Ok(content(&request.url))
        } else {
            Ok(challenge_page(&request.url))
        }
    });
    let orchestrator = Orchestrator::builder(fast_config())
        .with_transport(transport.clone())
        .with_script_engine(Arc::new(StubEngine))
        .without_logging()
        .build()
        .unwrap();

    let outcome = orchestrator.get("https://shielded.test/data").await.unwrap();
    assert!(outcome.is_success());

    let requests = transport.requests();
    let gets: Vec<_> = requests.iter().filter(|r| r.method == Method::GET).collect();
    let posts: Vec<_> = requests.iter().filter(|r| r.method == Method::POST).collect();
    assert_eq!(gets.len(), 2);
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].url.path(), "/cdn-cgi/l/chk_jschl");
    assert!(has_clearance(gets[1]));

    let metrics = orchestrator.metrics();
    let js = metrics
        .challenges
        .iter()
        .find(|c| c.kind == ChallengeKind::Javascript)
        .unwrap();
    assert_eq!(js.attempts, 1);
    assert_eq!(js.solved, 1);
}

#[tokio::test(start_paused = true)]
async fn cached_solution_skips_the_solver_for_followers() {
    let transport = ScriptedTransport::new(|request| {
        if request.method == Method::POST {
            let mut resp = response(302, vec![], "", &request.url);
            resp.headers.append(
                SET_COOKIE,
                HeaderValue::from_static("cf_clearance=cleared; Path=/"),
            );
            return Ok(resp);
        }
        if has_clearance(request) {
            Ok(content(&request.url))
        } else {
            Ok(challenge_page(&request.url))
        }
    });
    let orchestrator = Orchestrator::builder(fast_config())
        .with_transport(transport.clone())
        .with_script_engine(Arc::new(StubEngine))
        .without_logging()
        .build()
        .unwrap();

    assert!(orchestrator.get("https://shielded.test/a").await.unwrap().is_success());
    assert!(orchestrator.get("https://shielded.test/b").await.unwrap().is_success());

    // One solve covered both tasks; the second presented the cached cookie.
    assert_eq!(orchestrator.metrics().challenges[0].attempts, 1);
    let posts = transport
        .requests()
        .iter()
        .filter(|r| r.method == Method::POST)
        .count();
    assert_eq!(posts, 1);
}

#[tokio::test(start_paused = true)]
async fn unsupported_challenge_kind_fails_fast() {
    let transport = ScriptedTransport::new(|request| {
        Ok(response(
            403,
            vec![("server", "cloudflare")],
            "<html>blocked</html>",
            &request.url,
        ))
    });
    // No solvers registered at all.
    let orchestrator = Orchestrator::builder(fast_config())
        .with_transport(transport.clone())
        .without_logging()
        .build()
        .unwrap();

    let outcome = orchestrator.get("https://blocked.test/").await.unwrap();
    let TaskOutcome::ChallengeUnsolved { kind, attempts } = outcome else {
        panic!("expected ChallengeUnsolved, got {:?}", outcome.kind());
    };
    assert_eq!(kind, ChallengeKind::Unknown);
    assert_eq!(attempts, 0);
    // Exactly one wire request: no solve, no refetch.
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn solve_budget_exhaustion_is_terminal() {
    // The challenge never clears no matter what cookie is presented.
    let transport = ScriptedTransport::new(|request| {
        if request.method == Method::POST {
            let mut resp = response(302, vec![], "", &request.url);
            resp.headers.append(
                SET_COOKIE,
                HeaderValue::from_static("cf_clearance=useless; Path=/"),
            );
            return Ok(resp);
        }
        Ok(challenge_page(&request.url))
    });
    let orchestrator = Orchestrator::builder(fast_config())
        .with_transport(transport.clone())
        .with_script_engine(Arc::new(StubEngine))
        .without_logging()
        .build()
        .unwrap();

    let task = RequestTask::get("https://stubborn.test/")
        .unwrap()
        .with_solve_attempts(2);
    let outcome = orchestrator.submit(task).await;
    let TaskOutcome::ChallengeUnsolved { kind, attempts } = outcome else {
        panic!("expected ChallengeUnsolved, got {:?}", outcome.kind());
    };
    assert_eq!(kind, ChallengeKind::Javascript);
    assert_eq!(attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn transport_failures_retry_then_surface() {
    let transport =
        ScriptedTransport::new(|_| Err(TransportError::ConnectionFailed("refused".into())));
    let orchestrator = Orchestrator::builder(fast_config())
        .with_transport(transport.clone())
        .without_logging()
        .build()
        .unwrap();

    let outcome = orchestrator.get("https://down.test/").await.unwrap();
    let TaskOutcome::TransportFailed { attempts, .. } = outcome else {
        panic!("expected TransportFailed, got {:?}", outcome.kind());
    };
    assert_eq!(attempts, 3);
    assert_eq!(transport.request_count(), 3);
    // The terminal release backed the domain off.
    assert!(orchestrator.backoff_until("down.test").is_some());
}

#[tokio::test(start_paused = true)]
async fn deadline_under_saturation_never_touches_the_wire() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_secs(10), |request| Ok(content(&request.url)));
    let orchestrator = Arc::new(
        Orchestrator::builder(OrchestratorConfig {
            global_concurrency: 1,
            per_domain_concurrency: 1,
            ..fast_config()
        })
        .with_transport(transport.clone())
        .without_logging()
        .build()
        .unwrap(),
    );

    let holder = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.get("https://busy.test/slow").await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let hopeless = RequestTask::get("https://busy.test/urgent")
        .unwrap()
        .with_timeout(Duration::from_millis(100));
    let outcome = orchestrator.submit(hopeless).await;
    assert_eq!(outcome.kind(), OutcomeKind::DeadlineExceeded);
    // Only the holder reached the transport.
    assert!(transport.request_count() <= 1);

    assert!(holder.await.unwrap().is_success());
}

#[tokio::test(start_paused = true)]
async fn cancelled_submission_frees_its_slot() {
    let transport =
        ScriptedTransport::with_delay(Duration::from_secs(30), |request| Ok(content(&request.url)));
    let orchestrator = Arc::new(
        Orchestrator::builder(OrchestratorConfig {
            global_concurrency: 1,
            per_domain_concurrency: 1,
            request_timeout: Duration::from_secs(60),
            ..fast_config()
        })
        .with_transport(transport.clone())
        .without_logging()
        .build()
        .unwrap(),
    );

    let task = RequestTask::get("https://slow.test/").unwrap();
    let cancelled = tokio::time::timeout(Duration::from_secs(1), orchestrator.submit(task)).await;
    assert!(cancelled.is_err());
    assert_eq!(orchestrator.stats().in_flight, 0);

    // The freed slot admits the next task immediately (no multi-second wait
    // beyond its own transport time).
    let started = Instant::now();
    let outcome = orchestrator.get("https://slow.test/again").await.unwrap();
    assert!(outcome.is_success());
    assert!(Instant::now() - started <= Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn batch_results_pair_ids_with_outcomes() {
    let transport = ScriptedTransport::new(|request| {
        if request.url.host_str() == Some("bad.test") {
            Err(TransportError::ConnectionFailed("refused".into()))
        } else {
            Ok(content(&request.url))
        }
    });
    let orchestrator = Orchestrator::builder(fast_config())
        .with_transport(transport.clone())
        .without_logging()
        .build()
        .unwrap();

    let good = RequestTask::get("https://good.test/").unwrap();
    let bad = RequestTask::get("https://bad.test/").unwrap();
    let (good_id, bad_id) = (good.id, bad.id);

    let results = orchestrator.submit_batch(vec![good, bad]).await;
    let by_id = |id| {
        results
            .iter()
            .find(|(task_id, _)| *task_id == id)
            .map(|(_, outcome)| outcome.kind())
            .unwrap()
    };
    assert_eq!(by_id(good_id), OutcomeKind::Success);
    assert_eq!(by_id(bad_id), OutcomeKind::TransportFailed);
}
