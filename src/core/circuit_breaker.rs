//! Adaptive per-service circuit breaking.
//!
//! State transitions:
//! - Closed → Open: weighted failure score exceeds the adaptive threshold, the
//!   recent failure rate exceeds 50%, or the windowed p95 latency exceeds twice the
//!   slow-response threshold
//! - Open → HalfOpen: once `recovery_timeout(consecutive_failures)` has passed since
//!   the last failure
//! - HalfOpen → Closed: after `half_open_max_calls` consecutive successes
//! - HalfOpen → Open: on any failure
//!
//! Every breaker keeps its whole state behind one mutex so outcomes for the same
//! service are linearizable; different services never share a lock.
use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use http::StatusCode;
use parking_lot::{Mutex, RwLock};
use scc::HashMap;
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::{CircuitBreakerConfig, FailureWeights, GatewayConfig},
    ports::{MetricsSink, TransportError},
};

/// Failure rate considered normal; the adaptive threshold pivots around it.
const BASELINE_FAILURE_RATE: f64 = 0.05;
/// Failure rate over the outcome window that opens the circuit on its own.
const HIGH_FAILURE_RATE: f64 = 0.5;
/// Number of most recent outcomes used for failure-rate computations.
const OUTCOME_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// Recovery probing, a limited number of calls pass through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a failed outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Http5xx,
    Http4xx,
    Connection,
    SlowResponse,
}

impl FailureKind {
    pub fn weight(self, weights: &FailureWeights) -> f64 {
        match self {
            FailureKind::Timeout => weights.timeout,
            FailureKind::Http5xx => weights.http_5xx,
            FailureKind::Http4xx => weights.http_4xx,
            FailureKind::Connection => weights.connection,
            FailureKind::SlowResponse => weights.slow_response,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Http5xx => "http_5xx",
            FailureKind::Http4xx => "http_4xx",
            FailureKind::Connection => "connection",
            FailureKind::SlowResponse => "slow_response",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was observed about a finished call, before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A response arrived with this status
    Status(StatusCode),
    Timeout,
    Connection,
}

/// Classify a call outcome. Deterministic in its inputs: timeouts and connection
/// errors map directly, 5xx/4xx by status, and any other response slower than
/// `slow_threshold` becomes [`FailureKind::SlowResponse`].
pub fn classify(
    observation: Observation,
    elapsed: Duration,
    slow_threshold: Duration,
) -> Option<FailureKind> {
    match observation {
        Observation::Timeout => Some(FailureKind::Timeout),
        Observation::Connection => Some(FailureKind::Connection),
        Observation::Status(status) if status.is_server_error() => Some(FailureKind::Http5xx),
        Observation::Status(status) if status.is_client_error() => Some(FailureKind::Http4xx),
        Observation::Status(_) if elapsed > slow_threshold => Some(FailureKind::SlowResponse),
        Observation::Status(_) => None,
    }
}

/// Errors that can tell the breaker what kind of failure they represent.
pub trait ClassifyFailure {
    fn observation(&self) -> Observation;
}

impl ClassifyFailure for TransportError {
    fn observation(&self) -> Observation {
        match self {
            TransportError::Timeout(_) => Observation::Timeout,
            _ => Observation::Connection,
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit for '{service}' is open, retry after {retry_after:?}")]
    Open {
        service: String,
        retry_after: Duration,
    },
    #[error(transparent)]
    Call(E),
}

/// Emitted whenever a breaker changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub service: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Receives breaker state changes. Called outside the breaker's lock.
pub trait BreakerObserver: Send + Sync + 'static {
    fn on_state_change(&self, event: &StateChange);
}

impl<F> BreakerObserver for F
where
    F: Fn(&StateChange) + Send + Sync + 'static,
{
    fn on_state_change(&self, event: &StateChange) {
        self(event)
    }
}

/// Returned by [`BreakerObservers::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

/// Observer list shared by every breaker of a [`CircuitBreakers`] registry.
#[derive(Default)]
pub struct BreakerObservers {
    next_id: AtomicU64,
    observers: RwLock<Vec<(u64, Arc<dyn BreakerObserver>)>>,
}

impl BreakerObservers {
    pub fn subscribe(&self, observer: Arc<dyn BreakerObserver>) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, observer));
        ObserverHandle(id)
    }

    /// Returns false if the handle was already removed
    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(id, _)| *id != handle.0);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, event: &StateChange) {
        // clone the list so observers may (un)subscribe from inside a callback
        let observers: Vec<Arc<dyn BreakerObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer.on_state_change(event);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    at: Instant,
    kind: FailureKind,
}

struct BreakerState {
    current: CircuitState,
    failures: VecDeque<FailureRecord>,
    response_times: VecDeque<(Instant, f64)>,
    /// true = success, most recent last
    outcomes: VecDeque<bool>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    threshold: f64,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    total_requests: u64,
    total_failures: u64,
}

impl BreakerState {
    fn new(threshold: f64) -> Self {
        Self {
            current: CircuitState::Closed,
            failures: VecDeque::new(),
            response_times: VecDeque::new(),
            outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
            consecutive_failures: 0,
            consecutive_successes: 0,
            threshold,
            last_failure: None,
            opened_at: None,
            half_open_admitted: 0,
            total_requests: 0,
            total_failures: 0,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn weighted_score(&self, weights: &FailureWeights) -> f64 {
        self.failures.iter().map(|f| f.kind.weight(weights)).sum()
    }

    fn p95_response_time(&self) -> Option<f64> {
        if self.response_times.is_empty() {
            return None;
        }
        let mut samples: Vec<f64> = self.response_times.iter().map(|(_, ms)| *ms).collect();
        samples.sort_by(|a, b| a.total_cmp(b));
        let rank = ((samples.len() as f64) * 0.95).ceil() as usize;
        samples.get(rank.saturating_sub(1)).copied()
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.failures.front() {
            if now.saturating_duration_since(front.at) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        while let Some((at, _)) = self.response_times.front() {
            if now.saturating_duration_since(*at) >= window {
                self.response_times.pop_front();
            } else {
                break;
            }
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.outcomes.len() >= OUTCOME_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
        self.total_requests += 1;
        if !success {
            self.total_failures += 1;
        }
    }
}

/// Adaptive threshold as a pure function of the recent failure rate.
///
/// Above twice the baseline the threshold shrinks proportionally (never below
/// `floor`); below the baseline it grows linearly up to twice the default.
pub fn adaptive_threshold(default: f64, floor: f64, failure_rate: f64) -> f64 {
    let high = 2.0 * BASELINE_FAILURE_RATE;
    if failure_rate > high {
        (default * high / failure_rate).max(floor)
    } else if failure_rate < BASELINE_FAILURE_RATE {
        (default * (2.0 - failure_rate / BASELINE_FAILURE_RATE)).min(2.0 * default)
    } else {
        default
    }
}

/// Point-in-time view of a breaker, safe to serialize for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub weighted_failure_score: f64,
    pub adaptive_threshold: f64,
    pub failure_rate: f64,
    pub p95_response_time_ms: Option<f64>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub recovery_timeout: Duration,
}

/// Circuit breaker guarding calls to one service.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    observers: Arc<BreakerObservers>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_observers(service, config, Arc::new(BreakerObservers::default()))
    }

    pub fn with_observers(
        service: impl Into<String>,
        config: CircuitBreakerConfig,
        observers: Arc<BreakerObservers>,
    ) -> Self {
        Self {
            service: service.into(),
            state: Mutex::new(BreakerState::new(config.failure_threshold)),
            config,
            observers,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().current
    }

    /// Cool-down before an open circuit admits probes:
    /// `base × multiplier^(consecutive_failures / 5)`, capped at the configured maximum.
    pub fn recovery_timeout(&self, consecutive_failures: u32) -> Duration {
        let base = self.config.recovery_timeout_secs as f64;
        let exponent = (consecutive_failures / 5) as i32;
        let secs = base * self.config.recovery_multiplier.powi(exponent);
        let capped = secs.min(self.config.max_recovery_timeout_secs as f64);
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether a call may be issued now. In half-open state each `true` consumes
    /// one of the probe slots.
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now())
    }

    /// Clock-explicit variant of [`CircuitBreaker::can_execute`].
    pub fn can_execute_at(&self, now: Instant) -> bool {
        let mut transition = None;
        let allowed = {
            let mut state = self.state.lock();
            if state.current == CircuitState::Open {
                let timeout = self.recovery_timeout(state.consecutive_failures);
                let cooled_down = state
                    .last_failure
                    .is_none_or(|at| now.saturating_duration_since(at) >= timeout);
                if cooled_down {
                    state.current = CircuitState::HalfOpen;
                    state.half_open_admitted = 0;
                    state.consecutive_successes = 0;
                    transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                }
            }

            match state.current {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    if state.half_open_admitted < self.config.half_open_max_calls {
                        state.half_open_admitted += 1;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            tracing::info!(service = %self.service, "Circuit breaker: {} → {}", from, to);
            self.emit(from, to);
        }
        allowed
    }

    /// Time left until an open circuit starts admitting probes.
    pub fn retry_after(&self) -> Duration {
        let state = self.state.lock();
        if state.current != CircuitState::Open {
            return Duration::ZERO;
        }
        let timeout = self.recovery_timeout(state.consecutive_failures);
        state
            .last_failure
            .map(|at| timeout.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn record_success(&self, response_time_ms: f64) {
        self.record_success_at(response_time_ms, Instant::now());
    }

    /// Clock-explicit variant of [`CircuitBreaker::record_success`].
    pub fn record_success_at(&self, response_time_ms: f64, now: Instant) {
        let mut transition = None;
        {
            let mut state = self.state.lock();
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            state.push_outcome(true);
            state.response_times.push_back((now, response_time_ms));
            state.prune(now, self.config.window());
            self.recompute_threshold(&mut state);

            if state.current == CircuitState::HalfOpen
                && state.consecutive_successes >= self.config.half_open_max_calls
            {
                state.current = CircuitState::Closed;
                state.failures.clear();
                state.half_open_admitted = 0;
                state.opened_at = None;
                transition = Some((CircuitState::HalfOpen, CircuitState::Closed));
            }
        }

        if let Some((from, to)) = transition {
            tracing::info!(service = %self.service, "Circuit breaker: {} → {}", from, to);
            self.emit(from, to);
        }
    }

    pub fn record_failure(&self, kind: FailureKind, response_time_ms: f64) {
        self.record_failure_at(kind, response_time_ms, Instant::now());
    }

    /// Clock-explicit variant of [`CircuitBreaker::record_failure`].
    pub fn record_failure_at(&self, kind: FailureKind, response_time_ms: f64, now: Instant) {
        let mut transition = None;
        {
            let mut state = self.state.lock();
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            state.last_failure = Some(now);
            state.failures.push_back(FailureRecord { at: now, kind });
            state.push_outcome(false);
            state.response_times.push_back((now, response_time_ms));
            state.prune(now, self.config.window());
            self.recompute_threshold(&mut state);

            match state.current {
                CircuitState::Closed => {
                    if let Some(reason) = self.trip_reason(&state) {
                        tracing::warn!(
                            service = %self.service,
                            failure_kind = %kind,
                            consecutive_failures = state.consecutive_failures,
                            "Circuit breaker: closed → open ({})",
                            reason
                        );
                        state.current = CircuitState::Open;
                        state.opened_at = Some(now);
                        transition = Some((CircuitState::Closed, CircuitState::Open));
                    }
                }
                CircuitState::HalfOpen => {
                    tracing::warn!(
                        service = %self.service,
                        failure_kind = %kind,
                        "Circuit breaker: half_open → open (probe failed)"
                    );
                    state.current = CircuitState::Open;
                    state.opened_at = Some(now);
                    state.half_open_admitted = 0;
                    transition = Some((CircuitState::HalfOpen, CircuitState::Open));
                }
                CircuitState::Open => {
                    // late result of a call admitted before opening
                }
            }
        }

        if let Some((from, to)) = transition {
            self.emit(from, to);
        }
    }

    /// Run `call` under the breaker. Outcomes are classified and recorded; a
    /// successful but slow call is recorded as a slow-response failure and its
    /// value is still returned.
    pub async fn execute<T, E, F, Fut>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyFailure,
    {
        if !self.can_execute() {
            return Err(BreakerError::Open {
                service: self.service.clone(),
                retry_after: self.retry_after(),
            });
        }

        let started = Instant::now();
        let result = call().await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let slow = self.config.slow_response_threshold();

        let observation = match &result {
            Ok(_) => Observation::Status(StatusCode::OK),
            Err(e) => e.observation(),
        };
        match classify(observation, elapsed, slow) {
            Some(kind) => self.record_failure(kind, elapsed_ms),
            None => self.record_success(elapsed_ms),
        }

        result.map_err(BreakerError::Call)
    }

    pub fn stats(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            service: self.service.clone(),
            state: state.current,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            weighted_failure_score: state.weighted_score(&self.config.weights),
            adaptive_threshold: state.threshold,
            failure_rate: state.failure_rate(),
            p95_response_time_ms: state.p95_response_time(),
            total_requests: state.total_requests,
            total_failures: state.total_failures,
            recovery_timeout: self.recovery_timeout(state.consecutive_failures),
        }
    }

    /// Force the breaker back to a fresh closed state.
    pub fn reset(&self) {
        let previous = {
            let mut state = self.state.lock();
            let previous = state.current;
            *state = BreakerState::new(self.config.failure_threshold);
            previous
        };
        tracing::info!(service = %self.service, "Circuit breaker reset");
        if previous != CircuitState::Closed {
            self.emit(previous, CircuitState::Closed);
        }
    }

    fn recompute_threshold(&self, state: &mut BreakerState) {
        state.threshold = if state.outcomes.len() >= self.config.minimum_requests {
            adaptive_threshold(
                self.config.failure_threshold,
                self.config.min_failure_threshold,
                state.failure_rate(),
            )
        } else {
            self.config.failure_threshold
        };
    }

    fn trip_reason(&self, state: &BreakerState) -> Option<String> {
        let score = state.weighted_score(&self.config.weights);
        if score > state.threshold {
            return Some(format!(
                "weighted failure score {score:.1} over threshold {:.1}",
                state.threshold
            ));
        }

        if state.outcomes.len() >= self.config.minimum_requests {
            let rate = state.failure_rate();
            if rate > HIGH_FAILURE_RATE {
                return Some(format!("failure rate {:.0}%", rate * 100.0));
            }
        }

        if state.response_times.len() >= self.config.minimum_requests {
            let limit = 2.0 * self.config.slow_response_threshold_ms as f64;
            if let Some(p95) = state.p95_response_time() {
                if p95 > limit {
                    return Some(format!("p95 response time {p95:.0}ms over {limit:.0}ms"));
                }
            }
        }

        None
    }

    fn emit(&self, from: CircuitState, to: CircuitState) {
        self.observers.notify(&StateChange {
            service: self.service.clone(),
            from,
            to,
        });
    }
}

/// Lazily created breakers, one per service, sharing one observer list.
pub struct CircuitBreakers {
    config: Arc<GatewayConfig>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    observers: Arc<BreakerObservers>,
}

impl CircuitBreakers {
    /// Breaker state changes are forwarded to `metrics` for every service.
    pub fn new(config: Arc<GatewayConfig>, metrics: Arc<dyn MetricsSink>) -> Self {
        let observers = Arc::new(BreakerObservers::default());
        observers.subscribe(Arc::new(move |event: &StateChange| {
            metrics.breaker_state(&event.service, event.to);
        }));
        Self {
            config,
            breakers: HashMap::new(),
            observers,
        }
    }

    /// The breaker for `service`, created on first use with its configured settings.
    pub async fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(entry) = self.breakers.get_async(service).await {
            return entry.get().clone();
        }
        self.breakers
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| {
                tracing::debug!(service, "Creating circuit breaker");
                Arc::new(CircuitBreaker::with_observers(
                    service,
                    self.config.breaker_for(service).clone(),
                    self.observers.clone(),
                ))
            })
            .get()
            .clone()
    }

    pub fn subscribe(&self, observer: Arc<dyn BreakerObserver>) -> ObserverHandle {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        self.observers.unsubscribe(handle)
    }

    pub async fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots = Vec::new();
        self.breakers
            .retain_async(|_, breaker| {
                snapshots.push(breaker.stats());
                true
            })
            .await;
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
    }

    #[test]
    fn test_classify_is_deterministic() {
        let slow = Duration::from_millis(500);
        let fast = Duration::from_millis(10);
        let sluggish = Duration::from_millis(900);

        assert_eq!(
            classify(Observation::Timeout, fast, slow),
            Some(FailureKind::Timeout)
        );
        assert_eq!(
            classify(Observation::Connection, fast, slow),
            Some(FailureKind::Connection)
        );
        assert_eq!(
            classify(Observation::Status(StatusCode::BAD_GATEWAY), fast, slow),
            Some(FailureKind::Http5xx)
        );
        assert_eq!(
            classify(Observation::Status(StatusCode::NOT_FOUND), sluggish, slow),
            Some(FailureKind::Http4xx)
        );
        assert_eq!(
            classify(Observation::Status(StatusCode::OK), sluggish, slow),
            Some(FailureKind::SlowResponse)
        );
        assert_eq!(classify(Observation::Status(StatusCode::OK), fast, slow), None);
    }

    #[test]
    fn test_opens_only_after_score_exceeds_threshold() {
        let breaker = CircuitBreaker::new("gen", test_config());
        let now = Instant::now();

        for i in 1..=5 {
            breaker.record_failure_at(FailureKind::Timeout, 100.0, now);
            assert!(breaker.can_execute_at(now), "open too early at failure {i}");
        }

        breaker.record_failure_at(FailureKind::Timeout, 100.0, now);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute_at(now));
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let breaker = CircuitBreaker::new("gen", test_config());
        let start = Instant::now();

        for _ in 0..5 {
            breaker.record_failure_at(FailureKind::Timeout, 100.0, start);
        }
        let later = start + Duration::from_secs(61);
        breaker.record_failure_at(FailureKind::Timeout, 100.0, later);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().weighted_failure_score, 2.0);
    }

    #[test]
    fn test_high_failure_rate_opens_with_light_failures() {
        let breaker = CircuitBreaker::new("gen", test_config());
        let now = Instant::now();

        // 4xx weigh 0.5 each so the weighted score stays low
        for _ in 0..4 {
            breaker.record_success_at(50.0, now);
        }
        for _ in 0..6 {
            breaker.record_failure_at(FailureKind::Http4xx, 50.0, now);
        }

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_p95_latency_degradation_opens() {
        let config = CircuitBreakerConfig {
            slow_response_threshold_ms: 100,
            weights: FailureWeights {
                slow_response: 0.0,
                ..FailureWeights::default()
            },
            ..test_config()
        };
        let breaker = CircuitBreaker::new("gen", config);
        let now = Instant::now();

        for _ in 0..10 {
            breaker.record_success_at(20.0, now);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        // one sample over 2x the slow threshold lifts the p95 of 11 samples
        breaker.record_failure_at(FailureKind::SlowResponse, 450.0, now);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_recovery_timeout_grows_geometrically_and_caps() {
        let breaker = CircuitBreaker::new("gen", test_config());
        assert_eq!(breaker.recovery_timeout(0), Duration::from_secs(30));
        assert_eq!(breaker.recovery_timeout(4), Duration::from_secs(30));
        assert_eq!(breaker.recovery_timeout(5), Duration::from_secs(60));
        assert_eq!(breaker.recovery_timeout(10), Duration::from_secs(120));
        assert_eq!(breaker.recovery_timeout(50), Duration::from_secs(300));
    }

    #[test]
    fn test_half_open_admits_quota_then_closes() {
        let breaker = CircuitBreaker::new("gen", test_config());
        let start = Instant::now();
        for _ in 0..6 {
            breaker.record_failure_at(FailureKind::Timeout, 100.0, start);
        }
        // 6 consecutive failures → 30s × 2^1
        let timeout = breaker.recovery_timeout(6);
        assert_eq!(timeout, Duration::from_secs(60));

        assert!(!breaker.can_execute_at(start + timeout - Duration::from_millis(1)));

        let later = start + timeout;
        assert!(breaker.can_execute_at(later));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_execute_at(later));
        assert!(breaker.can_execute_at(later));
        assert!(!breaker.can_execute_at(later), "quota is three probes");

        for _ in 0..3 {
            breaker.record_success_at(40.0, later);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute_at(later));
    }

    #[test]
    fn test_half_open_failure_reopens_despite_successes() {
        let breaker = CircuitBreaker::new("gen", test_config());
        let start = Instant::now();
        for _ in 0..6 {
            breaker.record_failure_at(FailureKind::Timeout, 100.0, start);
        }
        let later = start + Duration::from_secs(60);
        assert!(breaker.can_execute_at(later));
        breaker.record_success_at(30.0, later);
        breaker.record_success_at(30.0, later);
        breaker.record_failure_at(FailureKind::Http5xx, 30.0, later);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute_at(later));
    }

    #[test]
    fn test_adaptive_threshold_function() {
        assert_eq!(adaptive_threshold(10.0, 3.0, 0.0), 20.0);
        assert_eq!(adaptive_threshold(10.0, 3.0, 0.07), 10.0);
        assert_eq!(adaptive_threshold(10.0, 3.0, 0.2), 5.0);
        assert_eq!(adaptive_threshold(10.0, 3.0, 0.9), 3.0);
    }

    #[test]
    fn test_threshold_grows_on_clean_traffic() {
        let breaker = CircuitBreaker::new("gen", test_config());
        let now = Instant::now();
        for _ in 0..10 {
            breaker.record_success_at(10.0, now);
        }
        assert_eq!(breaker.stats().adaptive_threshold, 20.0);
    }

    #[test]
    fn test_observers_receive_transitions_and_unsubscribe() {
        let observers = Arc::new(BreakerObservers::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = observers.subscribe(Arc::new(move |event: &StateChange| {
            sink.lock().unwrap().push((event.from, event.to));
        }));

        let breaker = CircuitBreaker::with_observers("gen", test_config(), observers.clone());
        let now = Instant::now();
        for _ in 0..6 {
            breaker.record_failure_at(FailureKind::Connection, 10.0, now);
        }
        breaker.reset();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed)
            ]
        );

        assert!(observers.unsubscribe(handle));
        assert!(!observers.unsubscribe(handle));
        assert!(observers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_outcomes_are_serialized() {
        let observers = Arc::new(BreakerObservers::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        observers.subscribe(Arc::new(move |event: &StateChange| {
            sink.lock().unwrap().push((event.from, event.to));
        }));
        let breaker = Arc::new(CircuitBreaker::with_observers(
            "gen",
            test_config(),
            observers,
        ));
        let start = Instant::now();

        let failures: Vec<_> = (0..32)
            .map(|_| {
                let breaker = breaker.clone();
                tokio::spawn(async move {
                    breaker.record_failure_at(FailureKind::Timeout, 10.0, start);
                })
            })
            .collect();
        for task in futures_util::future::join_all(failures).await {
            task.unwrap();
        }

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.consecutive_failures, 32);
        assert_eq!(stats.total_requests, 32);
        assert_eq!(stats.total_failures, 32);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(CircuitState::Closed, CircuitState::Open)]
        );

        let later = start + breaker.recovery_timeout(32);
        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let breaker = breaker.clone();
                tokio::spawn(async move { breaker.can_execute_at(later) })
            })
            .collect();
        let mut admitted = 0;
        for task in futures_util::future::join_all(attempts).await {
            if task.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, test_config().half_open_max_calls);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen)
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_records_outcomes() {
        let breaker = CircuitBreaker::new("gen", test_config());

        let ok: Result<u32, BreakerError<TransportError>> =
            breaker.execute(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32, BreakerError<TransportError>> = breaker
            .execute(|| async { Err(TransportError::Connection("refused".to_string())) })
            .await;
        assert!(matches!(err, Err(BreakerError::Call(TransportError::Connection(_)))));

        let stats = breaker.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.weighted_failure_score, 2.0);
    }

    #[tokio::test]
    async fn test_execute_fails_fast_when_open() {
        let breaker = CircuitBreaker::new("gen", test_config());
        for _ in 0..6 {
            breaker.record_failure(FailureKind::Timeout, 100.0);
        }

        let mut called = false;
        let result: Result<(), BreakerError<TransportError>> = breaker
            .execute(|| {
                called = true;
                async { Ok(()) }
            })
            .await;

        assert!(!called);
        match result {
            Err(BreakerError::Open { service, retry_after }) => {
                assert_eq!(service, "gen");
                assert!(retry_after > Duration::from_secs(50));
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_registry_creates_one_breaker_per_service() {
        let config = Arc::new(GatewayConfig::default());
        let breakers = CircuitBreakers::new(config, Arc::new(crate::ports::NoopMetrics));

        let first = breakers.get("gen").await;
        let again = breakers.get("gen").await;
        let other = breakers.get("render").await;

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(breakers.snapshot_all().await.len(), 2);
    }
}
