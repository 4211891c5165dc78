//! Dependency registration and guarded execution

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{Admission, Circuit, CircuitBreakerConfig, CircuitSnapshot};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{ColloquyError, Result};

/// An outbound dependency that can be protected by a circuit.
#[async_trait]
pub trait Dependency<Req, Resp>: Send + Sync {
    /// Perform the call
    async fn call(&self, request: &Req) -> Result<Resp>;
}

/// Pure substitute invoked with the same request the dependency would have received
pub type Fallback<Req, Resp> = Arc<dyn Fn(&Req) -> Resp + Send + Sync>;

/// Registration options for a dependency
pub struct DependencyOptions<Req, Resp> {
    /// Breaker thresholds and timeouts
    pub config: CircuitBreakerConfig,
    /// Fallback used while the circuit is open or when a call fails
    pub fallback: Option<Fallback<Req, Resp>>,
}

impl<Req, Resp> DependencyOptions<Req, Resp> {
    /// Options without a fallback
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            fallback: None,
        }
    }

    /// Builder: set the fallback
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&Req) -> Resp + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }
}

/// Where an execution's value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionSource {
    /// The dependency answered
    Dependency,
    /// The circuit was open and the fallback answered
    ShortCircuit,
    /// The dependency failed and the fallback answered
    FailedOver,
}

/// Value produced by a guarded call together with its provenance
#[derive(Debug, Clone)]
pub struct Execution<T> {
    /// The response
    pub value: T,
    /// Provenance
    pub source: ExecutionSource,
}

impl<T> Execution<T> {
    /// Whether the fallback produced this value
    pub fn is_degraded(&self) -> bool {
        self.source != ExecutionSource::Dependency
    }
}

/// A dependency paired with its circuit and fallback
pub struct GuardedDependency<Req, Resp> {
    circuit: Arc<Circuit>,
    dependency: Arc<dyn Dependency<Req, Resp>>,
    fallback: Option<Fallback<Req, Resp>>,
}

impl<Req, Resp> Clone for GuardedDependency<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            circuit: Arc::clone(&self.circuit),
            dependency: Arc::clone(&self.dependency),
            fallback: self.fallback.clone(),
        }
    }
}

impl<Req, Resp> GuardedDependency<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    /// Dependency name
    pub fn name(&self) -> &str {
        self.circuit.name()
    }

    /// The circuit guarding this dependency
    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    /// Execute the call through the circuit, returning only the value
    pub async fn execute(&self, request: &Req) -> Result<Resp> {
        self.execute_detailed(request).await.map(|e| e.value)
    }

    /// Execute the call through the circuit.
    ///
    /// Timeouts, transport errors and non-success responses count as failures.
    /// Failures and short-circuits are answered by the fallback when one is
    /// registered; otherwise the error is returned.
    pub async fn execute_detailed(&self, request: &Req) -> Result<Execution<Resp>> {
        let admission = self.circuit.admit();

        if admission == Admission::Reject {
            tracing::debug!(dependency = %self.name(), "Circuit open, short-circuiting");
            return self.fall_back(
                request,
                ColloquyError::DependencyUnavailable(self.name().to_string()),
                ExecutionSource::ShortCircuit,
            );
        }

        let guard = AdmissionGuard::new(&self.circuit, admission);
        let timeout = self.circuit.config().call_timeout;

        let outcome = match tokio::time::timeout(timeout, self.dependency.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(ColloquyError::DependencyTimeout {
                name: self.name().to_string(),
                timeout,
            }),
        };

        match outcome {
            Ok(value) => {
                guard.succeeded();
                Ok(Execution {
                    value,
                    source: ExecutionSource::Dependency,
                })
            }
            Err(e) => {
                guard.failed();
                tracing::warn!(dependency = %self.name(), error = %e, "Dependency call failed");
                self.fall_back(request, e, ExecutionSource::FailedOver)
            }
        }
    }

    fn fall_back(
        &self,
        request: &Req,
        error: ColloquyError,
        source: ExecutionSource,
    ) -> Result<Execution<Resp>> {
        match &self.fallback {
            Some(fallback) => Ok(Execution {
                value: fallback(request),
                source,
            }),
            None => Err(error),
        }
    }
}

/// Settles an admission exactly once; a dropped, unsettled probe is released.
struct AdmissionGuard<'a> {
    circuit: &'a Circuit,
    admission: Admission,
    settled: bool,
}

impl<'a> AdmissionGuard<'a> {
    fn new(circuit: &'a Circuit, admission: Admission) -> Self {
        Self {
            circuit,
            admission,
            settled: false,
        }
    }

    fn succeeded(mut self) {
        self.circuit.record_success(self.admission);
        self.settled = true;
    }

    fn failed(mut self) {
        self.circuit.record_failure(self.admission);
        self.settled = true;
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.circuit.release_probe();
        }
    }
}

/// Registry of per-dependency circuits
pub struct CircuitBreaker {
    clock: SharedClock,
    circuits: RwLock<BTreeMap<String, Arc<Circuit>>>,
}

impl CircuitBreaker {
    /// Create a registry using the given clock for cooldowns
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            circuits: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a dependency and get back its guarded handle.
    ///
    /// Registering a name twice replaces the earlier circuit.
    pub fn register_dependency<Req, Resp>(
        &self,
        name: impl Into<String>,
        dependency: Arc<dyn Dependency<Req, Resp>>,
        options: DependencyOptions<Req, Resp>,
    ) -> GuardedDependency<Req, Resp>
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let name = name.into();
        let circuit = Arc::new(Circuit::new(
            name.clone(),
            options.config,
            Arc::clone(&self.clock),
        ));

        let previous = self
            .circuits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::clone(&circuit));
        if previous.is_some() {
            tracing::warn!(dependency = %name, "Replacing existing circuit registration");
        }

        tracing::info!(
            dependency = %name,
            failure_threshold = circuit.config().failure_threshold,
            has_fallback = options.fallback.is_some(),
            "Registered dependency"
        );

        GuardedDependency {
            circuit,
            dependency,
            fallback: options.fallback,
        }
    }

    /// Look up a circuit by name
    pub fn circuit(&self, name: &str) -> Option<Arc<Circuit>> {
        self.circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshot of one circuit
    pub fn snapshot(&self, name: &str) -> Option<CircuitSnapshot> {
        self.circuit(name).map(|c| c.snapshot())
    }

    /// Snapshots of all circuits, ordered by name
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|c| c.snapshot())
            .collect()
    }

    /// Reset a circuit to CLOSED; false when the name is unknown
    pub fn reset(&self, name: &str) -> bool {
        match self.circuit(name) {
            Some(circuit) => {
                circuit.reset();
                true
            }
            None => false,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("circuits", &self.snapshots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Dependency that echoes the request or fails on demand
    struct Scripted {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl Scripted {
        fn new(failing: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(failing),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dependency<String, String> for Scripted {
        async fn call(&self, request: &String) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(ColloquyError::dependency("retrieval", "HTTP 503"))
            } else {
                Ok(format!("live:{}", request))
            }
        }
    }

    /// Dependency that blocks until released
    struct Gate {
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dependency<String, String> for Gate {
        async fn call(&self, request: &String) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(format!("live:{}", request))
        }
    }

    struct Slow;

    #[async_trait]
    impl Dependency<String, String> for Slow {
        async fn call(&self, _request: &String) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("too late".to_string())
        }
    }

    fn options(threshold: u32) -> DependencyOptions<String, String> {
        DependencyOptions::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_reset_timeout(Duration::from_secs(30))
                .with_call_timeout(Duration::from_secs(1)),
        )
        .with_fallback(|req: &String| format!("fallback:{}", req))
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let breaker = CircuitBreaker::new(Arc::new(ManualClock::starting_now()));
        let dep = Scripted::new(false);
        let guarded = breaker.register_dependency("retrieval", dep.clone(), options(3));

        let execution = guarded.execute_detailed(&"q".to_string()).await.unwrap();
        assert_eq!(execution.value, "live:q");
        assert!(!execution.is_degraded());
        assert_eq!(dep.calls(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_dependency() {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker = CircuitBreaker::new(clock.clone());
        let dep = Scripted::new(true);
        let guarded = breaker.register_dependency("retrieval", dep.clone(), options(3));
        let request = "how do I update".to_string();

        for _ in 0..3 {
            let execution = guarded.execute_detailed(&request).await.unwrap();
            assert_eq!(execution.source, ExecutionSource::FailedOver);
        }
        assert_eq!(dep.calls(), 3);
        assert_eq!(guarded.circuit().state(), CircuitState::Open);

        // Fourth call inside the cooldown never reaches the dependency
        clock.advance(Duration::from_secs(10));
        let execution = guarded.execute_detailed(&request).await.unwrap();
        assert_eq!(execution.value, "fallback:how do I update");
        assert_eq!(execution.source, ExecutionSource::ShortCircuit);
        assert_eq!(dep.calls(), 3);
    }

    #[tokio::test]
    async fn test_probe_success_closes_circuit() {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker = CircuitBreaker::new(clock.clone());
        let dep = Scripted::new(true);
        let guarded = breaker.register_dependency("intent", dep.clone(), options(2));
        let request = "q".to_string();

        guarded.execute(&request).await.unwrap();
        guarded.execute(&request).await.unwrap();
        assert_eq!(guarded.circuit().state(), CircuitState::Open);

        dep.failing.store(false, Ordering::SeqCst);
        clock.advance(Duration::from_secs(30));

        let value = guarded.execute(&request).await.unwrap();
        assert_eq!(value, "live:q");

        let snapshot = breaker.snapshot("intent").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_open_without_fallback_is_unavailable() {
        let breaker = CircuitBreaker::new(Arc::new(ManualClock::starting_now()));
        let dep = Scripted::new(true);
        let guarded = breaker.register_dependency(
            "intent",
            dep.clone(),
            DependencyOptions::new(CircuitBreakerConfig::default().with_failure_threshold(1)),
        );
        let request = "q".to_string();

        let first = guarded.execute(&request).await;
        assert!(matches!(first, Err(ColloquyError::DependencyError { .. })));

        let second = guarded.execute(&request).await;
        assert!(matches!(second, Err(ColloquyError::DependencyUnavailable(name)) if name == "intent"));
        assert_eq!(dep.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(Arc::new(ManualClock::starting_now()));
        let guarded = breaker.register_dependency("retrieval", Arc::new(Slow), options(1));

        let execution = guarded.execute_detailed(&"q".to_string()).await.unwrap();
        assert_eq!(execution.source, ExecutionSource::FailedOver);
        assert_eq!(execution.value, "fallback:q");
        assert_eq!(guarded.circuit().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_single_probe_in_half_open() {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker = CircuitBreaker::new(clock.clone());
        let gate = Arc::new(Gate {
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let guarded = breaker.register_dependency("retrieval", gate.clone(), options(1));

        guarded.circuit().record_failure(Admission::Pass);
        clock.advance(Duration::from_secs(30));

        let probe = {
            let guarded = guarded.clone();
            tokio::spawn(async move { guarded.execute_detailed(&"probe".to_string()).await })
        };

        while gate.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // A concurrent call while the probe is in flight is routed to the fallback
        let concurrent = guarded.execute_detailed(&"other".to_string()).await.unwrap();
        assert_eq!(concurrent.source, ExecutionSource::ShortCircuit);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);

        gate.release.notify_one();
        let probe = probe.await.unwrap().unwrap();
        assert_eq!(probe.value, "live:probe");
        assert_eq!(guarded.circuit().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_probe_releases_slot() {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker = CircuitBreaker::new(clock.clone());
        let gate = Arc::new(Gate {
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let guarded = breaker.register_dependency("retrieval", gate.clone(), options(1));

        guarded.circuit().record_failure(Admission::Pass);
        clock.advance(Duration::from_secs(30));

        let probe = {
            let guarded = guarded.clone();
            tokio::spawn(async move { guarded.execute_detailed(&"probe".to_string()).await })
        };
        while gate.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        probe.abort();
        let _ = probe.await;

        assert_eq!(guarded.circuit().state(), CircuitState::HalfOpen);
        assert_eq!(guarded.circuit().admit(), Admission::Probe);
    }

    #[test]
    fn test_registry_snapshots_and_reset() {
        let breaker = CircuitBreaker::new(Arc::new(ManualClock::starting_now()));
        let intent = breaker.register_dependency("intent", Scripted::new(false), options(1));
        breaker.register_dependency("retrieval", Scripted::new(false), options(1));

        intent.circuit().record_failure(Admission::Pass);

        let names: Vec<_> = breaker.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["intent", "retrieval"]);
        assert_eq!(breaker.snapshot("intent").unwrap().state, CircuitState::Open);

        assert!(breaker.reset("intent"));
        assert_eq!(breaker.snapshot("intent").unwrap().state, CircuitState::Closed);
        assert!(!breaker.reset("unknown"));
    }
}
