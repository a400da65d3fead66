//! Per-origin circuit breaker.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: origin assumed down, requests fail fast
//! - Half-Open: trial requests pass through while recovery is tested
//!
//! # State Transitions
//! ```text
//! Closed → Open: failures within window >= failure_threshold
//! Open → Half-Open: first can_attempt after open_timeout elapsed
//! Half-Open → Closed: success_threshold successes
//! Half-Open → Open: any failure
//! ```
//!
//! # Design Decisions
//! - One circuit per origin (scheme://host:port), created lazily
//! - Failures are timestamps in a sliding window, pruned on every touch
//! - Registry is a DashMap so unrelated origins never contend on one lock
//! - Idle circuits expire; beyond capacity the least recently touched go first

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Thresholds shared by every circuit in a registry.
#[derive(Debug, Clone)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub window: Duration,
}

impl From<&CircuitBreakerConfig> for CircuitSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            open_timeout: Duration::from_millis(config.open_timeout_ms),
            window: Duration::from_millis(config.window_ms),
        }
    }
}

/// Breaker state for a single origin.
#[derive(Debug, Clone)]
pub struct Circuit {
    state: CircuitState,
    failures: VecDeque<Instant>,
    successes: u32,
    next_attempt_at: Option<Instant>,
    last_touched: Instant,
}

impl Circuit {
    pub fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            successes: 0,
            next_attempt_at: None,
            last_touched: now,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Open and still inside its cool-down.
    fn is_cooling(&self, now: Instant) -> bool {
        self.state == CircuitState::Open && self.next_attempt_at.is_some_and(|at| now < at)
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether a request may go upstream. May move Open → Half-Open.
    pub fn can_attempt(&mut self, settings: &CircuitSettings, now: Instant) -> bool {
        self.last_touched = now;
        self.prune(settings.window, now);
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.next_attempt_at {
                Some(at) if now < at => false,
                _ => {
                    self.state = CircuitState::HalfOpen;
                    self.successes = 0;
                    true
                }
            },
        }
    }

    pub fn record_success(&mut self, settings: &CircuitSettings, now: Instant) {
        self.last_touched = now;
        match self.state {
            CircuitState::HalfOpen => {
                self.successes += 1;
                if self.successes >= settings.success_threshold {
                    self.state = CircuitState::Closed;
                    self.successes = 0;
                    self.failures.clear();
                    self.next_attempt_at = None;
                }
            }
            CircuitState::Closed => self.prune(settings.window, now),
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, settings: &CircuitSettings, now: Instant) {
        self.last_touched = now;
        self.failures.push_back(now);
        self.prune(settings.window, now);
        match self.state {
            CircuitState::Closed => {
                if self.failures.len() >= settings.failure_threshold as usize {
                    self.open(settings, now);
                }
            }
            CircuitState::HalfOpen => self.open(settings, now),
            CircuitState::Open => {}
        }
    }

    fn open(&mut self, settings: &CircuitSettings, now: Instant) {
        self.state = CircuitState::Open;
        self.successes = 0;
        self.next_attempt_at = Some(now + settings.open_timeout);
    }
}

/// Diagnostic view of one circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub origin: String,
    pub state: CircuitState,
    pub failures: usize,
}

/// All circuits, keyed by origin.
pub struct CircuitRegistry {
    circuits: DashMap<String, Circuit>,
    settings: CircuitSettings,
    enabled: bool,
    max_circuits: usize,
    idle_ttl: Duration,
    trip_on_status: Vec<u16>,
}

impl CircuitRegistry {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            circuits: DashMap::new(),
            settings: CircuitSettings::from(config),
            enabled: config.enabled,
            max_circuits: config.max_circuits.max(1),
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
            trip_on_status: config.trip_on_status.clone(),
        }
    }

    /// Whether an upstream status counts as a failure for its origin.
    pub fn trips_on(&self, status: u16) -> bool {
        self.trip_on_status.contains(&status)
    }

    pub fn can_attempt(&self, origin: &str) -> bool {
        self.can_attempt_at(origin, Instant::now())
    }

    pub fn record_success(&self, origin: &str) {
        self.record_success_at(origin, Instant::now());
    }

    pub fn record_failure(&self, origin: &str) {
        self.record_failure_at(origin, Instant::now());
    }

    pub(crate) fn can_attempt_at(&self, origin: &str, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }
        self.with_circuit(origin, now, |circuit, settings| circuit.can_attempt(settings, now))
    }

    pub(crate) fn record_success_at(&self, origin: &str, now: Instant) {
        if self.enabled {
            self.with_circuit(origin, now, |circuit, settings| circuit.record_success(settings, now));
        }
    }

    pub(crate) fn record_failure_at(&self, origin: &str, now: Instant) {
        if self.enabled {
            self.with_circuit(origin, now, |circuit, settings| circuit.record_failure(settings, now));
        }
    }

    /// Run `f` against the origin's circuit, creating it if needed.
    /// The shard lock is released before pruning.
    fn with_circuit<T>(
        &self,
        origin: &str,
        now: Instant,
        f: impl FnOnce(&mut Circuit, &CircuitSettings) -> T,
    ) -> T {
        let (result, created) = {
            let (mut circuit, created) = match self.circuits.entry(origin.to_string()) {
                Entry::Occupied(entry) => (entry.into_ref(), false),
                Entry::Vacant(entry) => (entry.insert(Circuit::new(now)), true),
            };
            let before = circuit.state();
            let result = f(&mut circuit, &self.settings);
            let after = circuit.state();
            if before != after {
                log_transition(origin, before, after, circuit.failure_count());
            }
            (result, created)
        };

        if created {
            self.prune(now);
        }
        result
    }

    /// Current state; untracked origins are Closed.
    pub fn state(&self, origin: &str) -> CircuitState {
        self.circuits
            .get(origin)
            .map(|c| c.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|entry| CircuitSnapshot {
                origin: entry.key().clone(),
                state: entry.state(),
                failures: entry.failure_count(),
            })
            .collect();
        all.sort_by(|a, b| a.origin.cmp(&b.origin));
        all
    }

    /// Forget one origin. Returns whether it was tracked.
    pub fn reset(&self, origin: &str) -> bool {
        let removed = self.circuits.remove(origin).is_some();
        if removed {
            tracing::info!(origin = %origin, "Circuit reset");
        }
        removed
    }

    pub fn reset_all(&self) -> usize {
        let count = self.circuits.len();
        self.circuits.clear();
        tracing::info!(count, "All circuits reset");
        count
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    /// Drop idle circuits, then the least recently touched beyond capacity.
    /// Open circuits still cooling down are never dropped, so eviction
    /// cannot close a breaker early.
    fn prune(&self, now: Instant) {
        let ttl = self.idle_ttl;
        self.circuits.retain(|_, circuit| {
            circuit.is_cooling(now) || now.saturating_duration_since(circuit.last_touched) < ttl
        });

        let excess = self.circuits.len().saturating_sub(self.max_circuits);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(String, Instant)> = self
            .circuits
            .iter()
            .filter(|entry| !entry.is_cooling(now))
            .map(|entry| (entry.key().clone(), entry.last_touched))
            .collect();
        by_age.sort_by_key(|(_, touched)| *touched);
        for (origin, _) in by_age.into_iter().take(excess) {
            self.circuits.remove(&origin);
        }
    }
}

fn log_transition(origin: &str, from: CircuitState, to: CircuitState, failures: usize) {
    match to {
        CircuitState::Open => tracing::warn!(
            origin = %origin,
            from = from.as_str(),
            failures,
            "Circuit opened"
        ),
        CircuitState::HalfOpen => tracing::info!(origin = %origin, "Circuit half-open, allowing trial requests"),
        CircuitState::Closed => tracing::info!(origin = %origin, "Circuit closed after recovery"),
    }
    metrics::record_circuit_transition(to.as_str());
}
