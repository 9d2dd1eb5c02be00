use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Process-wide pipeline counters, shared by every worker and served by the
/// `/health` endpoint. Fire-and-forget ingress means data loss is visible
/// here and in the log, never to the IDE.
#[derive(Default)]
pub struct Metrics {
    pub events_in: AtomicU64,
    pub events_out: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_to_dlq: AtomicU64,
    pub poll_errors: AtomicU64,
    pub consumer_lag: AtomicI64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_in: self.events_in.load(Ordering::Relaxed),
            events_out: self.events_out.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_to_dlq: self.events_to_dlq.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            consumer_lag: self.consumer_lag.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub events_in: u64,
    pub events_out: u64,
    pub events_dropped: u64,
    pub events_to_dlq: u64,
    pub poll_errors: u64,
    pub consumer_lag: i64,
}

const FAILURES_BEFORE_COOLDOWN: u32 = 3;
const COOLDOWN: Duration = Duration::from_secs(30);

/// Per-component failure tracker: three consecutive failed cycles put the
/// component into a 30 s cool-down.
pub struct HealthGate {
    state: Mutex<GateState>,
}

struct GateState {
    consecutive_failures: u32,
    cooling_until: Option<Instant>,
}

impl HealthGate {
    pub fn new() -> Self {
        HealthGate {
            state: Mutex::new(GateState {
                consecutive_failures: 0,
                cooling_until: None,
            }),
        }
    }

    pub fn record_success(&self) {
        let mut s = self.state.lock().unwrap();
        s.consecutive_failures = 0;
        s.cooling_until = None;
    }

    pub fn record_failure(&self) {
        let mut s = self.state.lock().unwrap();
        s.consecutive_failures += 1;
        if s.consecutive_failures >= FAILURES_BEFORE_COOLDOWN {
            s.cooling_until = Some(Instant::now() + COOLDOWN);
        }
    }

    /// Whether the component should sit this cycle out.
    pub fn is_cooling(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        match s.cooling_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // cool-down elapsed; give the component a fresh budget
                s.cooling_until = None;
                s.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }
}

impl Default for HealthGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::default();
        Metrics::incr(&m.events_in);
        Metrics::add(&m.events_in, 4);
        Metrics::incr(&m.events_to_dlq);
        let snap = m.snapshot();
        assert_eq!(snap.events_in, 5);
        assert_eq!(snap.events_to_dlq, 1);
        assert_eq!(snap.events_out, 0);
    }

    #[test]
    fn gate_opens_after_three_failures() {
        let gate = HealthGate::new();
        assert!(!gate.is_cooling());
        gate.record_failure();
        gate.record_failure();
        assert!(!gate.is_cooling());
        gate.record_failure();
        assert!(gate.is_cooling());
    }

    #[test]
    fn success_resets_failure_streak() {
        let gate = HealthGate::new();
        gate.record_failure();
        gate.record_failure();
        gate.record_success();
        gate.record_failure();
        gate.record_failure();
        assert!(!gate.is_cooling());
    }
}
