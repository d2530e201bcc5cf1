use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use common::Statistics;

/// Message id source of one Pitcher run. Ids start at 1.
#[derive(Debug, Default)]
pub struct MessageCounter(AtomicI64);

impl MessageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last id handed out, 0 before the first probe.
    pub fn current(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timestamps of one answered probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTripRecord {
    pub message_id: i64,
    pub host_a: i64,
    pub host_b: i64,
    pub rtt_timestamp: i64,
}

impl RoundTripRecord {
    pub fn rtt(&self) -> i64 {
        self.rtt_timestamp - self.host_a
    }
    pub fn a_to_b(&self) -> i64 {
        self.host_b - self.host_a
    }
    pub fn b_to_a(&self) -> i64 {
        self.rtt_timestamp - self.host_b
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAverages {
    pub rtt: i64,
    pub a_to_b: i64,
    pub b_to_a: i64,
}

/// Result of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Probes sent since the run started.
    pub sent: i64,
    pub window_count: usize,
    pub max_rtt: Option<i64>,
    /// `None` for an empty window.
    pub averages: Option<WindowAverages>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total sent: {}, received in previous second: {}",
            self.sent, self.window_count
        )?;
        if let (Some(max), Some(avg)) = (self.max_rtt, self.averages) {
            write!(
                f,
                ", Max RTT: {} ms, Avg RTT: {} ms, Avg A->B: {} ms, Avg B->A: {} ms",
                max, avg.rtt, avg.a_to_b, avg.b_to_a
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RunState {
    max_rtt: Option<i64>,
    answered: usize,
    rtt: Statistics,
}

/// Collects round-trip records per one second window.
///
/// `record` is called by the emitting task, `flush` by whoever owns the report
/// schedule. Only one flusher is supported.
#[derive(Debug)]
pub struct Aggregator {
    window: Mutex<Vec<RoundTripRecord>>,
    run: Mutex<RunState>,
    sent: Arc<MessageCounter>,
}

impl Aggregator {
    pub fn new(sent: Arc<MessageCounter>) -> Self {
        Self {
            window: Mutex::new(Vec::new()),
            run: Mutex::new(RunState::default()),
            sent,
        }
    }

    pub fn record(&self, record: RoundTripRecord) {
        lock(&self.window).push(record);
    }

    pub fn flush(&self) -> Report {
        let window = std::mem::take(&mut *lock(&self.window));
        let sent = self.sent.current();
        let mut run = lock(&self.run);

        if window.is_empty() {
            return Report {
                sent,
                window_count: 0,
                max_rtt: run.max_rtt,
                averages: None,
            };
        }

        let (mut sum_rtt, mut sum_ab, mut sum_ba) = (0i64, 0i64, 0i64);
        for record in &window {
            let rtt = record.rtt();
            run.max_rtt = Some(run.max_rtt.map_or(rtt, |max| max.max(rtt)));
            run.rtt.update(rtt as f64);
            sum_rtt += rtt;
            sum_ab += record.a_to_b();
            sum_ba += record.b_to_a();
        }
        run.answered += window.len();

        let count = window.len() as i64;
        Report {
            sent,
            window_count: window.len(),
            max_rtt: run.max_rtt,
            averages: Some(WindowAverages {
                rtt: sum_rtt / count,
                a_to_b: sum_ab / count,
                b_to_a: sum_ba / count,
            }),
        }
    }

    /// Whole-run view over everything flushed so far.
    pub fn summary(&self) -> RunSummary {
        let run = lock(&self.run);
        RunSummary {
            sent: self.sent.current(),
            answered: run.answered,
            max_rtt: run.max_rtt,
            rtt: run.rtt.clone(),
        }
    }
}

/// What a Pitcher run achieved, logged when it ends.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub sent: i64,
    pub answered: usize,
    pub max_rtt: Option<i64>,
    pub rtt: Statistics,
}

impl RunSummary {
    pub fn lost(&self) -> i64 {
        (self.sent - self.answered as i64).max(0)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {} probes, {} answered, {} lost",
            self.sent,
            self.answered,
            self.lost()
        )?;
        if self.rtt.samples() > 0 {
            write!(f, "; RTT ms {}", self.rtt)?;
        }
        Ok(())
    }
}

// A panic while holding the lock leaves plain data behind, keep using it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
