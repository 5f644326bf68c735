//! Script-visible timers (`setTimeout` / `setInterval`).
//!
//! Timers sleep on the I/O runtime and, when due, post their tag to a
//! [`TimerSink`] (the runtime gateway). The callback itself lives inside the
//! script engine; the runtime thread calls [`TimerService::claim`] before
//! invoking it, so a timer cancelled after its task woke up never fires and a
//! one-shot timer fires exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Identifier of a live timer. Never reused within one service.
pub type TimerTag = u64;

/// Whether a timer fires once or until cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Once,
    Repeating,
}

/// Receiver of due timers.
pub trait TimerSink: Send + Sync + 'static {
    fn timer_due(&self, tag: TimerTag);
}

struct LiveTimer {
    kind: TimerKind,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct TimerTable {
    next_tag: TimerTag,
    live: HashMap<TimerTag, LiveTimer>,
}

/// Schedules and cancels timers.
#[derive(Clone)]
pub struct TimerService {
    handle: Handle,
    table: Arc<Mutex<TimerTable>>,
    sink: Arc<dyn TimerSink>,
}

/// Longest delay a script can ask for, as in browsers (2^31 - 1 ms).
pub const MAX_DELAY_MS: f64 = i32::MAX as f64;

/// Convert a script delay in milliseconds. Negative and NaN delays mean "now";
/// anything longer than [`MAX_DELAY_MS`], infinity included, is clamped to it.
pub(crate) fn delay_from_ms(delay_ms: f64) -> Duration {
    if delay_ms.is_nan() || delay_ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis(delay_ms.min(MAX_DELAY_MS) as u64)
}

impl TimerService {
    pub fn new(handle: Handle, sink: Arc<dyn TimerSink>) -> Self {
        Self {
            handle,
            table: Arc::new(Mutex::new(TimerTable {
                next_tag: 1,
                live: HashMap::new(),
            })),
            sink,
        }
    }

    /// Schedule a timer and return its tag.
    pub fn schedule(&self, delay_ms: f64, kind: TimerKind) -> TimerTag {
        let delay = delay_from_ms(delay_ms);

        // Hold the lock across spawn so the task cannot fire before it is
        // registered.
        let mut table = self.table.lock();
        let tag = table.next_tag;
        table.next_tag += 1;

        let sink = Arc::clone(&self.sink);
        let task = match kind {
            TimerKind::Once => self.handle.spawn(async move {
                tokio::time::sleep(delay).await;
                sink.timer_due(tag);
            }),
            TimerKind::Repeating => {
                let period = delay.max(Duration::from_millis(1));
                self.handle.spawn(async move {
                    let start = tokio::time::Instant::now() + period;
                    let mut ticker = tokio::time::interval_at(start, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        sink.timer_due(tag);
                    }
                })
            }
        };

        table.live.insert(tag, LiveTimer { kind, task });
        trace!(target: "timer", "scheduled {:?} timer {} after {:?}", kind, tag, delay);
        tag
    }

    /// Cancel a timer. Unknown, fired or already cancelled tags are a no-op.
    pub fn cancel(&self, tag: TimerTag) -> bool {
        match self.table.lock().live.remove(&tag) {
            Some(timer) => {
                timer.task.abort();
                trace!(target: "timer", "cancelled timer {}", tag);
                true
            }
            None => false,
        }
    }

    /// Called on the runtime thread before running a due timer's callback.
    ///
    /// Returns `None` when the timer was cancelled in the meantime. A one-shot
    /// timer is removed by its claim.
    pub fn claim(&self, tag: TimerTag) -> Option<TimerKind> {
        let mut table = self.table.lock();
        let kind = table.live.get(&tag)?.kind;
        if kind == TimerKind::Once {
            table.live.remove(&tag);
        }
        Some(kind)
    }

    /// Number of timers that can still fire.
    pub fn active_count(&self) -> usize {
        self.table.lock().live.len()
    }

    /// Cancel everything (bridge shutdown).
    pub fn cancel_all(&self) {
        let drained: Vec<LiveTimer> = self.table.lock().live.drain().map(|(_, t)| t).collect();
        for timer in drained {
            timer.task.abort();
        }
    }
}
