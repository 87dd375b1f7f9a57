//! Run phase state machine
//!
//! A run moves through warm-up → trading → wind-down → ended. Transitions
//! are pure functions of the clock, computed lazily and latched once true,
//! so every consumer observes the same monotonic one-way progression.
//! Termination is data inspected by the polling loops, never a signal.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;

#[derive(Debug)]
pub struct RunPhase {
    warmup_end_ms: i64,
    trading_stop_ms: i64,
    run_end_ms: i64,
    past_warmup: AtomicBool,
    trading_stopped: AtomicBool,
    run_ended: AtomicBool,
}

impl RunPhase {
    pub fn new(start_ms: i64, warmup_secs: i64, trading_secs: i64, winddown_secs: i64) -> Self {
        let warmup_end_ms = start_ms + warmup_secs * 1_000;
        let trading_stop_ms = warmup_end_ms + trading_secs * 1_000;
        let run_end_ms = trading_stop_ms + winddown_secs * 1_000;
        Self {
            warmup_end_ms,
            trading_stop_ms,
            run_end_ms,
            past_warmup: AtomicBool::new(false),
            trading_stopped: AtomicBool::new(false),
            run_ended: AtomicBool::new(false),
        }
    }

    pub fn past_warmup(&self) -> bool {
        self.past_warmup_at(Utc::now().timestamp_millis())
    }

    pub fn trading_stopped(&self) -> bool {
        self.trading_stopped_at(Utc::now().timestamp_millis())
    }

    pub fn run_ended(&self) -> bool {
        self.run_ended_at(Utc::now().timestamp_millis())
    }

    /// True while entries may be opened: past warm-up, trading not stopped.
    pub fn trading_active(&self) -> bool {
        self.past_warmup() && !self.trading_stopped()
    }

    pub fn phase_name(&self) -> &'static str {
        if self.run_ended() {
            "ended"
        } else if self.trading_stopped() {
            "wind-down"
        } else if self.past_warmup() {
            "trading"
        } else {
            "warm-up"
        }
    }

    pub(crate) fn past_warmup_at(&self, now_ms: i64) -> bool {
        Self::latch(&self.past_warmup, now_ms >= self.warmup_end_ms)
    }

    pub(crate) fn trading_stopped_at(&self, now_ms: i64) -> bool {
        Self::latch(&self.trading_stopped, now_ms >= self.trading_stop_ms)
    }

    pub(crate) fn run_ended_at(&self, now_ms: i64) -> bool {
        Self::latch(&self.run_ended, now_ms >= self.run_end_ms)
    }

    fn latch(flag: &AtomicBool, reached: bool) -> bool {
        if flag.load(Ordering::Relaxed) {
            return true;
        }
        if reached {
            flag.store(true, Ordering::Relaxed);
        }
        reached
    }
}
