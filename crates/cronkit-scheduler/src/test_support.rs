//! Shared helpers for the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::trigger::Trigger;

/// Interval trigger that counts how often it is consulted and reset.
pub(crate) struct RecordingTrigger {
    period: Duration,
    anchor: Option<DateTime<Utc>>,
    calls: Arc<TriggerCalls>,
}

#[derive(Default)]
pub(crate) struct TriggerCalls {
    next_calls: AtomicUsize,
    resets: AtomicUsize,
    events: Mutex<Vec<&'static str>>,
}

impl TriggerCalls {
    pub(crate) fn next_calls(&self) -> usize {
        self.next_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// `"next"` / `"reset"` in call order.
    pub(crate) fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingTrigger {
    pub(crate) fn every_secs(secs: i64) -> (Self, Arc<TriggerCalls>) {
        let calls = Arc::new(TriggerCalls::default());
        (
            Self {
                period: Duration::seconds(secs),
                anchor: None,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl Trigger for RecordingTrigger {
    fn next_after(&mut self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.calls.next_calls.fetch_add(1, Ordering::SeqCst);
        self.calls.record("next");
        let next = match self.anchor {
            Some(anchor) if anchor + self.period > after => anchor + self.period,
            _ => after + self.period,
        };
        self.anchor = Some(next);
        Some(next)
    }

    fn reset_clock(&mut self) {
        self.calls.resets.fetch_add(1, Ordering::SeqCst);
        self.calls.record("reset");
        self.anchor = None;
    }
}
