pub mod history;
pub mod manager;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::netlink::event::AttrMap;

/// One route event recorded inside a session.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub timestamp_ms: i64,
    /// Display name of the event; netem qdisc events appended mid-session
    /// carry a synthetic name distinguishing them from route-table changes.
    pub name: String,
    pub attrs: AttrMap,
    pub offset_from_trigger_ms: i64,
}

/// Result of a successful append, used by the caller to build the log record.
#[derive(Debug, Clone, Copy)]
pub struct AppendInfo {
    /// 1-based event number within this session.
    pub session_event_number: usize,
    pub offset_from_trigger_ms: i64,
}

#[derive(Debug, Default)]
struct SessionInner {
    route_events: Vec<RecordedEvent>,
    last_route_event_time_ms: Option<i64>,
    convergence_detected_time_ms: Option<i64>,
    convergence_time_ms: Option<i64>,
}

/// A single convergence measurement: opened by a trigger event, fed route
/// events by the ingest path, closed by the quiescence check.
///
/// Appends and convergence checks are serialized by the session's own mutex;
/// `converged` is additionally an atomic so other threads can snapshot it
/// without blocking. Once converged a session never mutates again.
#[derive(Debug)]
pub struct Session {
    pub session_id: u64,
    pub trigger_time_ms: i64,
    pub trigger_info: AttrMap,
    inner: Mutex<SessionInner>,
    converged: AtomicBool,
}

impl Session {
    pub fn new(session_id: u64, trigger_time_ms: i64, trigger_info: AttrMap) -> Self {
        Self {
            session_id,
            trigger_time_ms,
            trigger_info,
            inner: Mutex::new(SessionInner::default()),
            converged: AtomicBool::new(false),
        }
    }

    /// Append a route event. No-op (returns `None`) once converged.
    pub fn append_route_event(
        &self,
        timestamp_ms: i64,
        name: impl Into<String>,
        attrs: AttrMap,
    ) -> Option<AppendInfo> {
        let mut inner = self.inner.lock();
        if self.converged.load(Ordering::Acquire) {
            return None;
        }

        let offset_from_trigger_ms = timestamp_ms - self.trigger_time_ms;
        inner.route_events.push(RecordedEvent {
            timestamp_ms,
            name: name.into(),
            attrs,
            offset_from_trigger_ms,
        });
        inner.last_route_event_time_ms = Some(timestamp_ms);

        Some(AppendInfo {
            session_event_number: inner.route_events.len(),
            offset_from_trigger_ms,
        })
    }

    /// Decide whether the route table has been quiet for `quiet_ms` as of
    /// `now_ms`. On the transition to converged, records the detection time
    /// and the convergence time (last event − trigger, or 0 with no events).
    /// Idempotent: returns true forever once converged.
    pub fn check_convergence(&self, quiet_ms: i64, now_ms: i64) -> bool {
        let mut inner = self.inner.lock();
        if self.converged.load(Ordering::Acquire) {
            return true;
        }

        let quiet_since = inner.last_route_event_time_ms.unwrap_or(self.trigger_time_ms);
        if now_ms - quiet_since < quiet_ms {
            return false;
        }

        inner.convergence_detected_time_ms = Some(now_ms);
        inner.convergence_time_ms = Some(
            inner
                .last_route_event_time_ms
                .map_or(0, |last| last - self.trigger_time_ms),
        );
        self.converged.store(true, Ordering::Release);
        true
    }

    /// Lock-free snapshot of the converged flag.
    pub fn is_converged(&self) -> bool {
        self.converged.load(Ordering::Acquire)
    }

    pub fn route_event_count(&self) -> usize {
        self.inner.lock().route_events.len()
    }

    pub fn convergence_time_ms(&self) -> Option<i64> {
        self.inner.lock().convergence_time_ms
    }

    pub fn convergence_detected_time_ms(&self) -> Option<i64> {
        self.inner.lock().convergence_detected_time_ms
    }

    pub fn last_route_event_time_ms(&self) -> Option<i64> {
        self.inner.lock().last_route_event_time_ms
    }

    /// Session length: trigger to convergence detection, or to `now_ms`
    /// while still open.
    pub fn duration_ms(&self, now_ms: i64) -> i64 {
        let inner = self.inner.lock();
        inner
            .convergence_detected_time_ms
            .unwrap_or(now_ms)
            .saturating_sub(self.trigger_time_ms)
    }

    /// Clone of the recorded route events.
    pub fn route_events(&self) -> Vec<RecordedEvent> {
        self.inner.lock().route_events.clone()
    }

    /// Collect interface names from the trigger info and every recorded
    /// event into `set`. Used by the shutdown summary.
    pub fn collect_interfaces(&self, set: &mut BTreeSet<String>) {
        if let Some(iface) = self.trigger_info.get("interface") {
            if iface != crate::netlink::event::ATTR_UNSET {
                set.insert(iface.clone());
            }
        }
        for event in self.inner.lock().route_events.iter() {
            if let Some(iface) = event.attrs.get("interface") {
                if iface != crate::netlink::event::ATTR_UNSET {
                    set.insert(iface.clone());
                }
            }
        }
    }
}
