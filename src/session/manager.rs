//! The idle⇄monitoring state machine.
//!
//! Owns at most one live session. Every transition runs under the single
//! manager mutex, including finalization, so an event handler can never see
//! a session that is finished but still marked current. The quiescence
//! ticker is the only caller that touches a session outside that mutex, and
//! it does so through [`SessionManager::poll_quiescence`]'s two-phase
//! protocol.
//!
//! Lock order: manager → session → qdisc history; the log queue is a leaf
//! and may be taken while holding any of them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::netlink::event::{AttrMap, EventKind, NetlinkEvent};
use crate::sink::record::{self, RecordContext};
use crate::sink::LogSink;
use crate::stats::MonitorStats;

use super::history::QdiscHistory;
use super::Session;

/// Monitoring state. `Monitoring` iff a live session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Monitoring,
}

#[derive(Debug)]
struct ManagerState {
    mode: MonitorState,
    current: Option<Arc<Session>>,
    completed: Vec<Arc<Session>>,
}

/// Session lifecycle owner: classifies incoming events, opens sessions on
/// triggers, appends during monitoring, finalizes on quiescence or shutdown.
pub struct SessionManager {
    state: Mutex<ManagerState>,
    history: QdiscHistory,
    stats: Arc<MonitorStats>,
    sink: Arc<LogSink>,
    ctx: RecordContext,
    threshold_ms: i64,
    session_seq: AtomicU64,
}

impl SessionManager {
    pub fn new(
        ctx: RecordContext,
        threshold_ms: i64,
        stats: Arc<MonitorStats>,
        sink: Arc<LogSink>,
    ) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                mode: MonitorState::Idle,
                current: None,
                completed: Vec::new(),
            }),
            history: QdiscHistory::new(),
            stats,
            sink,
            ctx,
            threshold_ms,
            session_seq: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state.lock().mode
    }

    pub fn completed_count(&self) -> usize {
        self.state.lock().completed.len()
    }

    /// Snapshot of the completed-session list (sessions are shared, the list
    /// is cloned).
    pub fn completed_sessions(&self) -> Vec<Arc<Session>> {
        self.state.lock().completed.clone()
    }

    /// Snapshot of the live session, if any.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.state.lock().current.clone()
    }

    /// Ingest entry point; called from the delivery task for every canonical
    /// event.
    pub fn handle_event(&self, event: NetlinkEvent) {
        if event.kind.is_qdisc() {
            self.handle_qdisc_event(event);
        } else {
            self.handle_route_event(event);
        }
    }

    /// Quiescence probe, called by the ticker. Two phases: snapshot the live
    /// session under the manager mutex, run the convergence check without
    /// it, and only re-acquire to finalize if the session converged and is
    /// still the current one. Returns true when a session was finalized.
    pub fn poll_quiescence(&self, now_ms: i64) -> bool {
        let session = {
            let state = self.state.lock();
            match (&state.mode, &state.current) {
                (MonitorState::Monitoring, Some(current)) if !current.is_converged() => {
                    Some(Arc::clone(current))
                }
                _ => None,
            }
        };

        let Some(session) = session else {
            return false;
        };

        if !session.check_convergence(self.threshold_ms, now_ms) {
            return false;
        }

        let mut state = self.state.lock();
        let still_current = state.mode == MonitorState::Monitoring
            && state
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &session));
        if !still_current {
            return false;
        }

        info!(session_id = session.session_id, "session converged");
        self.finalize_locked(&mut state, now_ms);
        true
    }

    /// Force-finalize any live session (shutdown path). Treats the session
    /// as converged regardless of the quiet interval. Idempotent.
    pub fn force_finish(&self, now_ms: i64, reason: &str) {
        let mut state = self.state.lock();
        if let Some(current) = &state.current {
            current.check_convergence(0, now_ms);
            info!(
                session_id = current.session_id,
                reason, "force-finishing session",
            );
            self.finalize_locked(&mut state, now_ms);
        }
    }

    // -- qdisc path ---------------------------------------------------------

    fn handle_qdisc_event(&self, event: NetlinkEvent) {
        // Every qdisc event feeds the history, trigger or not; a later
        // QDISC_DEL can only be attributed through it.
        self.history
            .push(event.timestamp_ms, event.kind.as_str(), event.attrs.clone());

        if !self.is_netem_related(&event) {
            debug!(kind = %event.kind, "qdisc event is not netem-related");
            return;
        }

        self.sink.enqueue(record::netem_detected(
            &self.ctx,
            event.timestamp_ms,
            event.kind.as_str(),
            &event.attrs,
        ));

        let mut state = self.state.lock();
        match state.mode {
            MonitorState::Monitoring => {
                // A disturbance during a live measurement is data, not a new
                // trigger: record it as a synthetic route event.
                let name = format!("Netem事件({})", event.kind.as_str());
                self.append_locked(&state, event.timestamp_ms, &name, event.attrs);
            }
            MonitorState::Idle => {
                if matches!(event.kind, EventKind::QdiscAdd | EventKind::QdiscDel) {
                    self.stats.record_netem_trigger();
                    self.open_session_locked(
                        &mut state,
                        event.timestamp_ms,
                        "netem",
                        event.kind.as_str(),
                        event.attrs,
                    );
                } else {
                    // QDISC_GET never opens a session.
                    debug!(kind = %event.kind, "netem qdisc event ignored in idle state");
                }
            }
        }
    }

    /// Netem attribution: the event says so itself, or it deletes a qdisc on
    /// an interface where the history remembers a netem install.
    fn is_netem_related(&self, event: &NetlinkEvent) -> bool {
        if event.is_netem() {
            return true;
        }

        event.kind == EventKind::QdiscDel
            && event.attrs.get("interface").is_some_and(|interface| {
                self.history
                    .netem_seen_on_interface(interface, event.timestamp_ms)
            })
    }

    // -- route path ---------------------------------------------------------

    fn handle_route_event(&self, event: NetlinkEvent) {
        let mut state = self.state.lock();
        match state.mode {
            MonitorState::Idle => {
                let mut trigger_info = AttrMap::new();
                trigger_info.insert(
                    "type".to_string(),
                    match event.kind {
                        EventKind::RouteAdd => "route_add",
                        _ => "route_del",
                    }
                    .to_string(),
                );
                for key in ["dst", "interface", "gateway"] {
                    trigger_info.insert(key.to_string(), event.attr_or_unset(key).to_string());
                }

                self.stats.record_route_trigger();
                self.open_session_locked(
                    &mut state,
                    event.timestamp_ms,
                    "route",
                    event.kind.as_str(),
                    trigger_info,
                );
            }
            MonitorState::Monitoring => {
                self.append_locked(&state, event.timestamp_ms, event.kind.as_str(), event.attrs);
            }
        }
    }

    // -- transitions (manager mutex held) -----------------------------------

    fn open_session_locked(
        &self,
        state: &mut ManagerState,
        timestamp_ms: i64,
        trigger_source: &str,
        trigger_event_type: &str,
        trigger_info: AttrMap,
    ) {
        let session_id = self.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(Session::new(session_id, timestamp_ms, trigger_info));

        info!(
            session_id,
            trigger_source,
            trigger_event_type,
            "session started",
        );
        self.sink.enqueue(record::session_started(
            &self.ctx,
            timestamp_ms,
            session_id,
            trigger_source,
            trigger_event_type,
            &session.trigger_info,
        ));

        state.current = Some(session);
        state.mode = MonitorState::Monitoring;
    }

    fn append_locked(&self, state: &ManagerState, timestamp_ms: i64, name: &str, attrs: AttrMap) {
        let Some(session) = &state.current else {
            return;
        };

        // A converged-but-not-yet-finalized session rejects the append; the
        // event is then neither counted nor logged, keeping the summary
        // total equal to the per-session sum.
        let Some(appended) = session.append_route_event(timestamp_ms, name, attrs.clone()) else {
            debug!(
                session_id = session.session_id,
                name, "event after convergence dropped",
            );
            return;
        };

        let route_event_number = self.stats.next_route_event_number();
        self.sink.enqueue(record::route_event(
            &self.ctx,
            timestamp_ms,
            session.session_id,
            name,
            route_event_number,
            appended.session_event_number,
            appended.offset_from_trigger_ms,
            &attrs,
        ));
    }

    fn finalize_locked(&self, state: &mut ManagerState, now_ms: i64) {
        let Some(session) = state.current.take() else {
            return;
        };

        self.sink.enqueue(record::session_completed(
            &self.ctx,
            now_ms,
            session.session_id,
            session.convergence_time_ms(),
            session.route_event_count(),
            session.duration_ms(now_ms),
            self.threshold_ms,
            &session.trigger_info,
        ));

        state.completed.push(session);
        state.mode = MonitorState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn netem_qdisc(kind: EventKind, interface: &str, ts: i64) -> NetlinkEvent {
        NetlinkEvent {
            timestamp_ms: ts,
            kind,
            attrs: attrs(&[
                ("interface", interface),
                ("kind", "netem"),
                ("is_netem", "true"),
            ]),
        }
    }

    fn plain_qdisc(kind: EventKind, interface: &str, qdisc_kind: &str, ts: i64) -> NetlinkEvent {
        NetlinkEvent {
            timestamp_ms: ts,
            kind,
            attrs: attrs(&[
                ("interface", interface),
                ("kind", qdisc_kind),
                ("is_netem", "false"),
            ]),
        }
    }

    fn route(kind: EventKind, dst: &str, ts: i64) -> NetlinkEvent {
        NetlinkEvent {
            timestamp_ms: ts,
            kind,
            attrs: attrs(&[("dst", dst), ("interface", "eth0"), ("gateway", "10.0.0.1")]),
        }
    }

    fn manager(threshold_ms: i64) -> (SessionManager, PathBuf) {
        let path =
            std::env::temp_dir().join(format!("convergoor-mgr-{}.json", uuid::Uuid::new_v4()));
        let sink = LogSink::open(&path);
        let ctx = RecordContext {
            router_name: "r1".to_string(),
            user: "tester".to_string(),
        };
        (
            SessionManager::new(ctx, threshold_ms, Arc::new(MonitorStats::new()), sink),
            path,
        )
    }

    #[test]
    fn test_netem_trigger_opens_session() {
        let (mgr, path) = manager(3_000);
        assert_eq!(mgr.state(), MonitorState::Idle);

        mgr.handle_event(netem_qdisc(EventKind::QdiscAdd, "eth0", 1_000));

        assert_eq!(mgr.state(), MonitorState::Monitoring);
        assert_eq!(mgr.stats.snapshot().netem_triggers, 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_route_trigger_synthesizes_trigger_info() {
        let (mgr, path) = manager(1_000);
        mgr.handle_event(route(EventKind::RouteDel, "10.1.0.0/16", 0));

        assert_eq!(mgr.state(), MonitorState::Monitoring);
        let state = mgr.state.lock();
        let session = state.current.as_ref().expect("live session");
        assert_eq!(session.trigger_info["type"], "route_del");
        assert_eq!(session.trigger_info["dst"], "10.1.0.0/16");
        assert_eq!(session.trigger_info["interface"], "eth0");
        assert_eq!(session.trigger_info["gateway"], "10.0.0.1");
        drop(state);

        assert_eq!(mgr.stats.snapshot().route_triggers, 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_route_events_append_during_monitoring() {
        let (mgr, path) = manager(1_000);
        mgr.handle_event(route(EventKind::RouteDel, "10.1.0.0/16", 0));
        mgr.handle_event(route(EventKind::RouteAdd, "10.1.0.0/16", 50));
        mgr.handle_event(route(EventKind::RouteAdd, "10.1.0.0/16", 120));

        let state = mgr.state.lock();
        let session = state.current.as_ref().expect("live session");
        assert_eq!(session.route_event_count(), 2);
        assert_eq!(session.last_route_event_time_ms(), Some(120));
        drop(state);

        // Only appended events count; the trigger itself does not.
        assert_eq!(mgr.stats.snapshot().total_route_events, 2);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_second_trigger_during_monitoring_is_ignored() {
        let (mgr, path) = manager(3_000);
        mgr.handle_event(netem_qdisc(EventKind::QdiscAdd, "eth0", 0));
        mgr.handle_event(netem_qdisc(EventKind::QdiscAdd, "eth1", 500));

        // Still one session; the second netem event became a synthetic
        // route event inside session 1.
        let state = mgr.state.lock();
        let session = state.current.as_ref().expect("live session");
        assert_eq!(session.session_id, 1);
        let events = session.route_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Netem事件(QDISC_ADD)");
        assert_eq!(events[0].offset_from_trigger_ms, 500);
        drop(state);

        assert_eq!(mgr.completed_count(), 0);
        assert_eq!(mgr.stats.snapshot().netem_triggers, 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_non_netem_qdisc_only_feeds_history() {
        let (mgr, path) = manager(3_000);
        mgr.handle_event(plain_qdisc(EventKind::QdiscAdd, "eth0", "fq_codel", 0));

        assert_eq!(mgr.state(), MonitorState::Idle);
        assert_eq!(mgr.history.len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_netem_qdisc_get_does_not_trigger() {
        let (mgr, path) = manager(3_000);
        mgr.handle_event(netem_qdisc(EventKind::QdiscGet, "eth0", 0));

        assert_eq!(mgr.state(), MonitorState::Idle);
        assert_eq!(mgr.history.len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_qdisc_del_inferred_from_history() {
        let (mgr, path) = manager(3_000);
        // Netem install opens session 1 and seeds the history.
        mgr.handle_event(netem_qdisc(EventKind::QdiscAdd, "eth0", 0));
        // Later delete arrives without a kind attribute.
        mgr.handle_event(plain_qdisc(EventKind::QdiscDel, "eth0", "unknown", 500));

        let state = mgr.state.lock();
        let session = state.current.as_ref().expect("live session");
        let events = session.route_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Netem事件(QDISC_DEL)");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_qdisc_del_on_other_interface_not_inferred() {
        let (mgr, path) = manager(3_000);
        mgr.handle_event(netem_qdisc(EventKind::QdiscAdd, "eth0", 0));
        mgr.handle_event(plain_qdisc(EventKind::QdiscDel, "eth2", "unknown", 500));

        let state = mgr.state.lock();
        let session = state.current.as_ref().expect("live session");
        assert_eq!(session.route_event_count(), 0);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_poll_quiescence_finalizes_after_threshold() {
        let (mgr, path) = manager(3_000);
        mgr.handle_event(netem_qdisc(EventKind::QdiscAdd, "eth0", 1_000));

        assert!(!mgr.poll_quiescence(3_999));
        assert_eq!(mgr.state(), MonitorState::Monitoring);

        assert!(mgr.poll_quiescence(4_000));
        assert_eq!(mgr.state(), MonitorState::Idle);
        assert_eq!(mgr.completed_count(), 1);

        let completed = mgr.completed_sessions();
        assert_eq!(completed[0].convergence_time_ms(), Some(0));
        assert_eq!(completed[0].route_event_count(), 0);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_poll_quiescence_measures_from_last_event() {
        let (mgr, path) = manager(1_000);
        mgr.handle_event(route(EventKind::RouteDel, "10.1.0.0/16", 0));
        mgr.handle_event(route(EventKind::RouteAdd, "10.1.0.0/16", 50));
        mgr.handle_event(route(EventKind::RouteAdd, "10.1.0.0/16", 120));

        assert!(!mgr.poll_quiescence(1_000));
        assert!(mgr.poll_quiescence(1_120));

        let completed = mgr.completed_sessions();
        assert_eq!(completed[0].convergence_time_ms(), Some(120));
        assert_eq!(completed[0].route_event_count(), 2);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_new_session_can_open_after_finalize() {
        let (mgr, path) = manager(100);
        mgr.handle_event(netem_qdisc(EventKind::QdiscAdd, "eth0", 0));
        assert!(mgr.poll_quiescence(100));

        mgr.handle_event(netem_qdisc(EventKind::QdiscDel, "eth0", 200));
        assert_eq!(mgr.state(), MonitorState::Monitoring);

        let state = mgr.state.lock();
        assert_eq!(state.current.as_ref().expect("live session").session_id, 2);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_session_ids_strictly_increasing() {
        let (mgr, path) = manager(1);
        for i in 0..5 {
            let ts = i * 1_000;
            mgr.handle_event(netem_qdisc(EventKind::QdiscAdd, "eth0", ts));
            assert!(mgr.poll_quiescence(ts + 500));
        }

        let ids: Vec<u64> = mgr
            .completed_sessions()
            .iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_force_finish_treats_session_as_converged() {
        let (mgr, path) = manager(3_000);
        mgr.handle_event(netem_qdisc(EventKind::QdiscAdd, "eth0", 0));

        mgr.force_finish(2_000, "shutdown");

        assert_eq!(mgr.state(), MonitorState::Idle);
        let completed = mgr.completed_sessions();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].convergence_time_ms(), Some(0));

        // Idempotent.
        mgr.force_finish(2_500, "shutdown");
        assert_eq!(mgr.completed_count(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_route_event_in_idle_without_trigger_kind_impossible() {
        // Route events in idle always trigger; qdisc gets never do. Mixing
        // the two: a non-netem qdisc then a route event yields one session
        // triggered by the route.
        let (mgr, path) = manager(1_000);
        mgr.handle_event(plain_qdisc(EventKind::QdiscAdd, "eth0", "fq", 0));
        mgr.handle_event(route(EventKind::RouteAdd, "10.0.0.0/8", 10));

        assert_eq!(mgr.state(), MonitorState::Monitoring);
        assert_eq!(mgr.stats.snapshot().route_triggers, 1);
        assert_eq!(mgr.stats.snapshot().netem_triggers, 0);
        let _ = std::fs::remove_file(path);
    }
}
