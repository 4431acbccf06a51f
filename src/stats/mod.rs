//! Monitoring counters and the shutdown summary.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::clock;
use crate::session::Session;
use crate::sink::record::{Record, RecordContext};

/// Lock-free counters shared by the ingest path and the shutdown summary.
#[derive(Debug, Default)]
pub struct MonitorStats {
    total_route_events: AtomicU64,
    netem_triggers: AtomicU64,
    route_triggers: AtomicU64,
}

impl MonitorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one appended route event; the return value is the global
    /// `route_event_number` for its log record.
    pub fn next_route_event_number(&self) -> u64 {
        self.total_route_events.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_netem_trigger(&self) {
        self.netem_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_route_trigger(&self) {
        self.route_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let netem_triggers = self.netem_triggers.load(Ordering::Relaxed);
        let route_triggers = self.route_triggers.load(Ordering::Relaxed);
        StatsSnapshot {
            total_route_events: self.total_route_events.load(Ordering::Relaxed),
            netem_triggers,
            route_triggers,
            total_triggers: netem_triggers + route_triggers,
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub total_route_events: u64,
    pub netem_triggers: u64,
    pub route_triggers: u64,
    pub total_triggers: u64,
}

/// Aggregates over the completed-session list, computed at shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub completed_sessions: usize,
    pub fastest_convergence_ms: Option<i64>,
    pub slowest_convergence_ms: Option<i64>,
    pub avg_convergence_time_ms: Option<f64>,
    /// Histogram: convergence under 100 ms.
    pub fast_count: usize,
    /// 100–999 ms.
    pub medium_count: usize,
    /// 1000 ms and above.
    pub slow_count: usize,
    pub interfaces: Vec<String>,
}

/// Compute the shutdown summary over the completed sessions.
pub fn summarize(sessions: &[Arc<Session>]) -> Summary {
    let mut convergence_times = Vec::with_capacity(sessions.len());
    let mut interfaces = BTreeSet::new();

    for session in sessions {
        if let Some(t) = session.convergence_time_ms() {
            convergence_times.push(t);
        }
        session.collect_interfaces(&mut interfaces);
    }

    let mut fast_count = 0;
    let mut medium_count = 0;
    let mut slow_count = 0;
    for &t in &convergence_times {
        if t < 100 {
            fast_count += 1;
        } else if t < 1_000 {
            medium_count += 1;
        } else {
            slow_count += 1;
        }
    }

    let fastest_convergence_ms = convergence_times.iter().min().copied();
    let slowest_convergence_ms = convergence_times.iter().max().copied();
    let avg_convergence_time_ms = if convergence_times.is_empty() {
        None
    } else {
        Some(convergence_times.iter().sum::<i64>() as f64 / convergence_times.len() as f64)
    };

    Summary {
        completed_sessions: sessions.len(),
        fastest_convergence_ms,
        slowest_convergence_ms,
        avg_convergence_time_ms,
        fast_count,
        medium_count,
        slow_count,
        interfaces: interfaces.into_iter().collect(),
    }
}

/// Build the final `monitoring_completed` record.
#[allow(clippy::too_many_arguments)]
pub fn monitoring_completed(
    ctx: &RecordContext,
    now_ms: i64,
    monitoring_start_ms: i64,
    convergence_threshold_ms: i64,
    log_file_path: &str,
    monitor_id: &str,
    stats: &StatsSnapshot,
    summary: &Summary,
) -> Record {
    let total_listen_duration_ms = now_ms.saturating_sub(monitoring_start_ms);

    let mut record = Record::new("monitoring_completed", ctx, now_ms);
    record
        .set("log_file_path", log_file_path)
        .set("total_listen_duration_ms", total_listen_duration_ms)
        .set(
            "total_listen_duration_seconds",
            total_listen_duration_ms as f64 / 1000.0,
        )
        .set("convergence_threshold_ms", convergence_threshold_ms)
        .set("total_trigger_events", stats.total_triggers)
        .set("netem_events_count", stats.netem_triggers)
        .set("route_events_in_trigger", stats.route_triggers)
        .set("total_route_events", stats.total_route_events)
        .set("completed_sessions_count", summary.completed_sessions)
        .set("monitor_id", monitor_id)
        .set(
            "interfaces_observed",
            serde_json::to_value(&summary.interfaces).unwrap_or_default(),
        )
        .set("utc_time", clock::iso_utc(now_ms))
        .set("listen_end_time", clock::iso_utc(now_ms))
        .set("extraction_timestamp", clock::iso_utc(now_ms))
        .set(
            "extracted_by",
            format!(
                "convergoor_v{}_{monitor_id}",
                env!("CARGO_PKG_VERSION"),
            ),
        );

    if let Some(fastest) = summary.fastest_convergence_ms {
        record.set("fastest_convergence_ms", fastest);
    }
    if let Some(slowest) = summary.slowest_convergence_ms {
        record.set("slowest_convergence_ms", slowest);
    }
    if let Some(avg) = summary.avg_convergence_time_ms {
        record.set("avg_convergence_time_ms", avg);
    }

    record
}
