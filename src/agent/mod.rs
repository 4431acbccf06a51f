//! Component orchestration.
//!
//! Wires the netlink source into the session manager, runs the quiescence
//! ticker and the log consumer, and drives the shutdown cascade:
//! stop ingest → stop ticker → force-finish the live session → drain the
//! sink → emit the summary.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock;
use crate::config::Config;
use crate::netlink::source::NetlinkSource;
use crate::netlink::EventSource;
use crate::session::manager::SessionManager;
use crate::sink::record::{self, RecordContext};
use crate::sink::LogSink;
use crate::stats::{self, MonitorStats};
use crate::ticker::QuiescenceTicker;

/// Agent owns every long-lived component and the shutdown order between them.
pub struct Agent {
    cfg: Config,
    ctx: RecordContext,
    monitor_id: String,
    stats: Arc<MonitorStats>,
    sink: Option<Arc<LogSink>>,
    manager: Option<Arc<SessionManager>>,
    source: Option<NetlinkSource>,
    ticker: QuiescenceTicker,
    cancel: CancellationToken,
    started_ms: i64,
    stopped: bool,
}

impl Agent {
    pub fn new(cfg: Config) -> Self {
        let ctx = RecordContext {
            router_name: cfg.router_name.clone(),
            user: cfg.user.clone(),
        };

        Self {
            cfg,
            ctx,
            monitor_id: uuid::Uuid::new_v4().to_string(),
            stats: Arc::new(MonitorStats::new()),
            sink: None,
            manager: None,
            source: None,
            ticker: QuiescenceTicker::default(),
            cancel: CancellationToken::new(),
            started_ms: 0,
            stopped: false,
        }
    }

    /// Start all components and begin observation.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Log sink first, so every later step has somewhere to record to.
        let sink = LogSink::open(&self.cfg.log_path);
        sink.start();

        self.started_ms = clock::now_ms();
        let log_file_path = sink.log_file_path().display().to_string();
        sink.enqueue(record::monitoring_started(
            &self.ctx,
            self.started_ms,
            self.cfg.threshold_ms,
            &log_file_path,
            &self.monitor_id,
        ));

        // 2. Session state machine.
        let manager = Arc::new(SessionManager::new(
            self.ctx.clone(),
            self.cfg.threshold_ms,
            Arc::clone(&self.stats),
            Arc::clone(&sink),
        ));

        // 3. Kernel event source, delivering straight into the manager.
        let mut source = NetlinkSource::new();
        {
            let manager = Arc::clone(&manager);
            source.on_event(Box::new(move |event| {
                manager.handle_event(event);
            }));
        }
        source.on_error(Box::new(|err| {
            warn!(error = %err, "netlink source error");
        }));

        source
            .start(self.cancel.child_token())
            .await
            .context("starting netlink source")?;

        // 4. Quiescence ticker.
        self.ticker
            .start(Arc::clone(&manager), self.cancel.child_token());

        self.sink = Some(sink);
        self.manager = Some(manager);
        self.source = Some(source);

        info!(
            router_name = %self.cfg.router_name,
            threshold_ms = self.cfg.threshold_ms,
            log_file = %log_file_path,
            monitor_id = %self.monitor_id,
            "monitoring started, waiting for trigger events",
        );

        Ok(())
    }

    /// Gracefully stop all components. Idempotent; a failure in one
    /// component's teardown does not prevent the others from draining.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        // Wake every blocking point.
        self.cancel.cancel();

        // Stop ingest so no further events race the final session state.
        if let Some(source) = &mut self.source {
            if let Err(e) = source.stop().await {
                error!(error = %e, "error stopping netlink source");
            }
        }

        // Stop the ticker before force-finishing so it cannot double-close.
        if let Err(e) = self.ticker.stop().await {
            error!(error = %e, "error stopping quiescence ticker");
        }

        let now_ms = clock::now_ms();

        if let Some(manager) = &self.manager {
            manager.force_finish(now_ms, "monitoring stopped");
        }

        // Drain the queue first so the summary is the last line in the
        // stream, then write it synchronously.
        if let Some(sink) = &self.sink {
            sink.shutdown().await;
        }

        if let (Some(manager), Some(sink)) = (&self.manager, &self.sink) {
            let completed = manager.completed_sessions();
            let summary = stats::summarize(&completed);
            let snapshot = self.stats.snapshot();

            let record = stats::monitoring_completed(
                &self.ctx,
                now_ms,
                self.started_ms,
                self.cfg.threshold_ms,
                &sink.log_file_path().display().to_string(),
                &self.monitor_id,
                &snapshot,
                &summary,
            );
            sink.emit_sync(&record);

            info!(
                listen_seconds = (now_ms - self.started_ms) as f64 / 1000.0,
                trigger_events = snapshot.total_triggers,
                route_events = snapshot.total_route_events,
                completed_sessions = summary.completed_sessions,
                fastest_ms = ?summary.fastest_convergence_ms,
                slowest_ms = ?summary.slowest_convergence_ms,
                avg_ms = ?summary.avg_convergence_time_ms,
                "monitoring summary",
            );
        }

        info!("monitoring stopped");
        Ok(())
    }
}
