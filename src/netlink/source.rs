//! Kernel event delivery.
//!
//! One task multiplexes the route socket and the traffic-control socket with
//! a readiness wait plus the shutdown token, so downstream components see a
//! total order consistent with kernel delivery order. Running a reader
//! thread per socket would silently reorder qdisc events against route
//! events and break the QDISC_DEL history correlation.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock;

use super::parse::Classifier;
use super::socket::{
    NetlinkSocket, RECV_BUFFER_SIZE, RTMGRP_IPV4_ROUTE, RTMGRP_IPV6_ROUTE, RTMGRP_TC,
};
use super::{ErrorHandler, EventHandler, EventSource};

/// Hard read failures tolerated before the delivery loop gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Pause after a transient read failure.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// rtnetlink-backed event source.
pub struct NetlinkSource {
    event_handlers: Vec<EventHandler>,
    error_handlers: Vec<ErrorHandler>,
    delivery_task: Option<tokio::task::JoinHandle<()>>,
}

impl Default for NetlinkSource {
    fn default() -> Self {
        Self::new()
    }
}

impl NetlinkSource {
    pub fn new() -> Self {
        Self {
            event_handlers: Vec::with_capacity(2),
            error_handlers: Vec::with_capacity(1),
            delivery_task: None,
        }
    }
}

impl EventSource for NetlinkSource {
    async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        // Both sockets are NETLINK_ROUTE; they differ only in which
        // multicast groups they join.
        let route = NetlinkSocket::open(RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE)
            .context("opening route netlink socket")?;
        let tc = NetlinkSocket::open(RTMGRP_TC).context("opening traffic-control netlink socket")?;

        let route_fd = AsyncFd::new(route).context("registering route socket for readiness")?;
        let tc_fd = AsyncFd::new(tc).context("registering tc socket for readiness")?;

        // Move handlers into the delivery task.
        let event_handlers = Arc::new(std::mem::take(&mut self.event_handlers));
        let error_handlers = Arc::new(std::mem::take(&mut self.error_handlers));

        let handle = tokio::spawn(async move {
            delivery_loop(route_fd, tc_fd, event_handlers, error_handlers, cancel).await;
        });
        self.delivery_task = Some(handle);

        info!("netlink source started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // The delivery task exits when the CancellationToken fires; the
        // sockets close when the task drops its AsyncFds, after the wakeup
        // has been observed.
        if let Some(handle) = self.delivery_task.take() {
            handle.await.context("waiting for delivery task")?;
        }

        info!("netlink source stopped");
        Ok(())
    }

    fn on_event(&mut self, handler: EventHandler) {
        self.event_handlers.push(handler);
    }

    fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handlers.push(handler);
    }
}

// ---------------------------------------------------------------------------
// Delivery loop
// ---------------------------------------------------------------------------

async fn delivery_loop(
    route_fd: AsyncFd<NetlinkSocket>,
    tc_fd: AsyncFd<NetlinkSocket>,
    event_handlers: Arc<Vec<EventHandler>>,
    error_handlers: Arc<Vec<ErrorHandler>>,
    cancel: CancellationToken,
) {
    let classifier = Classifier::new();
    let mut consecutive_errors: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = route_fd.readable() => {
                if handle_ready(
                    result,
                    "route",
                    &classifier,
                    &event_handlers,
                    &error_handlers,
                    &mut consecutive_errors,
                )
                .await
                .is_break()
                {
                    break;
                }
            }

            result = tc_fd.readable() => {
                if handle_ready(
                    result,
                    "tc",
                    &classifier,
                    &event_handlers,
                    &error_handlers,
                    &mut consecutive_errors,
                )
                .await
                .is_break()
                {
                    break;
                }
            }
        }
    }

    debug!("delivery loop exited");
}

/// Process one readiness notification: drain the socket, escalate repeated
/// hard failures to log-and-stop.
async fn handle_ready(
    result: io::Result<tokio::io::unix::AsyncFdReadyGuard<'_, NetlinkSocket>>,
    stream: &'static str,
    classifier: &Classifier,
    event_handlers: &[EventHandler],
    error_handlers: &[ErrorHandler],
    consecutive_errors: &mut u32,
) -> std::ops::ControlFlow<()> {
    let mut guard = match result {
        Ok(guard) => guard,
        Err(e) => {
            error!(stream, error = %e, "netlink readiness wait failed");
            report_error(error_handlers, anyhow::anyhow!("{stream} readiness: {e}"));
            return std::ops::ControlFlow::Break(());
        }
    };

    match drain_socket(guard.get_inner(), classifier, event_handlers) {
        Ok(()) => {
            *consecutive_errors = 0;
            guard.clear_ready();
            std::ops::ControlFlow::Continue(())
        }
        Err(e) => {
            *consecutive_errors += 1;
            warn!(
                stream,
                error = %e,
                failures = *consecutive_errors,
                "netlink read failed",
            );
            report_error(error_handlers, anyhow::anyhow!("{stream} read: {e}"));

            if *consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                error!(stream, "repeated netlink read failures, stopping delivery");
                return std::ops::ControlFlow::Break(());
            }

            guard.clear_ready();
            tokio::time::sleep(ERROR_BACKOFF).await;
            std::ops::ControlFlow::Continue(())
        }
    }
}

/// Read datagrams until the socket would block, delivering every decoded
/// event in arrival order.
fn drain_socket(
    sock: &NetlinkSocket,
    classifier: &Classifier,
    handlers: &[EventHandler],
) -> io::Result<()> {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        match sock.recv(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                let now = clock::now_ms();
                for event in classifier.classify_datagram(&buf[..n], now) {
                    dispatch(handlers, event);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn dispatch(handlers: &[EventHandler], event: crate::netlink::event::NetlinkEvent) {
    match handlers.len() {
        0 => {}
        1 => {
            if let Some(handler) = handlers.first() {
                handler(event);
            }
        }
        len => {
            for handler in handlers.iter().take(len - 1) {
                handler(event.clone());
            }
            if let Some(last) = handlers.get(len - 1) {
                last(event);
            }
        }
    }
}

fn report_error(handlers: &[ErrorHandler], err: anyhow::Error) {
    for handler in handlers {
        handler(anyhow::anyhow!("{err}"));
    }
}
