pub mod event;
pub mod parse;
pub mod socket;
pub mod source;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use self::event::NetlinkEvent;

/// Callback for canonical events.
pub type EventHandler = Box<dyn Fn(NetlinkEvent) + Send + Sync>;

/// Callback for source errors.
pub type ErrorHandler = Box<dyn Fn(anyhow::Error) + Send + Sync>;

/// EventSource subscribes to the kernel's route + traffic-control feed and
/// delivers canonical events, in kernel order, from a single delivery task.
pub trait EventSource: Send {
    /// Open kernel subscriptions and start the delivery task.
    fn start(
        &mut self,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Wait for the delivery task to finish and tear down kernel handles.
    /// The cancellation token passed to `start` must already be cancelled.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Register a handler for canonical events.
    fn on_event(&mut self, handler: EventHandler);

    /// Register a handler for source errors.
    fn on_error(&mut self, handler: ErrorHandler);
}
