//! The read loop: one task per connection, routing every inbound frame.
//!
//! Events go to the shared event queue (only while someone listens),
//! replies go to the waiter registered under their id, and everything
//! else is dropped. When the stream ends, every waiter still in the
//! correlation table is failed so nobody blocks forever.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hvmon_proto::{Event, Frame, Reply};
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::Listeners;
use crate::log::{Entry, WireLog};
use crate::pending::Pending;

/// Teardown reason when the peer closes the stream.
const EXITED: &str = "monitor has exited";

/// Teardown reason when the client disconnects.
pub(crate) const DISCONNECTED: &str = "monitor disconnected";

/// State the read loop shares with the [`Monitor`](crate::Monitor).
#[derive(Debug)]
pub(crate) struct Dispatcher<R> {
    /// Read side of the connection, positioned after the handshake.
    pub(crate) reader: R,
    /// Correlation table.
    pub(crate) pending: Arc<Pending>,
    /// Producer side of the event queue.
    pub(crate) events: mpsc::Sender<Event>,
    /// Live subscriber count.
    pub(crate) listeners: Arc<Listeners>,
    /// Wire transcript.
    pub(crate) log: Arc<WireLog>,
    /// Set once the connection is unusable.
    pub(crate) disconnected: Arc<AtomicBool>,
    /// Fired by [`Monitor::disconnect`](crate::Monitor::disconnect).
    pub(crate) shutdown: CancellationToken,
}

impl<R: AsyncBufRead + Unpin> Dispatcher<R> {
    /// Runs until the stream ends, fails, or shutdown is requested.
    pub(crate) async fn run(mut self) {
        let mut line = Vec::new();

        let reason = loop {
            let read = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break DISCONNECTED.to_owned(),
                read = hvmon_proto::read_line(&mut self.reader, &mut line) => read,
            };
            match read {
                Ok(true) => {}
                Ok(false) => break EXITED.to_owned(),
                Err(e) => break e.to_string(),
            }

            match Frame::parse(&line) {
                Ok(Frame::Event(event)) => {
                    if !self.on_event(event, &line).await {
                        break DISCONNECTED.to_owned();
                    }
                }
                Ok(Frame::Reply(reply)) => self.on_reply(reply, &line),
                Err(e) => tracing::trace!(error = %e, "discarding malformed frame"),
            }
        };

        self.disconnected.store(true, Ordering::Release);
        let failed = self.pending.fail_all(&reason);
        tracing::debug!(%reason, failed, "monitor read loop exited");
    }

    /// Logs and (if anyone listens) queues an event. Returns `false` if
    /// shutdown was requested while waiting for queue space.
    async fn on_event(&self, event: Event, raw: &[u8]) -> bool {
        if let Err(e) = self.log.record(Entry::Event, raw) {
            tracing::debug!(error = %e, "failed to log event");
        }

        if self.listeners.count() == 0 {
            return true;
        }

        // A full queue stalls this loop until a subscriber catches up.
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => false,
            sent = self.events.send(event) => {
                if sent.is_err() {
                    tracing::trace!("event queue closed, dropping event");
                }
                true
            }
        }
    }

    /// Logs a reply and hands it to its waiter, if any.
    fn on_reply(&self, reply: Reply, raw: &[u8]) {
        if let Err(e) = self.log.record(Entry::Reply, raw) {
            tracing::debug!(error = %e, "failed to log reply");
        }

        let id = reply.id;
        if id == 0 {
            tracing::trace!("discarding reply without id");
        } else if !self.pending.deliver(reply) {
            tracing::trace!(id, "discarding unexpected reply");
        }
    }
}
