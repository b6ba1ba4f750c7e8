//! The connection handle and its command executor.

use std::os::unix::io::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hvmon_proto::Request;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DISCONNECTED, Dispatcher};
use crate::error::{Error, Result};
use crate::events::{EventStream, Listeners, SharedReceiver};
use crate::ids::IdGen;
use crate::log::{Entry, WireLog};
use crate::pending::Pending;
use crate::transport;

/// Default bound of the event queue.
const EVENT_CAPACITY: usize = 128;

/// Default interval between polls of long-running jobs.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for a [`Monitor`] connection.
///
/// ```no_run
/// # async fn demo() -> hvmon::Result<()> {
/// let mon = hvmon::Monitor::builder()
///     .log_file("/run/vm/qmp.log")
///     .event_capacity(256)
///     .connect("/run/vm/qmp.sock")
///     .await?;
/// println!("{}", mon.status().await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct MonitorBuilder {
    /// Wire Log destination.
    log_file: Option<PathBuf>,
    /// Event queue bound.
    event_capacity: usize,
    /// Interval of the polling helpers.
    poll_interval: Duration,
}

impl Default for MonitorBuilder {
    fn default() -> Self {
        Self {
            log_file: None,
            event_capacity: EVENT_CAPACITY,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl MonitorBuilder {
    /// Appends a transcript of every frame to `path`.
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Sets how many undelivered events may queue up before the read loop
    /// waits for a subscriber. Zero is treated as one.
    pub const fn event_capacity(mut self, n: usize) -> Self {
        self.event_capacity = n;
        self
    }

    /// Sets the interval used by [`Monitor::migrate_wait`] and friends.
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Connects to the monitor socket at `path` and performs the handshake.
    pub async fn connect(self, path: impl AsRef<Path>) -> Result<Monitor> {
        let stream = UnixStream::connect(path).await?;
        self.handshake(stream).await
    }

    /// Performs the handshake over an already connected stream.
    pub async fn handshake(self, stream: UnixStream) -> Result<Monitor> {
        let log = Arc::new(match &self.log_file {
            Some(path) => WireLog::open(path)?,
            None => WireLog::closed(),
        });

        let ids = IdGen::default();
        let conn = match transport::negotiate(stream, &ids, &log).await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = log.close();
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.event_capacity.max(1));
        let pending = Arc::new(Pending::default());
        let listeners = Arc::new(Listeners::default());
        let disconnected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher {
            reader: conn.reader,
            pending: Arc::clone(&pending),
            events: tx,
            listeners: Arc::clone(&listeners),
            log: Arc::clone(&log),
            disconnected: Arc::clone(&disconnected),
            shutdown: shutdown.clone(),
        };
        let reader = tokio::spawn(dispatcher.run());

        Ok(Monitor {
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(Some(conn.writer)),
                oob: conn.oob,
                ids,
                pending,
                events: Arc::new(tokio::sync::Mutex::new(rx)),
                listeners,
                log,
                disconnected,
                shutdown,
                reader: Mutex::new(Some(reader)),
                poll_interval: self.poll_interval,
            }),
        })
    }
}

/// Connection state shared by every clone of a [`Monitor`].
#[derive(Debug)]
struct Shared {
    /// Write half. Holding this lock is holding the right to have a command
    /// in flight. `None` after disconnect.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Whether the peer accepts descriptors as ancillary data.
    oob: bool,
    /// Request id source.
    ids: IdGen,
    /// Correlation table.
    pending: Arc<Pending>,
    /// Event queue, consumer side.
    events: SharedReceiver,
    /// Subscriber count.
    listeners: Arc<Listeners>,
    /// Wire transcript.
    log: Arc<WireLog>,
    /// Set by disconnect or when the read loop ends.
    disconnected: Arc<AtomicBool>,
    /// Stops the read loop.
    shutdown: CancellationToken,
    /// Read loop task.
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Interval of the polling helpers.
    poll_interval: Duration,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// An established monitor connection.
///
/// Cheap to clone; all clones share one socket. Commands are serialized:
/// at most one request is in flight, and concurrent callers queue on an
/// internal lock until the previous reply arrived.
#[derive(Debug, Clone)]
pub struct Monitor {
    /// Connection state.
    shared: Arc<Shared>,
}

impl Monitor {
    /// Returns a builder with default settings.
    pub fn builder() -> MonitorBuilder {
        MonitorBuilder::default()
    }

    /// Connects with default settings.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().connect(path).await
    }

    /// Whether the greeting advertised out-of-band descriptor passing.
    pub fn supports_oob(&self) -> bool {
        self.shared.oob
    }

    /// Whether the connection has been torn down, by either side.
    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    /// Interval the polling helpers sleep between queries.
    pub(crate) fn poll_interval(&self) -> Duration {
        self.shared.poll_interval
    }

    /// Runs `name` with `args` and returns the reply payload.
    ///
    /// Pass `()` or [`Value::Null`] for a command without arguments.
    pub async fn run(&self, name: &str, args: impl Serialize) -> Result<Value> {
        let request = Request::execute(name).with_arguments(serde_json::to_value(args)?);
        self.execute(request, None).await
    }

    /// Like [`run`](Self::run), passing `file` alongside the request.
    ///
    /// Fails with [`Error::OobUnsupported`] without touching the socket if
    /// the peer never advertised the capability.
    pub async fn run_with_file(
        &self,
        name: &str,
        args: impl Serialize,
        file: impl AsFd,
    ) -> Result<Value> {
        let request = Request::execute(name).with_arguments(serde_json::to_value(args)?);
        self.execute(request, Some(file.as_fd())).await
    }

    /// Runs `name` and decodes the reply payload as `T`.
    pub async fn query<T: DeserializeOwned>(&self, name: &str, args: impl Serialize) -> Result<T> {
        let ret = self.run(name, args).await?;
        Ok(serde_json::from_value(ret)?)
    }

    /// Sends `request` and waits for its reply.
    ///
    /// An id already set on `request` is kept; otherwise a fresh one is
    /// assigned. The exclusive lock is held until the reply arrives or the
    /// connection dies.
    pub async fn execute(
        &self,
        mut request: Request,
        file: Option<BorrowedFd<'_>>,
    ) -> Result<Value> {
        let s = &*self.shared;
        if s.disconnected.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        if file.is_some() && !s.oob {
            return Err(Error::OobUnsupported);
        }

        let mut writer = s.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(Error::Disconnected);
        };

        let id = *request.id.get_or_insert_with(|| s.ids.next());
        let slot = s.pending.register(id)?;
        let frame = hvmon_proto::encode(&request)?;
        if let Err(e) = s.log.record(Entry::Query, &frame) {
            tracing::debug!(error = %e, "failed to log query");
        }

        // Teardown interrupts a write the peer never drains.
        let written = tokio::select! {
            biased;
            () = s.shutdown.cancelled() => Err(Error::Closed(DISCONNECTED.to_owned())),
            r = transport::write_frame(w, &frame, file) => r.map_err(Error::from),
        };
        if let Err(e) = written {
            drop(slot);
            tracing::debug!(
                id = id.get(),
                command = request.name(),
                error = %e,
                "request write failed"
            );
            return Err(e);
        }

        let reply = slot.wait().await;
        drop(writer);
        Ok(reply?.into_result()?)
    }

    /// Subscribes to unsolicited events.
    ///
    /// Events that arrive while no stream is alive are logged and dropped.
    pub fn events(&self) -> EventStream {
        EventStream::subscribe(&self.shared.events, &self.shared.listeners)
    }

    /// Returns the run state reported by `query-status`, e.g. `running`.
    pub async fn status(&self) -> Result<String> {
        /// `query-status` payload.
        #[derive(Deserialize)]
        struct Status {
            /// Run state.
            status: String,
        }

        let st: Status = self.query("query-status", ()).await?;
        Ok(st.status)
    }

    /// Closes the connection and the Wire Log.
    ///
    /// Every call still waiting for a reply fails with [`Error::Closed`];
    /// later calls fail with [`Error::Disconnected`]. Safe to call twice.
    pub async fn disconnect(&self) {
        let s = &*self.shared;
        s.disconnected.store(true, Ordering::Release);
        s.listeners.reset();
        s.shutdown.cancel();

        // Waiters and blocked writers both watch the token, so the lock frees up.
        drop(s.writer.lock().await.take());

        let reader = s.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                tracing::warn!(error = %e, "monitor read loop panicked");
            }
        }

        if let Err(e) = s.log.close() {
            tracing::debug!(error = %e, "failed to close wire log");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;
    use std::num::NonZeroU32;

    use serde_json::json;

    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn status_round_trip() {
        let (mon, mut peer) = testing::connect(&["oob"]).await;
        assert!(mon.supports_oob());

        let (status, ()) = tokio::join!(mon.status(), async {
            let req = peer.recv().await;
            assert_eq!(req.name(), "query-status");
            assert_eq!(req.id.unwrap().get(), 2);
            peer.send_raw(r#"{"id":2,"return":{"status":"running"}}"#).await;
        });
        assert_eq!(status.unwrap(), "running");
    }

    #[tokio::test]
    async fn protocol_errors_are_not_transport_errors() {
        let (mon, mut peer) = testing::connect(&[]).await;

        let (res, ()) = tokio::join!(mon.run("device_del", json!({"id": "x"})), async {
            let req = peer.recv().await;
            peer.fail(req.id.unwrap().get(), "DeviceNotFound", "Device 'x' not found")
                .await;
        });
        let err = res.unwrap_err();
        assert!(!err.is_transport());
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn concurrent_callers_get_their_own_replies() {
        let (mon, mut peer) = testing::connect(&[]).await;

        let callers: Vec<_> = (0..16)
            .map(|n| {
                let mon = mon.clone();
                tokio::spawn(async move { (n, mon.run("echo", json!({"n": n})).await) })
            })
            .collect();

        let server = tokio::spawn(async move {
            let mut ids = HashSet::new();
            for _ in 0..16 {
                let req = peer.recv().await;
                let id = req.id.unwrap().get();
                assert!(ids.insert(id));
                // A stray reply for an id nobody waits on must not confuse anyone.
                peer.reply(id + 1000, json!("stray")).await;
                peer.reply(id, req.arguments.unwrap()).await;
            }
            peer
        });

        for caller in callers {
            let (n, res) = caller.await.unwrap();
            assert_eq!(res.unwrap(), json!({"n": n}));
        }
        let _peer = server.await.unwrap();
        assert_eq!(mon.shared.pending.len(), 0);
    }

    #[tokio::test]
    async fn pre_assigned_id_is_kept() {
        let (mon, mut peer) = testing::connect(&[]).await;
        let request = Request::execute("query-name").with_id(NonZeroU32::new(500).unwrap());

        let (res, ()) = tokio::join!(mon.execute(request, None), async {
            let req = peer.recv().await;
            assert_eq!(req.id.unwrap().get(), 500);
            peer.reply(500, json!({})).await;
        });
        assert_eq!(res.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn peer_exit_fails_the_waiter_and_later_calls() {
        let (mon, mut peer) = testing::connect(&[]).await;

        let (res, ()) = tokio::join!(mon.run("stop", ()), async {
            let _ = peer.recv().await;
            peer.hang_up();
        });
        let err = res.unwrap_err();
        assert!(matches!(err, Error::Closed(ref r) if r == "monitor has exited"));
        assert!(err.is_transport());
        assert_eq!(mon.shared.pending.len(), 0);

        assert!(mon.is_disconnected());
        assert!(matches!(mon.run("cont", ()).await, Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn disconnect_unblocks_a_waiting_caller() {
        let (mon, mut peer) = testing::connect(&[]).await;

        let waiter = {
            let mon = mon.clone();
            tokio::spawn(async move { mon.run("query-migrate", ()).await })
        };
        let _ = peer.recv().await;
        mon.disconnect().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        assert!(matches!(mon.status().await, Err(Error::Disconnected)));
        mon.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_interrupts_a_blocked_write() {
        let (mon, peer) = testing::connect(&[]).await;

        // The peer never reads, so this fills the socket buffer and stalls.
        let blob = "x".repeat(8 << 20);
        let writer = {
            let mon = mon.clone();
            tokio::spawn(async move { mon.run("echo", json!({ "blob": blob })).await })
        };
        // Queued behind the stalled writer on the lock.
        let queued = {
            let mon = mon.clone();
            tokio::spawn(async move { mon.run("query-status", ()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let bound = Duration::from_secs(3);
        assert!(tokio::time::timeout(bound, mon.disconnect()).await.is_ok());

        let err = tokio::time::timeout(bound, writer).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        let err = tokio::time::timeout(bound, queued).await.unwrap().unwrap().unwrap_err();
        assert!(err.is_transport());
        drop(peer);
    }

    #[tokio::test]
    async fn file_without_oob_fails_before_writing() {
        let (mon, mut peer) = testing::connect(&[]).await;
        let file = tempfile::tempfile().unwrap();

        let err = mon
            .run_with_file("getfd", json!({"fdname": "f"}), &file)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OobUnsupported));

        // Nothing reached the peer: the next frame it sees is the next call.
        let (res, ()) = tokio::join!(mon.run("query-status", ()), async {
            let req = peer.recv().await;
            assert_eq!(req.name(), "query-status");
            peer.reply(req.id.unwrap().get(), json!({})).await;
        });
        res.unwrap();
    }

    #[tokio::test]
    async fn file_with_oob_is_sent() {
        let (mon, mut peer) = testing::connect(&["oob"]).await;
        let file = tempfile::tempfile().unwrap();

        let (res, ()) = tokio::join!(
            mon.run_with_file("getfd", json!({"fdname": "disk0"}), &file),
            async {
                let req = peer.recv().await;
                assert_eq!(req.arguments, Some(json!({"fdname": "disk0"})));
                peer.reply(req.id.unwrap().get(), json!({})).await;
            }
        );
        res.unwrap();
    }

    #[tokio::test]
    async fn wire_log_records_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmp.log");
        let builder = Monitor::builder().log_file(&path);
        let (mon, mut peer) = testing::connect_with(builder, &[]).await;

        let (res, ()) = tokio::join!(mon.status(), async {
            peer.event("RESUME", json!({})).await;
            peer.answer("query-status", json!({"status": "paused"})).await;
        });
        assert_eq!(res.unwrap(), "paused");
        mon.disconnect().await;

        let log = std::fs::read_to_string(&path).unwrap();
        assert_eq!(log.matches("QUERY: ").count(), 2);
        assert_eq!(log.matches("REPLY: ").count(), 2);
        assert_eq!(log.matches("EVENT: ").count(), 1);
        assert!(log.contains(r#"QUERY: {"execute":"qmp_capabilities","id":1}"#));
    }

    #[tokio::test]
    async fn subscribers_see_events() {
        let (mon, mut peer) = testing::connect(&[]).await;
        let events = mon.events();

        peer.event("BLOCK_JOB_READY", json!({"device": "disk0"})).await;
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.event, "BLOCK_JOB_READY");
        assert_eq!(ev.data["device"], "disk0");
    }
}
