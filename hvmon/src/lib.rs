//! Async client for a hypervisor's JSON machine-control monitor.
//!
//! The monitor speaks newline-delimited JSON over a Unix stream socket. On
//! connect it sends a greeting, the client negotiates capabilities, and from
//! then on every request carries an id that its reply echoes. Unsolicited
//! events may arrive between replies at any time.
//!
//! A [`Monitor`] owns one such connection. A background task reads every
//! inbound frame, hands replies to the caller waiting on their id, and
//! queues events for [`EventStream`] subscribers. Commands are serialized:
//! one request is in flight at a time.
//!
//! # Quick start
//!
//! ```no_run
//! # async fn demo() -> hvmon::Result<()> {
//! use serde_json::json;
//!
//! let mon = hvmon::Monitor::connect("/run/vm/qmp.sock").await?;
//! assert_eq!(mon.status().await?, "running");
//!
//! mon.run("device_del", json!({ "id": "nic0" })).await?;
//! mon.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! # File descriptors
//!
//! If the greeting advertises `oob`, a descriptor can ride along with a
//! request as `SCM_RIGHTS` ancillary data, see [`Monitor::run_with_file`]
//! and [`Monitor::send_file`].

#[cfg(unix)]
mod devices;
#[cfg(unix)]
mod dispatch;
mod error;
mod events;
#[cfg(unix)]
mod files;
#[cfg(unix)]
mod ids;
#[cfg(unix)]
mod jobs;
mod log;
#[cfg(unix)]
mod monitor;
#[cfg(unix)]
mod pending;
#[cfg(all(test, unix))]
mod testing;
#[cfg(unix)]
mod transport;

pub use error::{Error, Result};
pub use events::EventStream;
#[cfg(unix)]
pub use files::AddFdInfo;
pub use hvmon_proto::{ErrorInfo, Event, Request, Timestamp};
pub use log::WireLog;
#[cfg(unix)]
pub use monitor::{Monitor, MonitorBuilder};
pub use tokio_util::sync::CancellationToken;
