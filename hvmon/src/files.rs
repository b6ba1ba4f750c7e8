//! Handing host file descriptors to the monitor.

use std::os::unix::io::AsFd;

use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::monitor::Monitor;

/// Result of `add-fd`: where the descriptor landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[non_exhaustive]
pub struct AddFdInfo {
    /// Fd set the descriptor was added to.
    #[serde(rename = "fdset-id")]
    pub fdset_id: i64,
    /// Descriptor number on the monitor's side.
    pub fd: i64,
}

/// One entry of `query-fdsets`.
#[derive(Debug, Deserialize)]
struct FdSet {
    /// Set id.
    #[serde(rename = "fdset-id")]
    id: i64,
    /// Members of the set.
    #[serde(default)]
    fds: Vec<FdSetMember>,
}

/// One descriptor inside an [`FdSet`].
#[derive(Debug, Deserialize)]
struct FdSetMember {
    /// Tag given when the descriptor was added, `<perm>:<name>`.
    #[serde(default)]
    opaque: String,
}

impl FdSetMember {
    /// Name part of the tag.
    fn name(&self) -> &str {
        self.opaque
            .split_once(':')
            .map_or(self.opaque.as_str(), |(_, name)| name)
    }
}

impl Monitor {
    /// Registers `file` in the monitor's fd table under `name` (`getfd`).
    pub async fn send_file(&self, name: &str, file: impl AsFd) -> Result<()> {
        let res = self
            .run_with_file("getfd", json!({ "fdname": name }), file)
            .await;
        self.check_send(res).await.map(drop)
    }

    /// Closes the descriptor registered as `name` (`closefd`).
    pub async fn close_file(&self, name: &str) -> Result<()> {
        self.run("closefd", json!({ "fdname": name })).await.map(drop)
    }

    /// Adds `file` to a fresh fd set, tagged with `name` (`add-fd`).
    pub async fn send_file_with_fdset(
        &self,
        name: &str,
        file: impl AsFd,
        readonly: bool,
    ) -> Result<AddFdInfo> {
        let perm = if readonly { "rdonly" } else { "rdwr" };
        let res = self
            .run_with_file("add-fd", json!({ "opaque": format!("{perm}:{name}") }), file)
            .await;
        let ret = self.check_send(res).await?;
        Ok(serde_json::from_value(ret)?)
    }

    /// Removes every fd set member tagged with `name`. Nothing matching is
    /// not an error.
    pub async fn remove_fd_from_fdset(&self, name: &str) -> Result<()> {
        let sets: Vec<FdSet> = self.query("query-fdsets", ()).await?;

        for set in &sets {
            for member in set.fds.iter().filter(|m| m.name() == name) {
                tracing::debug!(fdset = set.id, opaque = %member.opaque, "removing fd from fd set");
                self.run("remove-fd", json!({ "fdset-id": set.id })).await?;
            }
        }
        Ok(())
    }

    /// On a failed descriptor send, checks the monitor is still alive and
    /// reports that failure instead when it is not.
    async fn check_send(&self, res: Result<serde_json::Value>) -> Result<serde_json::Value> {
        let err = match res {
            Ok(ret) => return Ok(ret),
            Err(err) => err,
        };
        if matches!(err, Error::OobUnsupported | Error::Disconnected) {
            return Err(err);
        }
        match self.status().await {
            Ok(_) => Err(err),
            Err(ping) => {
                tracing::debug!(error = %err, "descriptor send failed and monitor is unreachable");
                Err(ping)
            }
        }
    }
}
