//! Migration and block jobs: starting them and polling them to a terminal
//! state.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::monitor::Monitor;

/// Migration state reported while the stream is broken.
const MIGRATION_FAILED: &str = "failed";

/// Migration state the incoming side waits for.
const MIGRATION_COMPLETED: &str = "completed";

/// `query-migrate` payload.
#[derive(Debug, Deserialize)]
struct MigrationInfo {
    /// Current state; absent before any migration ran.
    #[serde(default)]
    status: String,
}

/// One entry of `query-block-jobs`.
#[derive(Debug, Deserialize)]
struct BlockJob {
    /// Job id (the device node name for jobs started here).
    #[serde(default)]
    device: String,
    /// Whether the job can be completed.
    #[serde(default)]
    ready: bool,
    /// Error message, if the job failed.
    #[serde(default)]
    error: Option<String>,
}

/// Migration channel pointing at the descriptor registered as `fd_name`.
fn channels(fd_name: &str) -> Value {
    json!({
        "channels": [{
            "channel-type": "main",
            "addr": { "transport": "socket", "type": "fd", "str": fd_name },
        }]
    })
}

impl Monitor {
    /// Starts an outgoing migration over the descriptor registered as
    /// `fd_name` (see [`send_file`](Self::send_file)).
    pub async fn migrate(&self, fd_name: &str) -> Result<()> {
        self.run("migrate", channels(fd_name)).await.map(drop)
    }

    /// Enables or disables migration capabilities.
    pub async fn migrate_set_capabilities(&self, caps: &BTreeMap<String, bool>) -> Result<()> {
        let caps: Vec<_> = caps
            .iter()
            .map(|(capability, state)| json!({ "capability": capability, "state": state }))
            .collect();
        self.run("migrate-set-capabilities", json!({ "capabilities": caps }))
            .await
            .map(drop)
    }

    /// Resumes a migration paused in `state`.
    pub async fn migrate_continue(&self, state: &str) -> Result<()> {
        self.run("migrate-continue", json!({ "state": state }))
            .await
            .map(drop)
    }

    /// Polls `query-migrate` until the migration reaches `state`.
    ///
    /// Fails with [`Error::MigrationFailed`] if it fails first.
    pub async fn migrate_wait(&self, state: &str) -> Result<()> {
        loop {
            let info: MigrationInfo = self.query("query-migrate", ()).await?;
            if info.status == MIGRATION_FAILED {
                return Err(Error::MigrationFailed);
            }
            if info.status == state {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Starts receiving a migration over the descriptor registered as
    /// `fd_name` and waits for it to complete.
    ///
    /// `cancel` is only consulted after each status check, so a migration
    /// that completed just as the caller gave up still reports success.
    pub async fn migrate_incoming(&self, cancel: &CancellationToken, fd_name: &str) -> Result<()> {
        self.run("migrate-incoming", channels(fd_name)).await?;

        loop {
            let info: MigrationInfo = self.query("query-migrate", ()).await?;
            match info.status.as_str() {
                MIGRATION_FAILED => return Err(Error::MigrationFailed),
                MIGRATION_COMPLETED => return Ok(()),
                _ => {}
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
    }

    /// Polls `query-block-jobs` until `job` is ready to complete.
    pub async fn block_job_wait_ready(&self, job: &str) -> Result<()> {
        loop {
            let jobs: Vec<BlockJob> = self.query("query-block-jobs", ()).await?;
            let Some(found) = jobs.into_iter().find(|j| j.device == job) else {
                return Err(Error::NotFound(format!("block job {job}")));
            };
            if let Some(e) = found.error.filter(|e| !e.is_empty()) {
                return Err(Error::BlockJobFailed(e));
            }
            if found.ready {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Merges `device` (usually a snapshot) into its backing node.
    ///
    /// Starts the commit, waits for it to become ready and completes it.
    pub async fn block_commit(&self, device: &str) -> Result<()> {
        self.run("block-commit", json!({ "device": device, "job-id": device }))
            .await?;
        self.block_job_wait_ready(device).await?;
        self.block_job_complete(device).await
    }

    /// Mirrors the top layer of `device` onto `target` and waits until the
    /// two are in sync. The job keeps running until completed or cancelled.
    pub async fn blockdev_mirror(&self, device: &str, target: &str) -> Result<()> {
        let args = json!({
            "device": device,
            "target": target,
            "sync": "top",
            "job-id": device,
            "copy-mode": "write-blocking",
        });
        self.run("blockdev-mirror", args).await?;
        self.block_job_wait_ready(device).await
    }

    /// Cancels the block job on `device`.
    pub async fn block_job_cancel(&self, device: &str) -> Result<()> {
        self.run("block-job-cancel", json!({ "device": device }))
            .await
            .map(drop)
    }

    /// Completes the ready block job on `device`.
    pub async fn block_job_complete(&self, device: &str) -> Result<()> {
        self.run("block-job-complete", json!({ "device": device }))
            .await
            .map(drop)
    }
}
