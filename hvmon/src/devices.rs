//! Device teardown and character device reads.
//!
//! Removals are idempotent: an empty id is a no-op and a device the monitor
//! no longer knows about counts as removed.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::monitor::Monitor;

/// Bytes requested per `ringbuf-read`.
const RINGBUF_CHUNK: usize = 10_000;

/// One entry of `query-chardev`.
#[derive(Debug, Deserialize)]
struct CharDevice {
    /// Device id.
    label: String,
    /// Backend description, `ringbuf` for ring buffers.
    #[serde(default)]
    filename: String,
}

impl Monitor {
    /// Unplugs the device `id` (`device_del`).
    pub async fn remove_device(&self, id: &str) -> Result<()> {
        self.remove("device_del", "id", id).await
    }

    /// Removes the character device `id` (`chardev-remove`).
    pub async fn remove_char_device(&self, id: &str) -> Result<()> {
        self.remove("chardev-remove", "id", id).await
    }

    /// Removes the network backend `id` (`netdev_del`). Not every NIC has
    /// one, so a missing backend is fine.
    pub async fn remove_nic(&self, id: &str) -> Result<()> {
        self.remove("netdev_del", "id", id).await
    }

    /// Removes the block node `node_name` (`blockdev-del`).
    pub async fn remove_block_device(&self, node_name: &str) -> Result<()> {
        self.remove("blockdev-del", "node-name", node_name).await
    }

    /// Runs a removal, treating "not found" as done.
    async fn remove(&self, command: &str, key: &str, id: &str) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }
        match self.run(command, json!({ key: id })).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!(command, id, "already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drains the ring buffer character device `device` and returns its
    /// contents.
    pub async fn ringbuf_read(&self, device: &str) -> Result<String> {
        let chardevs: Vec<CharDevice> = self.query("query-chardev", ()).await?;
        let Some(dev) = chardevs.iter().find(|c| c.label == device) else {
            return Err(Error::NotFound(format!("character device {device}")));
        };
        if dev.filename != "ringbuf" {
            return Err(Error::NotRingbuf(device.to_owned()));
        }

        let args = json!({ "device": device, "size": RINGBUF_CHUNK });
        let mut out = String::new();
        loop {
            let chunk = self.run("ringbuf-read", &args).await?;
            match chunk {
                Value::String(s) if !s.is_empty() => out.push_str(&s),
                _ => break,
            }
        }
        Ok(out)
    }
}
