//! Subcommands built on the monitor's typed helpers.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hvmon::{CancellationToken, Monitor};

/// Arguments for `hvmon events`.
#[derive(clap::Args)]
pub struct EventsArgs {
    /// Exit after this many events.
    #[arg(long, short = 'n')]
    count: Option<usize>,

    /// Only print events with this name.
    #[arg(long)]
    name: Option<String>,
}

pub async fn events(mon: &Monitor, args: EventsArgs) -> Result<()> {
    let stream = mon.events();
    let mut seen = 0;

    while args.count.is_none_or(|n| seen < n) {
        let Some(ev) = stream.recv().await else {
            tracing::debug!("event stream ended");
            break;
        };
        if args.name.as_ref().is_some_and(|n| *n != ev.event) {
            continue;
        }
        println!("{}", serde_json::to_string(&ev)?);
        seen += 1;
    }
    Ok(())
}

/// Arguments for `hvmon send-file`.
#[derive(clap::Args)]
pub struct SendFileArgs {
    /// Name to register the descriptor under.
    name: String,

    /// File to open.
    path: PathBuf,

    /// Add to a new fd set instead of the monitor's fd table.
    #[arg(long)]
    fdset: bool,

    /// Open read-only (fd sets only).
    #[arg(long, requires = "fdset")]
    readonly: bool,
}

pub async fn send_file(mon: &Monitor, args: SendFileArgs) -> Result<()> {
    let file = open(&args.path, args.readonly)?;

    if args.fdset {
        let info = mon
            .send_file_with_fdset(&args.name, &file, args.readonly)
            .await
            .with_context(|| format!("adding {} to an fd set", args.name))?;
        println!("fdset {} fd {}", info.fdset_id, info.fd);
    } else {
        mon.send_file(&args.name, &file)
            .await
            .with_context(|| format!("sending {}", args.name))?;
    }
    Ok(())
}

fn open(path: &Path, readonly: bool) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(!readonly)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

/// Arguments for `hvmon migrate-incoming`.
#[derive(clap::Args)]
pub struct IncomingArgs {
    /// Name of a descriptor registered with `send-file`.
    fd_name: String,

    /// Give up after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

pub async fn migrate_incoming(mon: &Monitor, args: IncomingArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    if let Some(secs) = args.timeout_secs {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            cancel.cancel();
        });
    }

    mon.migrate_incoming(&cancel, &args.fd_name)
        .await
        .with_context(|| format!("receiving migration over {}", args.fd_name))
}

/// Kind of object for `hvmon remove`.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum Kind {
    /// Frontend device (`device_del`).
    Device,
    /// Character device (`chardev-remove`).
    Chardev,
    /// Network backend (`netdev_del`).
    Nic,
    /// Block node (`blockdev-del`).
    Blockdev,
}

pub async fn remove(mon: &Monitor, kind: Kind, id: &str) -> Result<()> {
    match kind {
        Kind::Device => mon.remove_device(id).await,
        Kind::Chardev => mon.remove_char_device(id).await,
        Kind::Nic => mon.remove_nic(id).await,
        Kind::Blockdev => mon.remove_block_device(id).await,
    }
    .with_context(|| format!("removing {kind:?} {id}"))
}
