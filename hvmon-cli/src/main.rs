//! CLI for a hypervisor's JSON machine-control monitor.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod ops;
mod run;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use hvmon::Monitor;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "hvmon", version, about = "Talk to a hypervisor's machine-control monitor")]
struct Cli {
    /// Monitor socket path.
    #[arg(long, short = 's', env = "HVMON_SOCKET", global = true)]
    socket: Option<PathBuf>,

    /// Append a transcript of every frame to this file.
    #[arg(long, env = "HVMON_WIRE_LOG", global = true)]
    log: Option<PathBuf>,

    /// Interval between polls of long-running jobs, in milliseconds.
    #[arg(long, default_value_t = 1000, global = true)]
    interval_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a raw command and print its reply.
    Run(run::RunArgs),

    /// Print the run state of the machine.
    Status,

    /// Print events as they arrive, one JSON object per line.
    Events(ops::EventsArgs),

    /// Register a file with the monitor.
    SendFile(ops::SendFileArgs),

    /// Remove a file from every fd set it was added to.
    RemoveFile {
        /// Name the file was registered under.
        name: String,
    },

    /// Block until the outgoing migration reaches a state.
    MigrateWait {
        /// Target state, e.g. `completed` or `postmigrate`.
        #[arg(default_value = "completed")]
        state: String,
    },

    /// Receive a migration over a registered descriptor and wait for it.
    MigrateIncoming(ops::IncomingArgs),

    /// Block until a block job is ready to complete.
    BlockJobWait {
        /// Job id (device node name).
        job: String,
    },

    /// Remove a device, ignoring ones that are already gone.
    Remove {
        /// Kind of object.
        kind: ops::Kind,
        /// Object id.
        id: String,
    },

    /// Dump the contents of a ring buffer character device.
    Ringbuf {
        /// Character device id.
        device: String,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("hvmon: {e:#}");
        std::process::exit(1);
    }
}

/// Diagnostics to stderr, filtered by `HVMON_LOG` (default `warn`).
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("HVMON_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "hvmon", &mut std::io::stdout());
            return Ok(());
        }

        let mon = self.connect().await?;
        let res = self.command.exec(&mon).await;
        mon.disconnect().await;
        res
    }

    async fn connect(&self) -> Result<Monitor> {
        let socket = self
            .socket
            .as_ref()
            .context("no monitor socket given (use --socket or HVMON_SOCKET)")?;

        let mut builder = Monitor::builder().poll_interval(Duration::from_millis(self.interval_ms));
        if let Some(log) = &self.log {
            builder = builder.log_file(log);
        }
        builder
            .connect(socket)
            .await
            .with_context(|| format!("connecting to {}", socket.display()))
    }
}

impl Command {
    async fn exec(self, mon: &Monitor) -> Result<()> {
        match self {
            Self::Run(args) => args.run(mon).await,
            Self::Status => {
                println!("{}", mon.status().await?);
                Ok(())
            }
            Self::Events(args) => ops::events(mon, args).await,
            Self::SendFile(args) => ops::send_file(mon, args).await,
            Self::RemoveFile { name } => mon
                .remove_fd_from_fdset(&name)
                .await
                .with_context(|| format!("removing {name} from fd sets")),
            Self::MigrateWait { state } => mon
                .migrate_wait(&state)
                .await
                .with_context(|| format!("waiting for migration state {state}")),
            Self::MigrateIncoming(args) => ops::migrate_incoming(mon, args).await,
            Self::BlockJobWait { job } => mon
                .block_job_wait_ready(&job)
                .await
                .with_context(|| format!("waiting for block job {job}")),
            Self::Remove { kind, id } => ops::remove(mon, kind, &id).await,
            Self::Ringbuf { device } => {
                print!("{}", mon.ringbuf_read(&device).await?);
                Ok(())
            }
            Self::Completion { .. } => Ok(()),
        }
    }
}
