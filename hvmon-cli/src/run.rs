//! `hvmon run`: send one raw command.
//!
//! Usage: `hvmon run [--args JSON] [--fd PATH] COMMAND`

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use hvmon::Monitor;
use serde_json::Value;

/// Arguments for `hvmon run`.
#[derive(clap::Args)]
pub struct RunArgs {
    /// Command name, e.g. `query-status`.
    command: String,

    /// Arguments as a JSON object.
    #[arg(long, short = 'a', value_parser = parse_json)]
    args: Option<Value>,

    /// Open this file and pass its descriptor along with the command.
    #[arg(long)]
    fd: Option<PathBuf>,
}

fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))
}

impl RunArgs {
    pub async fn run(self, mon: &Monitor) -> Result<()> {
        let args = self.args.unwrap_or(Value::Null);

        let ret = match &self.fd {
            Some(path) => {
                let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
                mon.run_with_file(&self.command, args, &file).await
            }
            None => mon.run(&self.command, args).await,
        }
        .with_context(|| format!("running {}", self.command))?;

        if !ret.is_null() {
            println!("{}", serde_json::to_string_pretty(&ret)?);
        }
        Ok(())
    }
}
