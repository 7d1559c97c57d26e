use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::ProjectConfig;

#[derive(Parser, Debug)]
#[command(
    name = "ringmaster",
    about = "Process supervisor with a remote control plane and flapping detection",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file to use instead of searching for .ringmaster/config.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the supervisor in the foreground
    Daemon,

    /// Send one command to a running supervisor and print the reply
    Ctl {
        /// Command words, e.g. `set web numprocesses 3`
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,

        /// Controller endpoint (defaults to the configured one)
        #[arg(long)]
        endpoint: Option<String>,

        /// Seconds to wait for the reply
        #[arg(long, default_value = "5")]
        timeout: f64,
    },

    /// Show the effective configuration
    Config {
        /// Emit JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .ringmaster/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

/// Summary printed by `ringmaster config`.
pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Controller\n");
    push_kv(&mut output, "endpoint", &config.controller.endpoint);
    push_kv(&mut output, "timeout", format!("{}ms", config.controller.timeout_millis));
    output.push('\n');

    output.push_str("Pub/Sub\n");
    push_kv(&mut output, "endpoint", &config.pubsub.endpoint);
    output.push('\n');

    output.push_str("Flapping\n");
    push_kv(&mut output, "enabled", config.flapping.enabled);
    push_kv(&mut output, "check_delay", format!("{}s", config.flapping.check_delay_secs));
    push_kv(&mut output, "call_timeout", format!("{}s", config.flapping.call_timeout_secs));
    push_kv(
        &mut output,
        "audit_log",
        config
            .flapping
            .audit_log
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string()),
    );
    output.push('\n');

    output.push_str("Shows\n");
    if config.shows.is_empty() {
        push_kv(&mut output, "entries", "(none)");
    }
    for show in &config.shows {
        let options = &show.options;
        output.push_str(&format!(
            "  - {} x{}: {} (times={} within={}s retry_in={}s max_retry={})\n",
            show.name,
            options.numprocesses,
            options.cmd,
            options.times,
            options.within,
            options.retry_in,
            options.max_retry
        ));
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

/// JSON printed by `ringmaster config --json`.
pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["source_path"] = serde_json::Value::String(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
