use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use ringmaster::cli::{Cli, Command, render_config_human, render_config_json};
use ringmaster::client::{Commander, ControlClient};
use ringmaster::config::ProjectConfig;
use ringmaster::daemon::Daemon;
use ringmaster::protocol::is_error;

/// Load `--config` if given, otherwise search upward from the current directory.
fn load_config(explicit: Option<&Path>) -> Result<(ProjectConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let config = ProjectConfig::load_file(path)?;
        return Ok((config, Some(path.to_path_buf())));
    }
    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    ProjectConfig::load(&cwd)
}

/// Relative audit log paths are relative to the project root, the directory
/// holding `.ringmaster/`.
fn resolve_audit_log(config: &mut ProjectConfig, config_path: Option<&Path>) {
    let Some(audit_log) = config.flapping.audit_log.as_mut() else {
        return;
    };
    if audit_log.is_absolute() {
        return;
    }
    let root = config_path
        .and_then(Path::parent)
        .filter(|dir| dir.ends_with(".ringmaster"))
        .and_then(Path::parent);
    if let Some(root) = root {
        *audit_log = root.join(&*audit_log);
    }
}

fn run_daemon(mut config: ProjectConfig, config_path: Option<&Path>) -> Result<()> {
    resolve_audit_log(&mut config, config_path);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::Release);
    })
    .context("failed to install the interrupt handler")?;

    let daemon = Daemon::bind(&config, stop)?;
    info!(
        control = %daemon.control_addr(),
        pubsub = %daemon.pubsub_addr(),
        shows = config.shows.len(),
        "ringmaster running"
    );
    daemon.run()
}

/// Returns whether the reply was a success.
fn run_ctl(words: &[String], endpoint: &str, timeout: f64) -> Result<bool> {
    let command = words.join(" ");
    let timeout = Duration::try_from_secs_f64(timeout).context("--timeout must be a non-negative number")?;
    let client = ControlClient::new(endpoint).with_timeout(timeout);
    let reply = client
        .call(&command)
        .with_context(|| format!("command '{command}' failed"))?;

    if is_error(&reply) {
        eprintln!("{reply}");
        Ok(false)
    } else {
        println!("{reply}");
        Ok(true)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet = matches!(&cli.command, Command::Config { .. } | Command::Ctl { .. });

    let filter = match cli.verbose {
        0 if quiet => "ringmaster=warn",
        0 => "ringmaster=info",
        1 => "ringmaster=debug",
        _ => "ringmaster=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let (config, config_path) = load_config(cli.config.as_deref())?;
    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .ringmaster/config.toml found, using defaults"),
    }

    match cli.command {
        Command::Daemon => run_daemon(config, config_path.as_deref())?,
        Command::Ctl {
            words,
            endpoint,
            timeout,
        } => {
            let endpoint = endpoint.unwrap_or_else(|| config.controller.endpoint.clone());
            if !run_ctl(&words, &endpoint, timeout)? {
                std::process::exit(1);
            }
        }
        Command::Config { json } => {
            if config.shows.is_empty() && config_path.is_some() {
                warn!("config file defines no shows");
            }
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
    }

    Ok(())
}
