use anyhow::{Context, Result};
use clap::Parser;
use devrunner::models::{LogEntry, StatusChange};
use devrunner::{ConfigParser, Supervisor};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "devrunner")]
#[command(about = "Runs and supervises your local development processes")]
struct Args {
    /// Configuration file (defaults to ./devrunner.json, then the user config dir)
    #[arg(short, long, env = "DEVRUNNER_CONFIG")]
    config: Option<PathBuf>,

    /// Only start these processes (repeatable)
    #[arg(long)]
    only: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn print_entry(entry: &LogEntry) {
    let time = entry
        .timestamp
        .map(|ts| ts.format("%H:%M:%S").to_string())
        .unwrap_or_default();
    println!(
        "{} {:>10} | {:<7} {}",
        time,
        entry.process,
        entry.level.as_str(),
        entry.message
    );
}

fn print_status(change: &StatusChange) {
    match change.exit_code {
        Some(code) => println!("{:>19} | {} (exit {})", change.process, change.status, code),
        None => println!("{:>19} | {}", change.process, change.status),
    }
}

fn print_exception_summary(supervisor: &Supervisor) {
    let exceptions = supervisor.exceptions().list();
    if exceptions.is_empty() {
        println!("No exceptions recorded.");
        return;
    }
    println!("Exceptions ({}):", exceptions.len());
    for record in exceptions {
        let location = match (&record.file, record.line) {
            (Some(file), Some(line)) => format!(" at {}:{}", file, line),
            _ => String::new(),
        };
        println!(
            "  {:>4}x {}: {}{} [{}]",
            record.count, record.type_, record.message, location, record.fingerprint
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let path = match args.config {
        Some(path) => path,
        None => ConfigParser::discover()
            .context("no devrunner.json found in the working directory or config dir")?,
    };
    info!(path = %path.display(), "loading configuration");
    let config = ConfigParser::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    for name in &args.only {
        if !config.processes.iter().any(|p| &p.name == name) {
            anyhow::bail!("--only names unknown process {}", name);
        }
    }

    let supervisor = Supervisor::new(config).await?;
    let mut feed = supervisor.logs().subscribe();
    let mut statuses = supervisor.subscribe_status();

    for process in supervisor.start_all(&args.only).await {
        info!(process = %process.name, status = %process.status, pid = ?process.pid, "initial state");
    }

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                info!("shutdown signal received");
                break;
            }
            entry = feed.recv() => match entry {
                Some(entry) => print_entry(&entry),
                None => break,
            },
            change = statuses.recv() => match change {
                Ok(change) => print_status(&change),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "status feed lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    supervisor.logs().unsubscribe(feed.id());
    supervisor.shutdown().await;
    if supervisor.logs().dropped_count() > 0 {
        warn!(dropped = supervisor.logs().dropped_count(), "log entries dropped for slow output");
    }
    print_exception_summary(&supervisor);
    Ok(())
}
