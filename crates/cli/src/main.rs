//! `sentinel` CLI — command-line front end for the scanning and real-time
//! protection core. Thin: it loads config, constructs a `SentinelEngine`,
//! and maps subcommands onto its public methods.

use clap::{Parser, Subcommand};
use sentinel_core::policy::ScanPolicy;
use sentinel_core::sentinel::SentinelEngine;
use sentinel_core::{CompositeVerdict, Config};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sentinel", version, about = "Multi-engine malware scanning and real-time protection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file; falls back to built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a file or directory and stream events until the group drains.
    Scan {
        path: PathBuf,

        /// Scan the whole tree including archived/rarely-touched files.
        #[arg(long)]
        full: bool,
    },
    /// Cancel an in-flight scan group by id.
    Cancel { group_id: String },
    /// Start the real-time filesystem monitor over configured watched roots.
    MonitorStart,
    /// Stop the real-time filesystem monitor.
    MonitorStop,
    /// List quarantined files.
    QuarantineList,
    /// Restore a quarantined file to its original location.
    QuarantineRestore {
        id: Uuid,
        /// Overwrite the destination if something already exists there.
        #[arg(long)]
        overwrite: bool,
    },
    /// Permanently delete a quarantined file and its record.
    QuarantinePurge { id: Uuid },
    /// Run the external definitions updater and re-warm every engine.
    UpdateDefinitions,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!(error = %e, "sentinel command failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), sentinel_core::ScanError> {
    let config = load_config(cli.config.as_deref())?;
    let scan_policy = config.scan_policy();
    let engine = SentinelEngine::new(config)?;

    match cli.command {
        Commands::Scan { path, full } => run_scan(&engine, path, full, cli.json, scan_policy),
        Commands::Cancel { group_id } => {
            let uuid = Uuid::parse_str(&group_id)
                .map_err(|e| sentinel_core::ScanError::PathInvalid(format!("invalid group id: {e}")))?;
            engine.cancel(&sentinel_core::ScanGroupId(uuid));
            Ok(())
        }
        Commands::MonitorStart => engine.monitor_start(),
        Commands::MonitorStop => {
            engine.monitor_stop();
            Ok(())
        }
        Commands::QuarantineList => {
            let records = engine.quarantine_list()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records).unwrap());
            } else {
                for record in &records {
                    println!(
                        "{}  {}  {}  restorable={}",
                        record.id, record.family, record.original_path.display(), record.can_restore
                    );
                }
            }
            Ok(())
        }
        Commands::QuarantineRestore { id, overwrite } => engine.quarantine_restore(id, overwrite),
        Commands::QuarantinePurge { id } => engine.quarantine_purge(id),
        Commands::UpdateDefinitions => engine.update_definitions(),
    }
}

fn run_scan(
    engine: &std::sync::Arc<SentinelEngine>,
    path: PathBuf,
    full: bool,
    json: bool,
    mut policy: ScanPolicy,
) -> Result<(), sentinel_core::ScanError> {
    if full {
        policy.mode = sentinel_core::ScanMode::Full;
    }

    let rx = engine.subscribe();
    let group = engine.scan(path, policy)?;

    loop {
        match rx.recv_timeout(Duration::from_secs(300)) {
            Ok(event) => {
                if !event_belongs_to(&event, &group) {
                    continue;
                }
                let done = matches!(event, sentinel_core::bus::Event::ScanCompleted { .. });
                print_event(&event, json);
                if done {
                    break;
                }
            }
            Err(_) => {
                eprintln!("warning: no scan events received for 300s, giving up on group {group}");
                break;
            }
        }
    }

    if let Some(summary) = engine.scan_summary(&group) {
        if json {
            println!("{}", serde_json::to_string_pretty(&summary).unwrap());
        } else {
            println!(
                "scanned {} files, {} clean, {} suspicious, {} malicious, {} skipped, {} errors in {}ms",
                summary.files_scanned,
                summary.clean,
                summary.suspicious,
                summary.malicious,
                summary.skipped,
                summary.errors.len(),
                summary.duration_ms,
            );
        }
        if summary.malicious > 0 {
            std::process::exit(2);
        }
    }
    Ok(())
}

fn event_belongs_to(event: &sentinel_core::bus::Event, group: &sentinel_core::ScanGroupId) -> bool {
    use sentinel_core::bus::Event;
    let target = group.to_string();
    match event {
        Event::ScanStarted { group: g }
        | Event::Progress { group: g, .. }
        | Event::FileScanned { group: g, .. }
        | Event::Detection { group: g, .. }
        | Event::ScanCompleted { group: g, .. } => *g == target,
        Event::Error { group: g, .. } => g.as_deref() == Some(target.as_str()),
        Event::MonitorDegraded { .. } | Event::SessionEstablished { .. } | Event::QuarantineChanged { .. } => false,
    }
}

fn print_event(event: &sentinel_core::bus::Event, json: bool) {
    use sentinel_core::bus::Event;
    if json {
        println!("{}", serde_json::to_string(event).unwrap());
        return;
    }
    match event {
        Event::ScanStarted { group } => println!("scan {group} started"),
        Event::Progress { scanned, total_estimate, .. } => match total_estimate {
            Some(total) => println!("progress: {scanned}/{total}"),
            None => println!("progress: {scanned} files scanned"),
        },
        Event::FileScanned { path, .. } => println!("scanned: {path}"),
        Event::Detection { path, verdict, .. } => match verdict {
            CompositeVerdict::Malicious { family, severity } => {
                println!("MALICIOUS  {path}  {family}  severity={severity:?}")
            }
            CompositeVerdict::Suspicious { score, tags } => {
                println!("SUSPICIOUS {path}  score={score}  tags={tags:?}")
            }
            other => println!("detection: {path}  {other:?}"),
        },
        Event::ScanCompleted { group, duration_ms } => println!("scan {group} completed in {duration_ms}ms"),
        Event::Error { kind, message, .. } => println!("error: {kind}: {message}"),
        Event::MonitorDegraded { reason } => println!("monitor degraded: {reason}"),
        Event::SessionEstablished { scope } => println!("session established: {scope:?}"),
        Event::QuarantineChanged { record_id } => println!("quarantine changed: {record_id}"),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config, sentinel_core::ScanError> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Config::from_toml_str(&text)
        }
        None => Ok(Config::default()),
    }
}
