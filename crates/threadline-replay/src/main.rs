use clap::Parser;
use std::path::PathBuf;
use threadline_reconcile::ReconcileConfig;
use threadline_replay::{load_script, run_script};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "threadline-replay")]
struct Args {
    /// Recorded script of snapshots and notifications.
    script: PathBuf,

    #[arg(long, env = "THREADLINE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    pretty: bool,
}

fn load_config(path: Option<&PathBuf>) -> ReconcileConfig {
    let Some(path) = path else {
        return ReconcileConfig::default();
    };
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("failed to read config {}: {e}", path.display());
            std::process::exit(2);
        }
    };
    match serde_json::from_str::<ReconcileConfig>(&raw) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to parse config (JSON): {e}");
            std::process::exit(2);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref());

    let report = match load_script(&args.script).and_then(|script| run_script(&script, config)) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let rendered = if args.pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    };
    match rendered {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("failed to render report: {e}");
            std::process::exit(1);
        }
    }
}
