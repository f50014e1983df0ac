use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{error, info};

use diffscan::config::Config;
use diffscan::export::{self, ExportFormat};
use diffscan::shutdown::{install_signal_handler, Shutdown};
use diffscan::tasks::LogProgress;
use diffscan::{logging, DiffEngine, Error, PreprocessOptions, SecondPassOptions};

/// Exit code for a run stopped by an interrupt.
const INTERRUPTED_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Index,
    Preprocess,
    Compare,
    Run,
    Pairs,
    Clusters,
    Export,
    Prune,
    Requeue,
    Status,
}

impl Action {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "index" => Some(Action::Index),
            "preprocess" => Some(Action::Preprocess),
            "compare" => Some(Action::Compare),
            "run" => Some(Action::Run),
            "pairs" => Some(Action::Pairs),
            "clusters" => Some(Action::Clusters),
            "export" => Some(Action::Export),
            "prune" => Some(Action::Prune),
            "requeue" => Some(Action::Requeue),
            "status" => Some(Action::Status),
            _ => None,
        }
    }
}

struct Args {
    config_path: Option<PathBuf>,
    action: Action,
    threshold: Option<f64>,
    output: Option<PathBuf>,
    clusters: bool,
    verbose: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut action = None;
    let mut threshold = None;
    let mut output = None;
    let mut clusters = false;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("diffscan {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--threshold" | "-t" => match args.get(i + 1).and_then(|v| v.parse().ok()) {
                Some(value) => {
                    threshold = Some(value);
                    i += 1;
                }
                None => {
                    eprintln!("Error: --threshold requires a number");
                    std::process::exit(1);
                }
            },
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    output = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --output requires a path argument");
                    std::process::exit(1);
                }
            }
            "--clusters" => clusters = true,
            "--verbose" | "-v" => verbose = true,
            other => match Action::from_str(other) {
                Some(a) if action.is_none() => action = Some(a),
                _ => {
                    eprintln!("Unknown argument: {}", other);
                    print_help();
                    std::process::exit(1);
                }
            },
        }
        i += 1;
    }

    let Some(action) = action else {
        print_help();
        std::process::exit(1);
    };

    Args {
        config_path,
        action,
        threshold,
        output,
        clusters,
        verbose,
    }
}

fn print_help() {
    println!(
        r#"diffscan - resumable near-duplicate image finder

USAGE:
    diffscan [OPTIONS] <COMMAND>

COMMANDS:
    index        Index dir_a (and dir_b) into the store
    preprocess   Fingerprint every pending image
    compare      Compare all pairs of preprocessed images
    run          index, preprocess and compare in one go
    pairs        Print matched pairs
    clusters     Print groups of duplicates
    export       Write matched pairs (or --clusters) to --output
    prune        Delete computed pairs above the threshold
    requeue      Move failed images back to pending
    status       Print store counts and recent runs

OPTIONS:
    --config, -c PATH      Path to config file
    --threshold, -t N      Score threshold (default: compare.diff_threshold)
    --output, -o PATH      Export destination (.csv or .json)
    --clusters             Export duplicate groups instead of pairs
    --verbose, -v          Also log to stderr
    --version, -V          Show version
    --help, -h             Show this help message

ENVIRONMENT:
    DIFFSCAN_CONFIG     Path to config file (overrides default location)
    DIFFSCAN_LOG        Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/diffscan/config.toml

Interrupt once to drain in-flight work, twice to exit immediately."#
    );
}

fn main() {
    let args = parse_args();

    if let Err(e) = logging::init(Some(Config::config_dir().join("logs")), args.verbose) {
        eprintln!("Warning: logging unavailable: {}", e);
    }

    match run(&args) {
        Ok(()) => {}
        Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::Interrupted)) => {
            info!("Stopped by interrupt; rerun to resume");
            eprintln!("Interrupted. Progress is saved; rerun the same command to resume.");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "diffscan failed");
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = match &args.config_path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::load().context("Failed to load config")?,
    };
    let threshold = args.threshold.unwrap_or(config.compare.diff_threshold);

    let shutdown = Shutdown::new();
    install_signal_handler(shutdown.clone()).context("Failed to install interrupt handler")?;

    let engine = DiffEngine::open(config, shutdown)
        .context("Failed to open store")?;
    info!(db = %engine.config().db_path.display(), "Store opened");

    match args.action {
        Action::Index => index(&engine)?,
        Action::Preprocess => preprocess(&engine)?,
        Action::Compare => compare(&engine)?,
        Action::Run => {
            index(&engine)?;
            preprocess(&engine)?;
            compare(&engine)?;
        }
        Action::Pairs => {
            for pair in engine.iterate_pairs_below(threshold, None) {
                let pair = pair?;
                println!(
                    "{:>10.3}  {}  {}{}",
                    pair.dif,
                    pair.path_a.display(),
                    pair.path_b.display(),
                    if pair.by_hash { "  (hash)" } else { "" }
                );
            }
        }
        Action::Clusters => {
            for group in engine.clusters(threshold)? {
                println!(
                    "group {} ({} images, best {:.3}, {} hash matches)",
                    group.id,
                    group.members.len(),
                    group.best_dif,
                    group.hash_matches
                );
                for member in &group.members {
                    println!("    {}", member.path.display());
                }
            }
        }
        Action::Export => {
            let Some(output) = &args.output else {
                bail!("export needs --output PATH");
            };
            let format = ExportFormat::from_path(output)?;
            let count = if args.clusters {
                export::export_clusters(engine.db(), threshold, output, format)?
            } else {
                export::export_pairs(engine.db(), threshold, output, format)?
            };
            println!("Wrote {} {} to {}", count, if args.clusters { "groups" } else { "pairs" }, output.display());
        }
        Action::Prune => {
            let deleted = engine.prune(threshold)?;
            println!("Deleted {} pairs scoring above {}", deleted, threshold);
        }
        Action::Requeue => {
            let (images, pairs) = engine.requeue_failed()?;
            println!("Requeued {} images and {} failed pairs", images, pairs);
        }
        Action::Status => {
            let status = engine.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            for run in engine.recent_runs(5)? {
                println!(
                    "run {:>4}  {:<10} {:<11} {} -> {}  processed {} failed {}",
                    run.id,
                    run.phase.as_str(),
                    run.status.as_str(),
                    run.started_at,
                    run.finished_at.as_deref().unwrap_or("-"),
                    run.processed,
                    run.failed
                );
            }
        }
    }

    Ok(())
}

fn index(engine: &DiffEngine) -> Result<()> {
    let summary = engine.index().context("Indexing failed")?;
    if summary.skipped {
        println!("Store already indexed ({} + {} images)", summary.found_a, summary.found_b);
    } else {
        println!("Indexed {} images", summary.inserted);
    }
    Ok(())
}

fn preprocess(engine: &DiffEngine) -> Result<()> {
    let options = PreprocessOptions::from_config(engine.config());
    let summary = engine.run_preprocessing(options, &mut LogProgress::default())?;
    println!("Preprocessed {} images, {} failed", summary.done, summary.failed);
    Ok(())
}

fn compare(engine: &DiffEngine) -> Result<()> {
    let options = SecondPassOptions::from_config(engine.config());
    let summary = engine.run_second_pass(options, &mut LogProgress::default())?;
    println!(
        "Compared {} pairs ({} failed, {} same hash, {} aspect mismatch)",
        summary.compared, summary.failed, summary.skipped_hash, summary.skipped_aspect
    );
    Ok(())
}
