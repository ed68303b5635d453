use anyhow::Context;
use clap::{Parser, Subcommand};
use common::SourceLanguage;
use prospector::{Engine, EngineConfig, FileFacts};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::{DirEntry, WalkDir};

/// Directories never worth scanning.
const SKIP_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".venv",
    "venv",
    "__pycache__",
    "node_modules",
    "dist",
    "build",
    "target",
];

#[derive(Parser)]
#[command(name = "prospector")]
#[command(about = "Structural feature detection for Python and TypeScript codebases", long_about = None)]
struct Cli {
    /// Engine config file (default: $PROSPECTOR_CONFIG, then ./prospector.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Pretty-print JSON output.
    #[arg(long, global = true)]
    pretty: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect catalog features and data models in every supported file under a path.
    Scan {
        /// Project root or single file.
        path: PathBuf,
    },
    /// Detect the package manager of a directory.
    Manager {
        /// Directory holding the manifest files.
        dir: PathBuf,
        /// python or typescript.
        #[arg(long, default_value = "python")]
        language: String,
        /// Repository root `dir` is relative to.
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Print the structural outline of one file, functions in call order.
    Outline {
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: .env: {}", e);
        }
    }

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = EngineConfig::resolve(cli.config.as_deref()).context("loading config")?;
    let engine = Engine::new(config).context("initializing engine")?;

    match &cli.command {
        Commands::Scan { path } => cmd_scan(&engine, path, cli.pretty),
        Commands::Manager {
            dir,
            language,
            root,
        } => cmd_manager(&engine, dir, language, root, cli.pretty),
        Commands::Outline { file } => cmd_outline(&engine, file, cli.pretty),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<()> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{out}");
    Ok(())
}

// ---------------------------------------------------------------------------
// scan
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Failure {
    path: String,
    error: String,
}

#[derive(Serialize)]
struct ScanReport {
    root: String,
    files: Vec<FileFacts>,
    failures: Vec<Failure>,
}

fn cmd_scan(engine: &Engine, path: &Path, pretty: bool) -> anyhow::Result<()> {
    let root = dunce::canonicalize(path)
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    let files = collect_source_files(&root);
    info!(root = %root.display(), files = files.len(), "scanning");

    let base = if root.is_file() {
        root.parent().unwrap_or(&root).to_path_buf()
    } else {
        root.clone()
    };

    let mut report = ScanReport {
        root: root.display().to_string(),
        files: Vec::new(),
        failures: Vec::new(),
    };
    for (file, result) in engine.analyze_files(&files)? {
        let relative = relative_path(&file, &base);
        match result {
            Ok(mut facts) => {
                facts.path = PathBuf::from(&relative);
                report.files.push(facts);
            }
            Err(e) => {
                if e.is_fatal() {
                    warn!(path = %relative, error = %e, "configuration error");
                } else {
                    warn!(path = %relative, error = %e, "file skipped");
                }
                report.failures.push(Failure {
                    path: relative,
                    error: e.to_string(),
                });
            }
        }
    }

    print_json(&report, pretty)
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name))
}

fn collect_source_files(root: &Path) -> Vec<PathBuf> {
    if root.is_file() {
        return vec![root.to_path_buf()];
    }
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && SourceLanguage::from_path(e.path()).is_some())
        .map(|e| e.into_path())
        .collect()
}

fn relative_path(path: &Path, base: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    dunce::simplified(relative)
        .to_string_lossy()
        .replace('\\', "/")
}

// ---------------------------------------------------------------------------
// manager
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ManagerReport<'a> {
    directory: String,
    language: SourceLanguage,
    manager: Option<&'a str>,
}

fn cmd_manager(
    engine: &Engine,
    dir: &Path,
    language: &str,
    root: &Path,
    pretty: bool,
) -> anyhow::Result<()> {
    let language = SourceLanguage::from_name(language)
        .with_context(|| format!("unsupported language '{language}'"))?;
    let listing = list_directory(&root.join(dir))?;
    let manager = engine.detect_manager(language, dir, &listing, root);
    if manager.is_none() {
        warn!(dir = %dir.display(), "package manager auto-detection failed");
    }
    print_json(
        &ManagerReport {
            directory: dir.display().to_string(),
            language,
            manager,
        },
        pretty,
    )
}

fn list_directory(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("cannot list {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

// ---------------------------------------------------------------------------
// outline
// ---------------------------------------------------------------------------

fn cmd_outline(engine: &Engine, file: &Path, pretty: bool) -> anyhow::Result<()> {
    let facts = engine
        .analyze_file(file)
        .with_context(|| format!("analyzing {}", file.display()))?;
    print_json(&facts.signature, pretty)
}
