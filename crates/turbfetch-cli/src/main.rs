#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

mod run;
mod status;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use turbfetch_core::config::RuntimeConfig;
use turbfetch_core::types::{DatasetConstraints, GridConfig, QueryMethodConfig};
use turbfetch_runtime::grid::GridBuilder;
use turbfetch_store::config::{load_runtime_config, save_runtime_config};
use turbfetch_store::layout::DataRoot;
use turbfetch_store::session::{create_session, NewSession};

#[derive(Debug, Parser)]
#[command(name = "turbfetch", version, about = "Resumable retrieval of gridded turbulence data")]
struct Cli {
    /// Directory holding the runtime config, the session registry and all session data.
    #[arg(long, env = "TURBFETCH_ROOT", default_value = "./turbfetch-data", global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a session from dataset constraints, grid and query method documents.
    New(NewArgs),
    /// Run (or resume) the retrieval loop for one variable of a session.
    Run(run::RunArgs),
    /// List sessions, or show per-variable progress of one session.
    Status(status::StatusArgs),
    /// Inspect or replace the runtime config document.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Args)]
struct NewArgs {
    #[arg(long)]
    constraints: PathBuf,
    #[arg(long)]
    grid: PathBuf,
    #[arg(long)]
    method: PathBuf,
    /// Free-form label stored alongside the session.
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    /// Overwrite the document with defaults.
    Reset,
    /// Sanitize, validate and install a config document.
    Import { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    turbfetch_observe::logging::init_tracing();
    let cli = Cli::parse();
    let root = DataRoot::new(cli.root);
    std::fs::create_dir_all(root.path())
        .with_context(|| format!("create data root {}", root.path().display()))?;

    match cli.command {
        Command::New(args) => new_session(&root, args),
        Command::Run(args) => run::run(&root, args).await,
        Command::Status(args) => status::status(&root, args),
        Command::Config(cmd) => config(&root, cmd),
    }
}

fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

fn new_session(root: &DataRoot, args: NewArgs) -> Result<()> {
    let dataset_constraints: DatasetConstraints = read_document(&args.constraints)?;
    let grid_config: GridConfig = read_document(&args.grid)?;
    let query_method_config: QueryMethodConfig = read_document(&args.method)?;

    // Reject unbuildable grids before anything lands on disk.
    GridBuilder::new(&dataset_constraints, &grid_config)
        .build()
        .context("grid does not fit the dataset")?;

    let (runtime, _) = load_runtime_config(&root.runtime_config_path())?;
    let session = create_session(
        root,
        NewSession {
            dataset_constraints,
            query_method_config,
            grid_config,
            custom_tag: args.tag,
            starting_query_limit: runtime.tunable.starting_query_limit,
        },
    )?;

    println!("session {}", session.id());
    println!("series  {}", session.layout.series_dir().display());
    for variable in session.variables() {
        println!("  {variable}: {}", session.layout.state_path(variable)?.display());
    }
    Ok(())
}

fn config(root: &DataRoot, cmd: ConfigCommand) -> Result<()> {
    let path = root.runtime_config_path();
    match cmd {
        ConfigCommand::Show => {
            let (cfg, _) = load_runtime_config(&path)?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        ConfigCommand::Reset => {
            save_runtime_config(&path, &RuntimeConfig::default())?;
            tracing::info!(
                target: "turbfetch_cli",
                event = "runtime_config_reset",
                path = %path.display(),
                "runtime config reset to defaults"
            );
        }
        ConfigCommand::Import { file } => {
            // Missing keys fall back to defaults.
            let mut cfg: RuntimeConfig = read_document(&file)?;
            for c in cfg.sanitize() {
                tracing::warn!(
                    target: "turbfetch_cli",
                    event = "runtime_config_corrected",
                    field = c.field,
                    from = %c.from,
                    to = %c.to,
                    "imported value outside its absolute range"
                );
            }
            if let Err(errors) = cfg.validate() {
                let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
                anyhow::bail!("invalid runtime config: {}", joined.join("; "));
            }
            save_runtime_config(&path, &cfg)?;
            tracing::info!(
                target: "turbfetch_cli",
                event = "runtime_config_imported",
                path = %path.display(),
                source = %file.display(),
                "runtime config imported"
            );
        }
    }
    Ok(())
}
