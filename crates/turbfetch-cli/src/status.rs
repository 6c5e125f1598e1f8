use anyhow::Result;
use clap::Args;
use turbfetch_store::layout::DataRoot;
use turbfetch_store::registry::{RegistryFilter, SessionRegistry};
use turbfetch_store::session::open_session;
use turbfetch_store::{StateStore, StoreError};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Session id or unique prefix; omit to list registered sessions.
    session: Option<String>,

    /// Only list sessions whose id contains this text.
    #[arg(long)]
    hash: Option<String>,
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    variable: Option<String>,
    #[arg(long)]
    nx: Option<u32>,
    #[arg(long)]
    ny: Option<u32>,
    #[arg(long)]
    nz: Option<u32>,
    #[arg(long)]
    nt: Option<u32>,
}

pub fn status(root: &DataRoot, args: StatusArgs) -> Result<()> {
    match args.session {
        Some(id) => show(root, &id),
        None => list(
            root,
            &RegistryFilter {
                hash: args.hash,
                custom_tag: args.tag,
                dataset: args.dataset,
                variable: args.variable,
                nx: args.nx,
                ny: args.ny,
                nz: args.nz,
                nt: args.nt,
            },
        ),
    }
}

fn list(root: &DataRoot, filter: &RegistryFilter) -> Result<()> {
    let registry = SessionRegistry::load(&root.registry_path())?;
    if registry.is_empty() {
        println!("no sessions under {}", root.path().display());
        return Ok(());
    }
    let mut shown = 0usize;
    for (id, entry) in registry.filter(filter) {
        shown += 1;
        let [nx, ny, nz, nt] = entry.grid_points;
        let done = entry.completed.values().filter(|c| **c).count();
        println!(
            "{}  {}  {nx}x{ny}x{nz} nt={nt}  {}/{} variables complete{}",
            id.get(..12).unwrap_or(id),
            entry.dataset_title,
            done,
            entry.completed.len(),
            entry
                .custom_tag
                .as_deref()
                .map(|t| format!("  [{t}]"))
                .unwrap_or_default(),
        );
    }
    if shown == 0 {
        println!("no sessions match the filter ({} registered)", registry.len());
    }
    Ok(())
}

fn show(root: &DataRoot, id_or_prefix: &str) -> Result<()> {
    let session = open_session(root, id_or_prefix)?;
    let grid = &session.configs.grid_config;
    let total = grid.num_spatial_points();

    println!("session {}", session.id());
    println!("series  {}", session.layout.series_dir().display());
    println!(
        "grid    {} x {} x {} points, {} snapshots",
        grid.nx, grid.ny, grid.nz, grid.nt
    );
    for variable in session.variables() {
        let store = session.state_store(variable)?;
        let state = match store.load_state() {
            Ok(state) => state,
            Err(StoreError::StateNotFound(_)) => {
                println!("  {variable}: no state");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if state.flags.series_is_complete {
            println!("  {variable}: complete ({} of {} snapshots)", grid.nt, grid.nt);
            continue;
        }
        let passed = state.query_history.iter().filter(|p| **p).count();
        println!(
            "  {variable}: snapshot {} of {}, points {} of {}, query limit {:.0}, recent queries {}/{} passed",
            state.resume_temporal_index + 1,
            grid.nt,
            state.resume_volume_index.min(total),
            total,
            state.current_query_limit,
            passed,
            state.query_history.len(),
        );
    }
    Ok(())
}
