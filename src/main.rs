//! `search-sync` binary.
//!
//! ```text
//! search-sync --config sync.toml run                 # poller + both worker pools
//! search-sync --config sync.toml run --role worker   # workers only
//! search-sync migrate                                # create the users table
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use search_sync::pipeline::init_tracing;
use search_sync::storage::sql::PgStore;
use search_sync::{Backends, Role, SearchSyncConfig, SyncRuntime};

#[derive(Parser)]
#[command(name = "search-sync")]
#[command(about = "Sync the users table from PostgreSQL into Meilisearch")]
struct Args {
    /// TOML config file. SEARCH_SYNC_* environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline until SIGINT/SIGTERM
    Run {
        #[arg(long, value_enum, default_value_t = RoleArg::All)]
        role: RoleArg,
    },
    /// Create the users table and its indexes if missing
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    All,
    Scheduler,
    Worker,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::All => Role::All,
            RoleArg::Scheduler => Role::Scheduler,
            RoleArg::Worker => Role::Worker,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = SearchSyncConfig::load(args.config.as_deref())?;
    init_tracing(&config);

    match args.command {
        Command::Migrate => {
            let store = PgStore::new(&config.database_url).await?;
            store.init_schema().await?;
            info!("Schema ready");
        }
        Command::Run { role } => {
            info!(env = %config.app_env, handoff = ?config.handoff, "Starting search-sync");
            let backends = Backends::connect(&config).await?;
            let mut runtime = SyncRuntime::new(config, backends);
            runtime.start(role.into()).await?;
            runtime.run_until_signal().await;
        }
    }
    Ok(())
}
