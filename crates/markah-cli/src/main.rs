use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use markah_adapters::{ExternalPlatform, FixturePlatform};
use markah_core::IntegrationGrant;
use markah_storage::PgStore;
use markah_sync::{SyncConfig, SyncRuntime};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "markah-cli")]
#[command(about = "Markah external bookmark sync")]
struct Cli {
    /// Serve the external platform from a JSON fixture instead of the X API.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One scheduler pass over every sync-enabled integration.
    Sync,
    /// Run once for a single user, ignoring the enabled flag.
    SyncUser { user_id: Uuid },
    Status { user_id: Uuid },
    /// Store tokens from a completed OAuth handshake.
    Connect {
        user_id: Uuid,
        #[arg(long)]
        account_id: String,
        #[arg(long)]
        handle: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: String,
        #[arg(long, default_value_t = 7200)]
        expires_in: i64,
    },
    Disconnect { user_id: Uuid },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Migrate => migrate().await,
        command => run(command, cli.fixture).await,
    }
}

async fn migrate() -> Result<()> {
    let url = SyncConfig::from_env()
        .database_url
        .ok_or_else(|| anyhow!("DATABASE_URL must be set to run migrations"))?;
    let store = PgStore::connect(&url).await.context("connecting to postgres")?;
    store.migrate().await.context("running migrations")?;
    println!("migrations applied");
    Ok(())
}

async fn run(command: Commands, fixture: Option<PathBuf>) -> Result<()> {
    let platform = match &fixture {
        Some(path) => {
            info!(path = %path.display(), "using fixture platform");
            Some(Arc::new(FixturePlatform::from_json_file(path)?) as Arc<dyn ExternalPlatform>)
        }
        None => None,
    };
    let runtime = SyncRuntime::from_env(platform).await?;

    match command {
        Commands::Sync => {
            let summary = runtime.scheduler.run_pass().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::SyncUser { user_id } => {
            let outcome = runtime.integrations.sync_now(user_id).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Status { user_id } => match runtime.integrations.status(user_id).await? {
            Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
            None => println!("user {user_id} has no connected X account"),
        },
        Commands::Connect {
            user_id,
            account_id,
            handle,
            access_token,
            refresh_token,
            expires_in,
        } => {
            let grant = IntegrationGrant {
                external_account_id: account_id,
                external_handle: handle,
                access_token,
                refresh_token,
                expires_at: chrono::Utc::now() + chrono::Duration::seconds(expires_in),
            };
            let integration = runtime.integrations.connect(user_id, &grant).await?;
            println!("connected @{} for user {user_id}", integration.external_handle);
        }
        Commands::Disconnect { user_id } => {
            if runtime.integrations.disconnect(user_id).await? {
                println!("disconnected user {user_id}");
            } else {
                println!("user {user_id} has no connected X account");
            }
        }
        Commands::Serve => markah_web::serve(runtime).await?,
        Commands::Migrate => migrate().await?,
    }

    Ok(())
}
