//! # repo-index CLI
//!
//! ## Usage
//!
//! ```bash
//! repo-index --config ./config/repo-index.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `repo-index serve` | Start the HTTP API |
//! | `repo-index reindex` | Reindex every repository the caller may read |
//! | `repo-index index <owner/name>` | Reindex one repository |
//! | `repo-index search "<query>"` | Permission-scoped search |
//! | `repo-index suggest "<prefix>"` | Permission-scoped suggestions |
//! | `repo-index check` | Check backend and access-control connectivity |
//!
//! ## Examples
//!
//! ```bash
//! # Reindex public repositories below one owner without writing anything
//! repo-index reindex --path alice --dry-run
//!
//! # Search commits visible to a token holder
//! repo-index search "spike sorting" --token "$TOKEN" --kind commits
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use repo_index::access::{AccessControl, CallerToken, GinAccessClient};
use repo_index::backend::{ElasticClient, MemoryBackend, SearchBackend};
use repo_index::config::{load_config, Config};
use repo_index::query::{SearchKind, SearchRequest};
use repo_index::server::{run_server, AppState};

/// Indexes git repositories into a search backend and serves
/// permission-scoped search over them.
#[derive(Parser)]
#[command(name = "repo-index", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/repo-index.toml")]
    config: PathBuf,

    /// Verbose logging (overrides `RUST_LOG`).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].port`.
    Serve,

    /// Reindex every repository the caller may read.
    Reindex {
        /// Access token of the caller. Anonymous (public repositories only) when omitted.
        #[arg(long)]
        token: Option<String>,

        /// Store subdirectory to limit the pass to (e.g. an owner).
        #[arg(long)]
        path: Option<String>,

        /// Run the pass against an in-memory index instead of the backend.
        #[arg(long)]
        dry_run: bool,
    },

    /// Reindex one repository given as `owner/name`.
    Index {
        repository: String,

        #[arg(long)]
        token: Option<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Search indexed objects.
    Search {
        query: String,

        #[arg(long)]
        token: Option<String>,

        /// `all`, `blobs` or `commits`.
        #[arg(long, default_value = "all")]
        kind: String,

        #[arg(long, default_value_t = 0)]
        from: usize,

        #[arg(long)]
        size: Option<usize>,
    },

    /// Prefix suggestions.
    Suggest {
        partial: String,

        #[arg(long)]
        token: Option<String>,
    },

    /// Check connectivity to the search backend and access-control service.
    Check,
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn state(cfg: &Config, dry_run: bool) -> anyhow::Result<AppState> {
    let access: Arc<dyn AccessControl> = Arc::new(GinAccessClient::new(&cfg.access)?);
    let backend: Arc<dyn SearchBackend> = if dry_run {
        Arc::new(MemoryBackend::new())
    } else {
        Arc::new(ElasticClient::new(&cfg.backend)?)
    };
    Ok(AppState::new(cfg.clone(), access, backend))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            run_server(&cfg).await?;
        }
        Commands::Reindex {
            token,
            path,
            dry_run,
        } => {
            let state = state(&cfg, dry_run)?;
            let report = state
                .reindexer
                .reindex(&CallerToken::from_option(token), path.as_deref())
                .await?;
            print_json(&report)?;
        }
        Commands::Index {
            repository,
            token,
            dry_run,
        } => {
            let state = state(&cfg, dry_run)?;
            let report = state
                .reindexer
                .reindex_repository(&CallerToken::from_option(token), &repository)
                .await?;
            print_json(&report)?;
        }
        Commands::Search {
            query,
            token,
            kind,
            from,
            size,
        } => {
            let state = state(&cfg, false)?;
            let request = SearchRequest {
                query,
                kind: kind.parse::<SearchKind>()?,
                from,
                size,
            };
            let hits = state
                .gateway
                .search(&CallerToken::from_option(token), &request)
                .await?;
            print_json(&hits)?;
        }
        Commands::Suggest { partial, token } => {
            let state = state(&cfg, false)?;
            let hits = state
                .gateway
                .suggest(&CallerToken::from_option(token), &partial)
                .await?;
            print_json(&hits)?;
        }
        Commands::Check => {
            let backend = ElasticClient::new(&cfg.backend)?;
            let info = backend
                .ping()
                .await
                .with_context(|| format!("search backend at {}", cfg.backend.url))?;
            let version = info["version"]["number"].as_str().unwrap_or("unknown");
            println!("backend   ok  {} (version {})", cfg.backend.url, version);

            let access = GinAccessClient::new(&cfg.access)?;
            let public = access
                .public_repositories()
                .await
                .with_context(|| format!("access-control service at {}", cfg.access.url))?;
            println!(
                "access    ok  {} ({} public repositories)",
                cfg.access.url,
                public.len()
            );

            let store = &cfg.storage.repository_store;
            if store.is_dir() {
                println!("store     ok  {}", store.display());
            } else {
                anyhow::bail!("repository store {} is not a directory", store.display());
            }
        }
    }

    Ok(())
}
