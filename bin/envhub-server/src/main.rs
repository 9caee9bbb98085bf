//! envhub-server – entry point.
//!
//! Startup order for `serve`:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the SQLite database and check its schema revision.
//! 4. Pick the build strategy (direct Docker builds or a delegated BinderHub).
//! 5. Build the Axum router and start the HTTP server with graceful shutdown.
//!
//! `upgrade-db` applies pending migrations and exits.

mod config;
mod entities;
mod error;
mod middleware;
mod orchestrator;
mod routes;
mod schemas;
mod state;
mod tail;
#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use envhub_core::{BuildLauncher, DelegatedBuilder, DirectBuilder, ImageBuilder, RegistryClient};
use tracing::{info, warn};

use crate::config::Config;
use crate::entities::SqliteStore;
use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "envhub-server", version, about = "Build user environments from Git repositories")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP service (default).
    Serve,
    /// Apply pending database migrations, then exit.
    UpgradeDb {
        /// Database to upgrade; defaults to ENVHUB_DATABASE_URL.
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    init_tracing(&cfg);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg).await,
        Command::UpgradeDb { database_url } => {
            let url = database_url.unwrap_or(cfg.database_url);
            let store = SqliteStore::open(&url).await?;
            let before = store.applied_version().await?;
            store.upgrade().await?;
            info!(
                database_url = %url,
                from = ?before,
                to = SqliteStore::head_version(),
                "database upgraded"
            );
            Ok(())
        }
    }
}

fn init_tracing(cfg: &Config) {
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: ENVHUB_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn select_builder(cfg: &Config) -> anyhow::Result<Arc<dyn ImageBuilder>> {
    let registry = RegistryClient::connect();
    match &cfg.binderhub_url {
        Some(url) => {
            if let Err(e) = &registry {
                warn!(error = %e, "no local container runtime; image removal disabled");
            }
            let builder = DelegatedBuilder::new(url, cfg.binderhub_token.clone(), registry.ok())?;
            info!(binderhub_url = %url, "delegating builds to BinderHub");
            Ok(Arc::new(builder))
        }
        None => {
            let launcher = BuildLauncher::new(
                registry?,
                cfg.builder_image.clone(),
                cfg.extra_build_args.clone(),
            );
            info!(builder_image = %cfg.builder_image, "building images with local repo2docker containers");
            Ok(Arc::new(DirectBuilder::new(launcher)))
        }
    }
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "envhub-server starting");

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = SqliteStore::connect(&cfg.database_url).await?;
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Build strategy ──────────────────────────────────────────────────────
    let builder = select_builder(&cfg)?;

    // ── 5. Shared application state ────────────────────────────────────────────
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let prefix = cfg.service_prefix.clone();
    let state = Arc::new(AppState::new(cfg, store, builder));

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, %prefix, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let in_flight = state.orchestrator.builds_in_flight();
    if in_flight > 0 {
        warn!(in_flight, "stopping with builds in flight; their records stay building");
    }
    info!("envhub-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::parse_from(["envhub-server"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["envhub-server", "upgrade-db", "--database-url", "sqlite://x.db"]);
        match cli.command {
            Some(Command::UpgradeDb { database_url }) => {
                assert_eq!(database_url.as_deref(), Some("sqlite://x.db"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn delegated_mode_is_selected_by_binderhub_url() {
        let cfg = Config {
            binderhub_url: Some("http://binder.local/services/binder/".into()),
            ..Config::default()
        };
        let builder = select_builder(&cfg).unwrap();
        assert!(builder.requires_provider());
    }
}
