mod cache;
mod cli;
mod config;
mod proxy;
mod router;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::proxy::state::AppState;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if config.debug { "debug" } else { "info" })
    });

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if config.simple_log {
        subscriber.without_time().compact().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenv::dotenv() {
        tracing::trace!("no .env file loaded: {e}");
    }

    let cli = cli::Cli::parse();

    let config = match Config::from_env(cli.host, cli.port) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    tracing::info!(
        upstream = %config.upstream_base_url,
        provider = %config.provider_class,
        "starting relay"
    );

    let client = proxy::upstream::build_client()?;
    let state = AppState::new(config, client);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let server = tokio::spawn(proxy::server::serve(state, shutdown_rx));

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping");
    let _ = shutdown_tx.send(());

    server.await??;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
