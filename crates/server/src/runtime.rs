use anyhow::{Context, Result};
use parley_common::types::UserRole;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{SeedFile, ServerConfig};
use crate::rpc::methods::RpcServerState;
use crate::rpc::ws::serve_until;

pub async fn run(config: ServerConfig) -> Result<()> {
    let state = build_state(&config)?;
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "parley server started");
    let sessions = state.sessions().clone();
    let shutdown = async move {
        shutdown_signal().await;
        let closed = sessions.close_all();
        info!(closed_sessions = closed, "closing live sessions");
    };
    serve_until(listener, state, shutdown).await
}

/// Fresh server state with the bootstrap admin and the seed file applied.
pub fn build_state(config: &ServerConfig) -> Result<RpcServerState> {
    let state = RpcServerState::new();

    match config.admin_credential.as_deref() {
        Some(credential) => {
            state
                .users()
                .create(&config.admin_username, credential, UserRole::Admin)
                .with_context(|| format!("failed to create admin `{}`", config.admin_username))?;
            info!(username = %config.admin_username, "bootstrap admin created");
        }
        None => warn!("PARLEY_ADMIN_CREDENTIAL not set; no admin account created"),
    }

    if let Some(path) = config.seed_file.as_deref() {
        let seed = SeedFile::load(path)?;
        let model_count = seed.models.len();
        for model in seed.models {
            state.models().insert(model.into()).context("failed to seed model")?;
        }
        if let Some(settings) = seed.admin_settings {
            state
                .models()
                .set_admin_settings(settings.into())
                .context("failed to seed admin settings")?;
        }
        info!(path = %path.display(), models = model_count, "seed file applied");
    }

    Ok(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
