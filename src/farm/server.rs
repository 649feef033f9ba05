//! Registry HTTP endpoint.
//!
//! Serves `GET /ants` so other antfarms can discover this farm's ants and
//! cross-connect their gateways.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::AntInfo;
use crate::ant::Ant;

#[derive(Clone)]
struct AppState {
    ants: Arc<Vec<Arc<Ant>>>,
}

/// A running registry listener; dropped via `shutdown`.
pub(crate) struct RegistryServer {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RegistryServer {
    /// Bind `listen_addr` and serve the registry until shut down.
    pub(crate) async fn serve(listen_addr: &str, ants: Vec<Arc<Ant>>) -> Result<RegistryServer> {
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind registry listener on {}", listen_addr))?;
        info!(addr = %listen_addr, "registry listening");

        let app = Router::new()
            .route("/ants", get(list_ants))
            .with_state(AppState {
                ants: Arc::new(ants),
            });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                error!(error = %err, "registry server failed");
            }
        });

        Ok(RegistryServer {
            shutdown_tx,
            handle,
        })
    }

    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// The registry exposes descriptors only; RPC clients and process handles
/// never leave the farm.
async fn list_ants(State(state): State<AppState>) -> Json<Vec<AntInfo>> {
    Json(state.ants.iter().map(|ant| AntInfo::describe(ant)).collect())
}
