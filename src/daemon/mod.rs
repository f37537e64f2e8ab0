//! HTTP daemon.
//!
//! Two listeners run side by side:
//!
//! - northbound: the management API (`/images`, `/iso`, `/microkernel`, `/health`)
//! - southbound: a static file server over the HTTP root, where mounted images
//!   appear as `/{name}/{version}/...`
//!
//! ```bash
//! curl -X PUT 'http://localhost:7070/images?name=centos&version=7.0&isostore=centos-7.0.iso'
//! curl -T centos-7.0.iso 'http://localhost:7070/images?name=centos&version=7.0&isoclient=centos-7.0.iso'
//! curl 'http://localhost:7070/images?name=centos'
//! curl http://localhost:9090/centos/7.0/
//! ```

mod handlers;

use std::{
    future::{Future, IntoFuture},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::watch};
use tower_http::{services::ServeDir, trace::TraceLayer};

pub use handlers::ImageParams;

use crate::{catalog::Catalog, error::ServiceError, inventory::Inventory};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub inventory: Arc<Inventory>,
    pub catalog: Arc<Catalog>,
}

/// JSON error body: `{"message": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// A [`ServiceError`] on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status: StatusCode = self.0.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        } else {
            tracing::info!("request rejected ({status}): {}", self.0);
        }
        let body = ErrorBody {
            message: self.0.message().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub struct ImageDaemon {
    state: AppState,
    http_root: PathBuf,
}

impl ImageDaemon {
    pub fn new(state: AppState) -> Self {
        let http_root = state.inventory.paths().http_root.clone();
        Self { state, http_root }
    }

    /// Management API routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/images",
                get(handlers::list_images)
                    .put(handlers::add_image)
                    .delete(handlers::delete_images),
            )
            .route(
                "/iso",
                get(handlers::list_iso)
                    .put(handlers::upload_iso)
                    .delete(handlers::delete_iso),
            )
            .route(
                "/microkernel",
                get(handlers::list_microkernel)
                    .put(handlers::upload_microkernel)
                    .delete(handlers::delete_microkernel),
            )
            .route("/health", get(handlers::health))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Static file server over the HTTP root.
    pub fn static_router(&self) -> Router {
        Router::new()
            .fallback_service(ServeDir::new(&self.http_root))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind both listeners and serve until `shutdown` resolves.
    pub async fn serve<F>(
        self,
        northbound: SocketAddr,
        southbound: SocketAddr,
        shutdown: F,
    ) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let north = TcpListener::bind(northbound).await?;
        let south = TcpListener::bind(southbound).await?;
        self.serve_with_listeners(north, south, shutdown).await
    }

    pub async fn serve_with_listeners<F>(
        self,
        north: TcpListener,
        south: TcpListener,
        shutdown: F,
    ) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("northbound API listening on {}", north.local_addr()?);
        tracing::info!(
            "southbound file service listening on {} (root {})",
            south.local_addr()?,
            self.http_root.display()
        );

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            let _ = tx.send(true);
        });

        let api = axum::serve(north, self.router())
            .with_graceful_shutdown(wait_for(rx.clone()))
            .into_future();
        let files = axum::serve(south, self.static_router())
            .with_graceful_shutdown(wait_for(rx))
            .into_future();
        tokio::try_join!(api, files)?;
        tracing::info!("daemon stopped");
        Ok(())
    }
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Resolves on ctrl-c.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
