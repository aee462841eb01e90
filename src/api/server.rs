//! HTTP/WebSocket server for the caption service

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::api::{handlers, websocket};
use crate::config::ApiConfig;
use crate::pipeline::CaptionPipeline;

pub struct AppState {
    pub pipeline: Arc<CaptionPipeline>,
}

pub struct ApiServer {
    config: ApiConfig,
    pipeline: Arc<CaptionPipeline>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, pipeline: Arc<CaptionPipeline>) -> Self {
        Self {
            config,
            pipeline,
            shutdown_tx: None,
        }
    }

    /// The full route table. Split out so tests can drive it without a
    /// listening socket.
    pub fn router(pipeline: Arc<CaptionPipeline>) -> Router {
        let state = Arc::new(AppState { pipeline });
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/speakers", get(handlers::get_speakers))
            .route("/api/languages", get(handlers::get_languages))
            .route("/api/captions/:listener_id", get(handlers::get_captions))
            .route(
                "/api/listeners/:listener_id/language",
                post(handlers::set_language),
            )
            .route("/ws/speak", get(websocket::speaker_socket))
            .route("/ws/captions", get(websocket::listener_socket))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve on a background task. Returns the task handle;
    /// call [`ApiServer::stop`] for a graceful shutdown.
    pub fn start_background(&mut self) -> JoinHandle<()> {
        let (tx, rx) = oneshot::channel();
        self.shutdown_tx = Some(tx);

        let app = Self::router(Arc::clone(&self.pipeline));
        let bind_address = self.config.bind_address.clone();
        let port = self.config.http_port;

        tokio::spawn(async move {
            let addr = format!("{bind_address}:{port}");
            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!(address = %addr, error = %err, "failed to bind caption service");
                    return;
                }
            };
            let local: Option<SocketAddr> = listener.local_addr().ok();
            info!(address = ?local, "caption service listening");

            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    rx.await.ok();
                })
                .await
            {
                error!(error = %err, "caption service error");
            }
            info!("caption service stopped");
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
