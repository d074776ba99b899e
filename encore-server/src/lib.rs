use std::{
    net::{Ipv6Addr, SocketAddr},
    sync::Arc,
};

use axum::{routing::get, Json, Router};
use encore_session::{Downloader, MediaError, SqliteStore, StoreError, YtDlp};
use log::info;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod logging;
pub mod media;
pub mod messages;
pub mod router;
pub mod ws;

pub use config::Config;

use context::ServerContext;
use router::MessageRouter;
use ws::ConnectionManager;

#[derive(Debug, Error)]
pub enum EncoreError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Could not open the session store: {0}")]
    Store(#[from] StoreError),
    #[error("Could not prepare the media directory: {0}")]
    Media(#[from] MediaError),
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl EncoreError {
    pub fn hint(&self) -> String {
        match self {
            EncoreError::Config(_) => {
                "Check the ENCORE_* environment variables for typos, then try again.".to_string()
            }
            EncoreError::Store(_) => {
                "Make sure the database location is writable, or point ENCORE_DATABASE_URL somewhere else.".to_string()
            }
            EncoreError::Media(_) => {
                "Make sure ENCORE_VIDEO_DIR points to a directory this process may create.".to_string()
            }
            EncoreError::Io(_) => {
                "Make sure the port is free, or pick another one with ENCORE_SERVER_PORT.".to_string()
            }
            EncoreError::Fatal(_) => "This error is fatal, and should not happen.".to_string(),
        }
    }
}

/// Starts the encore server.
pub async fn run_server(config: Config) -> Result<(), EncoreError> {
    let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, config.port).into();

    let ytdlp = Arc::new(YtDlp);
    let downloader = Arc::new(Downloader::new(&config.media(), ytdlp.clone()));

    // With the default settings the database file lives next to the video
    // directory, so the data tree has to exist before the store connects.
    downloader.ensure_dir()?;

    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);

    let connections = Arc::new(ConnectionManager::new());
    let (event_sender, event_receiver) = events::event_channel();

    let router = Arc::new(MessageRouter::new(
        &store,
        &connections,
        &downloader,
        ytdlp,
        event_sender,
    ));

    let event_loop = tokio::spawn(events::check_events(event_receiver, router.clone()));

    let context = ServerContext {
        connections,
        downloader,
        router: router.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/videos/:video_id", get(media::get_video))
        .route("/ws", get(ws::websocket_handler))
        .layer(cors)
        .with_state(context);

    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on port {}", config.port);

    axum::serve(listener, app).await?;

    router.shutdown();
    event_loop.abort();

    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
