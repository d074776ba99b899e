use std::sync::Arc;

use axum::extract::FromRef;
use encore_session::{Downloader, SqliteStore};

use crate::{router::MessageRouter, ws::ConnectionManager};

#[derive(Clone, FromRef)]
pub struct ServerContext {
    pub connections: Arc<ConnectionManager>,
    pub downloader: Arc<Downloader>,
    pub router: Arc<MessageRouter<SqliteStore>>,
}
