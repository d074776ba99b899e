use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use encore_session::Downloader;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::errors::{ServerError, ServerResult};

/// Serves a cached media file to the display client.
pub async fn get_video(
    State(downloader): State<Arc<Downloader>>,
    Path(video_id): Path<String>,
) -> ServerResult<Response> {
    let path = downloader
        .video_path(&video_id)
        .ok_or(ServerError::NotFound { resource: "Video" })?;

    let file = File::open(&path)
        .await
        .map_err(|err| ServerError::Unknown(err.to_string()))?;

    let body = Body::from_stream(ReaderStream::new(file));

    // Fetches are pinned to webm, so the content type is static.
    Ok(([(header::CONTENT_TYPE, "video/webm")], body).into_response())
}
