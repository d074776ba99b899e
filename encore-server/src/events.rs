use std::sync::Arc;

use encore_session::Store;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::router::MessageRouter;

pub type EventSender = UnboundedSender<DownloadEvent>;
pub type EventReceiver = UnboundedReceiver<DownloadEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Describes the lifecycle of one background media transfer.
///
/// Transfer tasks only emit these; all store updates and broadcasts they
/// imply happen on the event loop, so a slow client can never stall a
/// transfer.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// A transfer task picked the item up.
    Started {
        /// The queue item that asked for the media.
        item_id: String,
        video_id: String,
    },
    /// The transfer reported how far along it is.
    Progress {
        item_id: String,
        video_id: String,
        /// Completed fraction in `[0, 1]`.
        progress: f64,
    },
    /// The media is on disk and the item can become ready.
    Finished { item_id: String, video_id: String },
    /// The transfer failed and will not be retried.
    Failed {
        item_id: String,
        video_id: String,
        /// What went wrong, already formatted for the log.
        error: String,
    },
}

/// Applies download events to the session until every sender is gone.
pub async fn check_events<S>(mut receiver: EventReceiver, router: Arc<MessageRouter<S>>)
where
    S: Store,
{
    while let Some(event) = receiver.recv().await {
        router.handle_download_event(event).await;
    }
}
