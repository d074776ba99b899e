use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::{context::ServerContext, messages::ServerMessage};

/// Registry-side handle for one open socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Connection {
    /// Set at join time. A socket browses anonymously until then but
    /// still receives broadcasts.
    singer_id: Option<String>,
    sender: UnboundedSender<ServerMessage>,
}

/// Tracks every open socket and who, if anyone, it joined as.
///
/// Outbound traffic is typed end to end and only becomes JSON at the
/// socket boundary. Sends are best-effort: a socket can drop at any
/// moment, so a failed send is logged and skipped rather than surfaced.
#[derive(Default)]
pub struct ConnectionManager {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, Connection>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a socket the moment it opens, before any join.
    pub fn connect(&self, sender: UnboundedSender<ServerMessage>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.connections.insert(
            id,
            Connection {
                singer_id: None,
                sender,
            },
        );

        id
    }

    /// Ties a connection to the singer it joined as.
    pub fn associate(&self, connection: ConnectionId, singer_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(&connection) {
            entry.singer_id = Some(singer_id.to_string());
        }
    }

    /// Removes a connection, returning the singer it was joined as, if any.
    pub fn disconnect(&self, connection: ConnectionId) -> Option<String> {
        self.connections
            .remove(&connection)
            .and_then(|(_, connection)| connection.singer_id)
    }

    /// The singer a connection joined as, or `None` before any join.
    pub fn singer_id(&self, connection: ConnectionId) -> Option<String> {
        self.connections
            .get(&connection)
            .and_then(|entry| entry.singer_id.clone())
    }

    /// The connection a singer is currently joined on, if any.
    pub fn find_by_singer(&self, singer_id: &str) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|entry| entry.singer_id.as_deref() == Some(singer_id))
            .map(|entry| *entry.key())
    }

    pub fn send_to(&self, connection: ConnectionId, message: &ServerMessage) {
        if let Some(entry) = self.connections.get(&connection) {
            if entry.sender.send(message.clone()).is_err() {
                debug!("Dropped message to closing connection {}", connection);
            }
        }
    }

    pub fn broadcast(&self, message: &ServerMessage) {
        self.broadcast_except(message, None);
    }

    /// Broadcasts to every connection but the excluded one. Used for
    /// events the excluded party already knows about, like its own join.
    pub fn broadcast_except(&self, message: &ServerMessage, excluded: Option<ConnectionId>) {
        for entry in self.connections.iter() {
            if Some(*entry.key()) == excluded {
                continue;
            }

            if entry.sender.send(message.clone()).is_err() {
                debug!("Dropped broadcast to closing connection {}", entry.key());
            }
        }
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(context): State<ServerContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, context))
}

async fn handle_socket(socket: WebSocket, context: ServerContext) {
    let (mut sink, mut stream) = socket.split();
    let (sender, mut outbound) = mpsc::unbounded_channel();

    let connection = context.connections.connect(sender);
    debug!("Connection {} opened", connection);

    loop {
        tokio::select! {
            message = outbound.recv() => {
                match message {
                    Some(message) => match serde_json::to_string(&message) {
                        Ok(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("Dropping unserializable message: {}", err),
                    },
                    None => break,
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        context.router.handle_text(connection, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("Connection {} errored: {}", connection, err);
                        break;
                    }
                }
            }
        }
    }

    if let Some(singer_id) = context.connections.disconnect(connection) {
        context.router.handle_disconnect(&singer_id).await;
    }

    debug!("Connection {} closed", connection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn open(manager: &ConnectionManager) -> (ConnectionId, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (manager.connect(tx), rx)
    }

    fn error(text: &str) -> ServerMessage {
        ServerMessage::Error {
            message: text.to_string(),
        }
    }

    #[test]
    fn connections_start_anonymous_until_associated() {
        let manager = ConnectionManager::new();
        let (id, _rx) = open(&manager);

        assert_eq!(manager.singer_id(id), None);

        manager.associate(id, "singer-1");
        assert_eq!(manager.singer_id(id), Some("singer-1".to_string()));
    }

    #[test]
    fn disconnect_reports_the_associated_singer() {
        let manager = ConnectionManager::new();
        let (anonymous, _rx) = open(&manager);
        let (joined, _rx) = open(&manager);

        manager.associate(joined, "singer-1");

        assert_eq!(manager.disconnect(anonymous), None);
        assert_eq!(manager.disconnect(joined), Some("singer-1".to_string()));
        assert_eq!(manager.singer_id(joined), None);
    }

    #[test]
    fn singers_can_be_found_while_connected() {
        let manager = ConnectionManager::new();
        let (id, _rx) = open(&manager);

        assert_eq!(manager.find_by_singer("singer-1"), None);

        manager.associate(id, "singer-1");
        assert_eq!(manager.find_by_singer("singer-1"), Some(id));

        manager.disconnect(id);
        assert_eq!(manager.find_by_singer("singer-1"), None);
    }

    #[test]
    fn send_to_reaches_only_the_target() {
        let manager = ConnectionManager::new();
        let (first, mut first_rx) = open(&manager);
        let (_second, mut second_rx) = open(&manager);

        manager.send_to(first, &error("just you"));

        assert!(matches!(first_rx.try_recv(), Ok(ServerMessage::Error { .. })));
        assert!(second_rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_includes_anonymous_connections() {
        let manager = ConnectionManager::new();
        let (joined, mut joined_rx) = open(&manager);
        let (_anonymous, mut anonymous_rx) = open(&manager);

        manager.associate(joined, "singer-1");
        manager.broadcast(&error("everyone"));

        assert!(joined_rx.try_recv().is_ok());
        assert!(anonymous_rx.try_recv().is_ok());
    }

    #[test]
    fn broadcast_except_skips_the_excluded_connection() {
        let manager = ConnectionManager::new();
        let (excluded, mut excluded_rx) = open(&manager);
        let (_other, mut other_rx) = open(&manager);

        manager.broadcast_except(&error("not you"), Some(excluded));

        assert!(excluded_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_ok());
    }

    #[test]
    fn sends_to_dropped_receivers_are_skipped() {
        let manager = ConnectionManager::new();
        let (gone, gone_rx) = open(&manager);
        let (alive, mut alive_rx) = open(&manager);
        drop(gone_rx);

        manager.send_to(gone, &error("lost"));
        manager.broadcast(&error("everyone"));

        assert!(alive_rx.try_recv().is_ok());
        assert!(alive_rx.try_recv().is_ok());
    }
}
