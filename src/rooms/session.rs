//! Per-connection state machine: `Connecting -> Authenticated -> Closed`.
//!
//! A session owns nothing but its registry entry; all shared state lives in
//! [`AppState`]. Commands are handled one at a time in arrival order.

use std::sync::Arc;

use tokio::sync::mpsc::{self, Receiver};

use crate::{
    auth::Identity,
    events::{ClientCommand, HistoryQuery, RoomQuery, SendMessageQuery, ServerEvent},
    registry::{Connection, ConnectionId, OUTBOX_CAPACITY},
    AppState, RelayError, RelayResult,
};

use super::SignalEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Closed,
}

pub struct Session {
    app: AppState,
    state: SessionState,
    conn: Option<Arc<Connection>>,
}

impl Session {
    pub fn new(app: AppState) -> Self {
        Session {
            app,
            state: SessionState::Connecting,
            conn: None,
        }
    }

    /// Verifies the handshake token and registers the connection. On failure
    /// the session is closed and nothing was registered.
    pub async fn authenticate(&mut self, token: Option<&str>) -> RelayResult<Receiver<ServerEvent>> {
        if self.state != SessionState::Connecting {
            return Err(RelayError::Closed);
        }

        let identity = match self.app.verifier.verify(token.unwrap_or_default()) {
            Ok(identity) => identity,
            Err(err) => {
                self.state = SessionState::Closed;
                return Err(err);
            }
        };

        Ok(self.register(identity).await)
    }

    /// Opens a session for an identity that was verified elsewhere.
    pub async fn open(app: AppState, identity: Identity) -> (Self, Receiver<ServerEvent>) {
        let mut session = Session::new(app);
        let rx = session.register(identity).await;
        (session, rx)
    }

    async fn register(&mut self, identity: Identity) -> Receiver<ServerEvent> {
        // directory write failures never block the handshake
        if let Err(err) = self.app.directory.remember(&identity).await {
            tracing::warn!(user_id = %identity.user_id, error = %err, "failed to record profile");
        }

        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let conn = self.app.registry.register(identity, tx);
        conn.send(ServerEvent::Connected {
            connection_id: conn.id,
            identity: conn.identity.clone(),
        });

        tracing::info!(connection_id = %conn.id, user_id = %conn.identity.user_id, "session authenticated");
        self.conn = Some(conn);
        self.state = SessionState::Authenticated;
        rx
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.conn.as_ref().map(|conn| conn.id)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.conn.as_ref().map(|conn| &conn.identity)
    }

    /// Decodes and handles one inbound frame. Failures are reported to this
    /// connection only.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> RelayResult<()> {
        let result = match serde_json::from_slice::<ClientCommand>(frame) {
            Ok(cmd) => self.handle(cmd).await,
            Err(err) => Err(err.into()),
        };

        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    pub async fn handle(&mut self, cmd: ClientCommand) -> RelayResult<()> {
        let conn = self.connection()?;
        tracing::debug!(connection_id = %conn.id, command = cmd.name(), "handling command");

        match cmd {
            ClientCommand::JoinRoom(RoomQuery { room_id }) => {
                require_room(&room_id)?;
                self.app.router.join(&conn, &room_id);
            }
            ClientCommand::LeaveRoom(RoomQuery { room_id }) => {
                require_room(&room_id)?;
                self.app.router.leave(&conn, &room_id);
            }
            ClientCommand::Signal(query) => {
                self.app.router.route_signal(SignalEnvelope::new(conn.id, query));
            }
            ClientCommand::ChatMessage(SendMessageQuery { room_id, text }) => {
                let msg = self.app.history.append(&room_id, &conn.identity.user_id, &text).await?;
                let event = ServerEvent::ChatMessage(msg);

                self.app.router.broadcast(&room_id, event.clone(), None);
                // posting without joining is allowed; the sender still sees the stored record
                if !conn.is_in(&room_id) {
                    conn.send(event);
                }
            }
            ClientCommand::GetHistory(HistoryQuery { room_id, limit }) => {
                let messages = self.app.history.query(&room_id, limit).await?;
                let messages = self.app.directory.enrich(messages).await;
                conn.send(ServerEvent::History { room_id, messages });
            }
        }

        Ok(())
    }

    /// Leaves every joined room and drops the registry entry. Safe to call
    /// any number of times.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        if let Some(conn) = &self.conn {
            let rooms = self.app.router.remove_connection(conn.id);
            tracing::info!(connection_id = %conn.id, rooms, "session closed");
        }
    }

    fn connection(&self) -> RelayResult<Arc<Connection>> {
        match (self.state, &self.conn) {
            (SessionState::Authenticated, Some(conn)) => Ok(conn.clone()),
            (SessionState::Connecting, _) => Err(RelayError::Unauthorized),
            _ => Err(RelayError::Closed),
        }
    }

    fn report(&self, err: &RelayError) {
        let connection_id = self.id().map(|id| id.to_string()).unwrap_or_default();
        match err {
            RelayError::Storage(source) => {
                tracing::error!(connection_id = %connection_id, error = %source, "history storage failed");
            }
            _ => tracing::warn!(connection_id = %connection_id, error = %err, "command rejected"),
        }

        if let Some(conn) = &self.conn {
            conn.send(ServerEvent::from(err));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn require_room(room_id: &str) -> RelayResult<()> {
    if room_id.trim().is_empty() {
        return Err(RelayError::validation("roomId is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::db;

    const SECRET: &str = "session-test-secret";

    async fn app() -> AppState {
        AppState::new(db::memory().await.unwrap(), SECRET)
    }

    fn identity(user_id: &str) -> Identity {
        Identity {
            user_id: user_id.to_owned(),
            email: format!("{user_id}@example.com"),
            role: "client".to_owned(),
        }
    }

    fn drain(rx: &mut Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn cmd(value: serde_json::Value) -> ClientCommand {
        serde_json::from_value(value).unwrap()
    }

    fn chats(events: &[ServerEvent]) -> Vec<&crate::rooms::msg::ChatMessage> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ChatMessage(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn sample_scenario() {
        let app = app().await;
        let (mut a, mut rx_a) = Session::open(app.clone(), identity("alice")).await;
        let (mut b, mut rx_b) = Session::open(app.clone(), identity("bob")).await;

        a.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await.unwrap();
        b.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await.unwrap();
        a.handle(cmd(json!({ "event": "chat-message", "data": { "roomId": "room-1", "text": "hello" } }))).await.unwrap();

        let events_a = drain(&mut rx_a);
        let events_b = drain(&mut rx_b);
        let (seen_a, seen_b) = (chats(&events_a), chats(&events_b));
        assert_eq!(seen_a.len(), 1);
        assert_eq!(seen_b.len(), 1);
        assert_eq!(seen_a[0].id, seen_b[0].id);
        assert_eq!(seen_a[0].text, "hello");
        assert_eq!(seen_a[0].sender_id, "alice");
        let sent = seen_a[0].clone();

        b.handle(cmd(json!({ "event": "get-history", "data": { "roomId": "room-1" } }))).await.unwrap();

        let history = drain(&mut rx_b);
        let [ServerEvent::History { room_id, messages }] = history.as_slice() else {
            panic!("expected one history event, got {history:?}");
        };
        assert_eq!(room_id, "room-1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, sent);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn authenticate_registers_and_greets() {
        let app = app().await;
        let token = app.verifier.issue(&identity("alice"), Duration::from_secs(60)).unwrap();

        let mut session = Session::new(app.clone());
        assert_eq!(session.state(), SessionState::Connecting);
        let mut rx = session.authenticate(Some(&token)).await.unwrap();

        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(app.registry.len(), 1);
        assert_eq!(drain(&mut rx), vec![ServerEvent::Connected {
            connection_id: session.id().unwrap(),
            identity: identity("alice"),
        }]);
    }

    #[tokio::test]
    async fn history_names_senders_seen_at_handshake() {
        let app = app().await;
        let token = app.verifier.issue(&identity("alice"), Duration::from_secs(60)).unwrap();
        let mut a = Session::new(app.clone());
        let mut rx_a = a.authenticate(Some(&token)).await.unwrap();

        a.handle(cmd(json!({ "event": "chat-message", "data": { "roomId": "room-1", "text": "hi" } }))).await.unwrap();
        a.handle(cmd(json!({ "event": "get-history", "data": { "roomId": "room-1" } }))).await.unwrap();

        let events = drain(&mut rx_a);
        let Some(ServerEvent::History { messages, .. }) = events.last() else {
            panic!("expected history, got {events:?}");
        };
        let sender = messages[0].sender.as_ref().expect("sender profile");
        assert_eq!(sender.user_id, "alice");
        assert_eq!(sender.email.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn failed_handshake_closes_without_registering() {
        let app = app().await;
        for token in [None, Some(""), Some("garbage")] {
            let mut session = Session::new(app.clone());
            assert!(matches!(session.authenticate(token).await, Err(RelayError::Unauthorized)));
            assert_eq!(session.state(), SessionState::Closed);

            let res = session.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await;
            assert!(matches!(res, Err(RelayError::Closed)));
        }
        assert!(app.registry.is_empty());
        assert_eq!(app.router.room_count(), 0);
    }

    #[tokio::test]
    async fn commands_before_authentication_are_refused() {
        let mut session = Session::new(app().await);
        let res = session.handle(cmd(json!({ "event": "get-history", "data": { "roomId": "room-1" } }))).await;
        assert!(matches!(res, Err(RelayError::Unauthorized)));
    }

    #[tokio::test]
    async fn empty_chat_is_rejected_but_session_survives() {
        let app = app().await;
        let (mut a, mut rx_a) = Session::open(app.clone(), identity("alice")).await;
        let (mut b, mut rx_b) = Session::open(app.clone(), identity("bob")).await;
        a.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await.unwrap();
        b.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let res = a.handle_frame(br#"{"event":"chat-message","data":{"roomId":"room-1","text":""}}"#).await;
        assert!(matches!(res, Err(RelayError::Validation(_))));
        assert_eq!(a.state(), SessionState::Authenticated);

        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerEvent::Error { kind, .. }] if kind == "validation"));
        assert!(drain(&mut rx_b).is_empty());
        assert!(app.history.query("room-1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_yields_validation_error() {
        let (mut a, mut rx_a) = Session::open(app().await, identity("alice")).await;
        drain(&mut rx_a);

        assert!(a.handle_frame(b"{ not json").await.is_err());
        assert!(a.handle_frame(br#"{"event":"dance","data":{}}"#).await.is_err());

        let kinds: Vec<_> = drain(&mut rx_a)
            .into_iter()
            .map(|e| match e {
                ServerEvent::Error { kind, .. } => kind,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(kinds, vec!["validation", "validation"]);
        assert_eq!(a.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn storage_outage_spares_membership_and_signals() {
        let db_pool = db::memory().await.unwrap();
        let app = AppState::new(db_pool.clone(), SECRET);
        let (mut a, mut rx_a) = Session::open(app.clone(), identity("alice")).await;
        let (mut b, mut rx_b) = Session::open(app.clone(), identity("bob")).await;
        db_pool.close().await;

        // the handshake does not depend on the directory write
        let (_c, _rx_c) = Session::open(app.clone(), identity("carol")).await;
        assert_eq!(app.registry.len(), 3);

        a.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await.unwrap();
        b.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let res = a.handle_frame(br#"{"event":"chat-message","data":{"roomId":"room-1","text":"lost"}}"#).await;
        assert!(matches!(res, Err(RelayError::Storage(_))));
        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerEvent::Error { kind, .. }] if kind == "storage"));
        assert!(drain(&mut rx_b).is_empty());

        a.handle(cmd(json!({ "event": "signal", "data": { "roomId": "room-1", "data": { "sdp": "x" } } }))).await.unwrap();
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(app.router.members("room-1").len(), 2);
    }

    #[tokio::test]
    async fn chat_from_non_member_is_echoed_to_sender_once() {
        let app = app().await;
        let (mut a, mut rx_a) = Session::open(app.clone(), identity("alice")).await;
        let (mut b, mut rx_b) = Session::open(app.clone(), identity("bob")).await;
        b.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        a.handle(cmd(json!({ "event": "chat-message", "data": { "roomId": "room-1", "text": "drive-by" } }))).await.unwrap();

        assert_eq!(chats(&drain(&mut rx_a)).len(), 1);
        assert_eq!(chats(&drain(&mut rx_b)).len(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_notifies_once() {
        let app = app().await;
        let (mut a, _rx_a) = Session::open(app.clone(), identity("alice")).await;
        let (mut b, mut rx_b) = Session::open(app.clone(), identity("bob")).await;
        for session in [&mut a, &mut b] {
            session.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await.unwrap();
            session.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-2" } }))).await.unwrap();
        }
        drain(&mut rx_b);

        a.close();
        a.close();
        drop(a);

        let lefts = drain(&mut rx_b)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::UserLeft { .. }))
            .count();
        assert_eq!(lefts, 2);
        assert_eq!(app.registry.len(), 1);

        let res = b.handle(cmd(json!({ "event": "leave-room", "data": { "roomId": "room-1" } }))).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn dropping_a_session_cleans_up() {
        let app = app().await;
        {
            let (mut a, _rx) = Session::open(app.clone(), identity("alice")).await;
            a.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await.unwrap();
            assert_eq!(app.router.room_count(), 1);
        }
        assert_eq!(app.router.room_count(), 0);
        assert!(app.registry.is_empty());
    }

    #[tokio::test]
    async fn closed_session_refuses_commands() {
        let (mut a, _rx) = Session::open(app().await, identity("alice")).await;
        a.close();

        let res = a.handle(cmd(json!({ "event": "join-room", "data": { "roomId": "room-1" } }))).await;
        assert!(matches!(res, Err(RelayError::Closed)));
    }

    #[tokio::test]
    async fn blank_room_is_a_validation_error() {
        let (mut a, _rx) = Session::open(app().await, identity("alice")).await;
        let res = a.handle(cmd(json!({ "event": "join-room", "data": { "roomId": " " } }))).await;
        assert!(matches!(res, Err(RelayError::Validation(_))));
    }
}
