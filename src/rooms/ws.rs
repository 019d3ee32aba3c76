use axum::{
    debug_handler,
    extract::{ws::{Message, WebSocket}, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::Receiver;

use crate::{events::ServerEvent, AppState};

use super::session::Session;

#[derive(Deserialize)]
pub(crate) struct ConnectQuery {
    token: Option<String>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn relay_ws(
    State(app): State<AppState>,
    Query(ConnectQuery { token }): Query<ConnectQuery>,
    headers: HeaderMap,

    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer(&headers).or(token);

    // verify before upgrading so a bad token never gets a socket
    let mut session = Session::new(app);
    let outbox = match session.authenticate(token.as_deref()).await {
        Ok(outbox) => outbox,
        Err(err) => return err.into_response(),
    };

    ws.on_upgrade(move |socket| serve(session, outbox, socket))
}

async fn serve(mut session: Session, mut outbox: Receiver<ServerEvent>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping unserializable event");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(msg)) => {
                    // errors were already reported to the client
                    let _ = session.handle_frame(&msg.into_data()).await;
                }
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "socket read failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    session.close();
    writer.abort();
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_owned())
}
