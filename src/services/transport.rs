//! Websocket channel feeding the dispatcher, one frame at a time.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    error::{DecodeError, TransportError},
    services::dispatcher,
    state::{SharedSession, signals::Advisory},
};

/// Derive the room's websocket URL from the HTTP base URL.
pub fn websocket_url(server_url: &str, room_id: &str, username: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws/{room_id}/{username}")
}

/// Connect to `url` and dispatch every inbound frame until the server closes
/// the channel. Pending flags and gestures are dropped on the way out.
pub async fn run(session: SharedSession, url: &str) -> Result<(), TransportError> {
    let (stream, _response) =
        connect_async(url)
            .await
            .map_err(|source| TransportError::Connect {
                url: url.to_string(),
                source: Box::new(source),
            })?;
    info!(url, "websocket connected");

    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(err) = sender.send(message).await {
                warn!(error = %err, "failed to write websocket frame");
                break;
            }
        }
    });

    let mut outcome = Ok(());
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let _ = dispatcher::dispatch_text(&session, &text).await;
            }
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => {
                    let _ = dispatcher::dispatch_text(&session, &text).await;
                }
                Err(err) => {
                    warn!(error = %err, "dropping binary frame");
                    session.notify(Advisory::warning(DecodeError::NotUtf8.to_string()));
                }
            },
            Ok(Message::Ping(payload)) => {
                if tx.send(Message::Pong(payload)).is_err() {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                debug!(?frame, "server closed the channel");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                outcome = Err(TransportError::Read {
                    source: Box::new(err),
                });
                break;
            }
        }
    }

    drop(tx);
    let _ = writer.await;
    let reason = match &outcome {
        Ok(()) => "channel closed".to_string(),
        Err(err) => err.to_string(),
    };
    session.on_disconnect(&reason).await;
    outcome
}
