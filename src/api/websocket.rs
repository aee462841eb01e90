//! WebSocket endpoints
//!
//! `/ws/speak`: one JSON `speaker_hello` text frame, then binary PCM16-LE
//! chunks in the announced format until the socket closes.
//! `/ws/captions`: one JSON `listener_hello` text frame, then caption
//! events flow out as JSON; `set_language`, `ping` and `get_stats` are
//! honored inline.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, trace, warn};

use crate::api::server::AppState;
use crate::protocol::{ControlMessage, ServerMessage, SpeakerInfo};

pub async fn speaker_socket(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_speaker(state, socket))
}

pub async fn listener_socket(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_listener(state, socket))
}

async fn handle_speaker(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    let hello = await_hello(&mut receiver).await;
    let Some(ControlMessage::SpeakerHello {
        speaker_id,
        speaker_name,
        language,
        sample_rate,
        channels,
    }) = hello
    else {
        let _ = send_json(
            &mut sender,
            &ServerMessage::Error {
                message: "expected speaker_hello".to_string(),
            },
        )
        .await;
        return;
    };

    let info = SpeakerInfo {
        speaker_id: speaker_id.clone(),
        speaker_name,
        source_language: language,
    };
    let ingest = match state.pipeline.add_speaker(info, sample_rate, channels) {
        Ok(ingest) => ingest,
        Err(err) => {
            warn!(speaker = %speaker_id, error = %err, "speaker rejected");
            let _ = send_json(
                &mut sender,
                &ServerMessage::Error {
                    message: err.to_string(),
                },
            )
            .await;
            return;
        }
    };
    if send_json(&mut sender, &ServerMessage::Connected).await.is_err() {
        drop(ingest);
        let _ = state.pipeline.remove_speaker(&speaker_id);
        return;
    }

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Binary(payload) => {
                if !ingest.push_pcm16(&payload) {
                    trace!(speaker = %speaker_id, "audio chunk dropped at ingest");
                }
            }
            Message::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
                Ok(ControlMessage::Ping) => {
                    if send_json(&mut sender, &ServerMessage::Pong).await.is_err() {
                        break;
                    }
                }
                Ok(ControlMessage::GetStats) => {
                    let stats = state.pipeline.stats_snapshot();
                    if send_json(&mut sender, &ServerMessage::Stats { stats }).await.is_err() {
                        break;
                    }
                }
                Ok(other) => {
                    debug!(speaker = %speaker_id, message = ?other, "control message ignored on speaker socket");
                }
                Err(err) => {
                    debug!(speaker = %speaker_id, error = %err, "unparseable control frame");
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    drop(ingest);
    let _ = state.pipeline.remove_speaker(&speaker_id);
    debug!(speaker = %speaker_id, "speaker socket closed");
}

async fn handle_listener(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    let hello = await_hello(&mut receiver).await;
    let Some(ControlMessage::ListenerHello {
        listener_id,
        display_language,
    }) = hello
    else {
        let _ = send_json(
            &mut sender,
            &ServerMessage::Error {
                message: "expected listener_hello".to_string(),
            },
        )
        .await;
        return;
    };

    let mut captions = match state
        .pipeline
        .subscribe_listener(&listener_id, display_language)
    {
        Ok(receiver) => receiver,
        Err(err) => {
            warn!(listener = %listener_id, error = %err, "listener rejected");
            let _ = send_json(
                &mut sender,
                &ServerMessage::Error {
                    message: err.to_string(),
                },
            )
            .await;
            return;
        }
    };
    if send_json(&mut sender, &ServerMessage::Connected).await.is_err() {
        let _ = state.pipeline.unsubscribe_listener(&listener_id);
        return;
    }

    loop {
        tokio::select! {
            event = captions.recv() => {
                // None means the subscription was closed elsewhere
                let Some(event) = event else { break };
                if send_json(&mut sender, &ServerMessage::from(event)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlMessage>(&text) {
                            Ok(ControlMessage::SetLanguage { language }) => {
                                match state
                                    .pipeline
                                    .set_listener_language(&listener_id, language.clone())
                                {
                                    Ok(()) => {
                                        if send_json(
                                            &mut sender,
                                            &ServerMessage::LanguageUpdated { language },
                                        )
                                        .await
                                        .is_err()
                                        {
                                            break;
                                        }
                                    }
                                    Err(err) => {
                                        warn!(listener = %listener_id, error = %err, "language switch failed");
                                        if send_json(
                                            &mut sender,
                                            &ServerMessage::Error { message: err.to_string() },
                                        )
                                        .await
                                        .is_err()
                                        {
                                            break;
                                        }
                                    }
                                }
                            }
                            Ok(ControlMessage::Ping) => {
                                if send_json(&mut sender, &ServerMessage::Pong).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ControlMessage::GetStats) => {
                                let stats = state.pipeline.stats_snapshot();
                                if send_json(&mut sender, &ServerMessage::Stats { stats }).await.is_err() {
                                    break;
                                }
                            }
                            Ok(other) => {
                                debug!(listener = %listener_id, message = ?other, "control message ignored on listener socket");
                            }
                            Err(err) => {
                                debug!(listener = %listener_id, error = %err, "unparseable control frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(listener = %listener_id, error = %err, "listener socket error");
                        break;
                    }
                }
            }
        }
    }

    let _ = state.pipeline.unsubscribe_listener(&listener_id);
    debug!(listener = %listener_id, "listener socket closed");
}

/// First JSON control frame on a fresh socket; transport frames before
/// it are skipped.
async fn await_hello(receiver: &mut SplitStream<WebSocket>) -> Option<ControlMessage> {
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(message) {
        Ok(payload) => payload,
        Err(err) => {
            error!(error = %err, "failed to serialize server message");
            return Ok(());
        }
    };
    sender.send(Message::Text(payload)).await
}
