//! Per-connection socket session
//!
//! One task per socket. The connection is anonymous until the client's
//! first event authenticates it; after that the session is registered
//! with the hub and presence, auto-joined to its conversation rooms, and
//! inbound events are applied strictly in arrival order. Outbound events
//! flow through an unbounded queue drained by a writer task, so slow
//! consumers never block the pipeline.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::hub::broadcast_presence;
use super::protocol::{ClientEvent, MessagePayload, ServerEvent};
use crate::api::CoreContext;
use crate::api::auth::Identity;
use crate::core::constants::SOCKET_AUTH_TIMEOUT_MS;
use crate::data::cache::RateLimitBucket;
use crate::data::types::MessageKind;
use crate::domain::events::MessageEvent;
use crate::domain::ingest::{IngestError, IngestOutcome, SendMessageRequest};
use crate::domain::rooms::RoomError;
use crate::domain::status::StatusError;
use crate::data::streams::StreamName;

pub async fn ws_handler(
    State(ctx): State<Arc<CoreContext>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(ctx, socket))
}

async fn handle_socket(ctx: Arc<CoreContext>, socket: WebSocket) {
    let session_id = cuid2::create_id();
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();

    let writer = tokio::spawn(run_writer(sink, rx));

    // Phase 1: authentication handshake
    let Some(identity) = authenticate(&ctx, &tx, &mut stream).await else {
        drop(tx);
        let _ = writer.await;
        return;
    };

    // Phase 2: session setup
    ctx.hub.register(&session_id, &identity.id, tx.clone());
    if let Err(e) = ctx.presence.register(&identity.id, &session_id).await {
        tracing::warn!(identity = %identity.id, error = %e, "Presence registration failed");
    }
    auto_join_rooms(&ctx, &session_id, &identity).await;

    let _ = tx.send(ServerEvent::Authenticated {
        identity: identity.id.clone(),
        session_id: session_id.clone(),
    });
    broadcast_presence(&ctx.hub, &session_id, &identity.id, true);

    tracing::debug!(session_id = %session_id, identity = %identity.id, "Socket session established");

    // Phase 3: inbound loop, strictly sequential per connection
    let idle = Duration::from_millis(ctx.config.socket.ping_timeout_ms);
    loop {
        let frame = match tokio::time::timeout(idle, stream.next()).await {
            Err(_) => {
                tracing::debug!(session_id = %session_id, "Socket idle past ping timeout, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = %session_id, error = %e, "Socket read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(ClientEvent::Authenticate { .. }) => {
                    tracing::debug!(session_id = %session_id, "Duplicate authenticate ignored");
                }
                Ok(event) => dispatch(&ctx, &session_id, &identity, event, &tx).await,
                Err(e) => {
                    // Unknown or malformed inbound events are logged and dropped
                    tracing::debug!(session_id = %session_id, error = %e, "Unparseable inbound event dropped");
                }
            },
            WsMessage::Close(_) => break,
            // Transport-level ping/pong and binary frames are not protocol events
            _ => {}
        }
    }

    // Phase 4: teardown. Rooms are not explicitly left; a later join
    // re-subscribes.
    broadcast_presence(&ctx.hub, &session_id, &identity.id, false);
    ctx.hub.unregister(&session_id);
    if let Err(e) = ctx.presence.unregister(&identity.id, &session_id).await {
        tracing::warn!(identity = %identity.id, error = %e, "Presence unregister failed");
    }

    drop(tx);
    let _ = writer.await;
    tracing::debug!(session_id = %session_id, identity = %identity.id, "Socket session closed");
}

async fn run_writer(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode outbound event");
                continue;
            }
        };
        if sink.send(WsMessage::Text(json.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Wait for the `authenticate` event and verify the claim. Anything else,
/// an invalid token, or silence past the deadline closes the socket with
/// `auth_error`.
async fn authenticate(
    ctx: &CoreContext,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    stream: &mut SplitStream<WebSocket>,
) -> Option<Identity> {
    let deadline = Duration::from_millis(SOCKET_AUTH_TIMEOUT_MS);

    let frame = match tokio::time::timeout(deadline, stream.next()).await {
        Err(_) => {
            let _ = tx.send(auth_error("AUTH_TIMEOUT", "no authentication received"));
            return None;
        }
        Ok(Some(Ok(frame))) => frame,
        Ok(_) => return None,
    };

    let WsMessage::Text(text) = frame else {
        let _ = tx.send(auth_error("AUTH_REQUIRED", "authenticate first"));
        return None;
    };

    match serde_json::from_str::<ClientEvent>(text.as_str()) {
        Ok(ClientEvent::Authenticate { token }) => match ctx.auth.verify(&token) {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::debug!(error = %e, "Socket authentication rejected");
                let _ = tx.send(auth_error(e.code(), e.to_string()));
                None
            }
        },
        _ => {
            let _ = tx.send(auth_error("AUTH_REQUIRED", "authenticate first"));
            None
        }
    }
}

/// Subscribe the session to every conversation the identity participates
/// in. Failures degrade to explicit `joinConversation` calls.
async fn auto_join_rooms(ctx: &CoreContext, session_id: &str, identity: &Identity) {
    match ctx.gateway.list_conversations(&identity.id).await {
        Ok(conversations) => {
            for (conversation, _) in conversations {
                ctx.hub.join_room(&conversation.id, session_id);
            }
        }
        Err(e) => {
            tracing::warn!(identity = %identity.id, error = %e, "Auto-join skipped, store unavailable");
        }
    }
}

async fn dispatch(
    ctx: &CoreContext,
    session_id: &str,
    identity: &Identity,
    event: ClientEvent,
    tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    match event {
        ClientEvent::Authenticate { .. } => unreachable!("filtered by the caller"),

        ClientEvent::SendMessage {
            conversation_id,
            content,
            kind,
            receiver_id,
            attachment_id,
        } => {
            handle_send_message(
                ctx,
                identity,
                conversation_id,
                content,
                kind,
                receiver_id,
                attachment_id,
                tx,
            )
            .await;
        }

        ClientEvent::MessageReceived {
            message_id,
            conversation_id: _,
        } => {
            if let Err(e) = ctx.status.mark_delivered(&message_id, &identity.id).await {
                let _ = tx.send(status_error_event(e));
            }
        }

        ClientEvent::MarkRead {
            conversation_id,
            up_to_message_id,
        } => {
            match ctx
                .status
                .mark_read(&conversation_id, &identity.id, up_to_message_id.as_deref())
                .await
            {
                Ok(_) => {
                    let _ = tx.send(ServerEvent::ConversationMarkedRead {
                        conversation_id,
                        read_by: identity.id.clone(),
                        up_to_message_id,
                    });
                }
                Err(e) => {
                    let _ = tx.send(status_error_event(e));
                }
            }
        }

        ClientEvent::Typing {
            conversation_id,
            is_typing,
        } => {
            // Ephemeral: no pipeline, no persistence
            match ctx.rooms.is_participant(&identity.id, &conversation_id).await {
                Ok(true) => {
                    ctx.hub.send_to_conversation(
                        &conversation_id,
                        &ServerEvent::UserTyping {
                            identity: identity.id.clone(),
                            conversation_id: conversation_id.clone(),
                            is_typing,
                        },
                        Some(session_id),
                    );
                }
                Ok(false) | Err(_) => {}
            }
        }

        ClientEvent::JoinConversation { conversation_id } => {
            match ctx.rooms.join(&identity.id, &conversation_id).await {
                Ok(()) => {
                    ctx.hub.join_room(&conversation_id, session_id);
                    let participants = ctx
                        .rooms
                        .participants(&conversation_id)
                        .await
                        .unwrap_or_default();
                    let _ = tx.send(ServerEvent::ConversationJoined {
                        conversation_id,
                        participants,
                    });
                }
                Err(e) => {
                    let _ = tx.send(room_error_event(e));
                }
            }
        }

        ClientEvent::LeaveConversation { conversation_id } => {
            ctx.hub.leave_room(&conversation_id, session_id);
            let _ = ctx.rooms.leave(&identity.id, &conversation_id).await;
        }

        ClientEvent::EditMessage {
            message_id,
            content,
        } => {
            handle_edit(ctx, identity, message_id, content, tx).await;
        }

        ClientEvent::DeleteMessage { message_id } => {
            handle_delete(ctx, identity, message_id, tx).await;
        }

        ClientEvent::Ping => {
            let _ = ctx.presence.heartbeat(&identity.id).await;
            let _ = tx.send(ServerEvent::Pong);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_send_message(
    ctx: &CoreContext,
    identity: &Identity,
    conversation_id: String,
    content: String,
    kind: Option<String>,
    receiver_id: Option<String>,
    attachment_id: Option<String>,
    tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    if ctx.config.rate_limit.enabled {
        let bucket = RateLimitBucket::messages(ctx.config.rate_limit.messages_rpm);
        let result = ctx.rate_limiter.check(&bucket, &identity.id).await;
        if !result.allowed {
            let _ = tx.send(ingest_error_event(IngestError::RateLimited {
                retry_after_ms: result.retry_after_ms.unwrap_or(0),
            }));
            return;
        }
    }

    let kind = match kind.as_deref() {
        None => MessageKind::Text,
        Some(raw) => match MessageKind::parse(raw) {
            Some(kind) => kind,
            None => {
                let _ = tx.send(ServerEvent::MessageError {
                    message: format!("unknown message type: {raw}"),
                    code: "VALIDATION".to_string(),
                    retry_after_ms: None,
                });
                return;
            }
        },
    };

    let request = SendMessageRequest {
        conversation_id,
        content,
        kind,
        receiver_id,
        attachment_id,
    };

    match ctx.ingest.receive_message(&identity.id, request).await {
        Ok(IngestOutcome::Sent(message)) => {
            let _ = tx.send(ServerEvent::MessageSent {
                message_id: message.id,
                persisted: true,
                status: "SENT",
            });
        }
        Ok(IngestOutcome::Queued(message)) => {
            let _ = tx.send(ServerEvent::MessageSent {
                message_id: message.id,
                persisted: false,
                status: "QUEUED",
            });
        }
        Err(e) => {
            let _ = tx.send(ingest_error_event(e));
        }
    }
}

async fn handle_edit(
    ctx: &CoreContext,
    identity: &Identity,
    message_id: String,
    content: String,
    tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    if content.trim().is_empty() {
        let _ = tx.send(ServerEvent::MessageError {
            message: "content must not be empty".to_string(),
            code: "VALIDATION".to_string(),
            retry_after_ms: None,
        });
        return;
    }

    match ctx.gateway.edit_message(&message_id, &identity.id, &content).await {
        Ok(true) => {
            let Ok(Some(message)) = ctx.gateway.find_message(&message_id).await else {
                return;
            };
            let event = MessageEvent::Edited {
                message: message.clone(),
            };
            if let Err(e) = ctx.streams.append(StreamName::EventsMessages, &event).await {
                tracing::warn!(message_id = %message.id, error = %e, "Failed to publish edit event");
            }
            let _ = tx.send(ServerEvent::MessageEdited(MessagePayload::from(&message)));
        }
        Ok(false) => {
            let _ = tx.send(ServerEvent::MessageError {
                message: "message not editable".to_string(),
                code: "EDIT_REJECTED".to_string(),
                retry_after_ms: None,
            });
        }
        Err(e) => {
            let _ = tx.send(ServerEvent::MessageError {
                message: e.to_string(),
                code: "INTERNAL".to_string(),
                retry_after_ms: None,
            });
        }
    }
}

async fn handle_delete(
    ctx: &CoreContext,
    identity: &Identity,
    message_id: String,
    tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    // Resolve first: the deletion event needs the conversation id
    let message = match ctx.gateway.find_message(&message_id).await {
        Ok(Some(message)) => message,
        Ok(None) => {
            let _ = tx.send(ServerEvent::MessageError {
                message: format!("message not found: {message_id}"),
                code: "NOT_FOUND".to_string(),
                retry_after_ms: None,
            });
            return;
        }
        Err(e) => {
            let _ = tx.send(ServerEvent::MessageError {
                message: e.to_string(),
                code: "INTERNAL".to_string(),
                retry_after_ms: None,
            });
            return;
        }
    };

    match ctx.gateway.soft_delete_message(&message_id, &identity.id).await {
        Ok(true) => {
            let event = MessageEvent::Deleted {
                message_id: message_id.clone(),
                conversation_id: message.conversation_id.clone(),
                sender_id: identity.id.clone(),
            };
            if let Err(e) = ctx.streams.append(StreamName::EventsMessages, &event).await {
                tracing::warn!(message_id = %message_id, error = %e, "Failed to publish delete event");
            }
            let _ = tx.send(ServerEvent::MessageDeleted {
                message_id,
                conversation_id: message.conversation_id,
            });
        }
        Ok(false) => {
            let _ = tx.send(ServerEvent::MessageError {
                message: "message not deletable".to_string(),
                code: "DELETE_REJECTED".to_string(),
                retry_after_ms: None,
            });
        }
        Err(e) => {
            let _ = tx.send(ServerEvent::MessageError {
                message: e.to_string(),
                code: "INTERNAL".to_string(),
                retry_after_ms: None,
            });
        }
    }
}

fn auth_error(code: &str, message: impl Into<String>) -> ServerEvent {
    ServerEvent::AuthError {
        message: message.into(),
        code: code.to_string(),
    }
}

fn ingest_error_event(e: IngestError) -> ServerEvent {
    let (code, retry_after_ms) = match &e {
        IngestError::Validation(_) => ("VALIDATION", None),
        IngestError::Authorization(_) => ("NOT_AUTHORIZED", None),
        IngestError::NotFound(_) => ("NOT_FOUND", None),
        IngestError::RateLimited { retry_after_ms } => ("RATE_LIMITED", Some(*retry_after_ms)),
        IngestError::Broker(_) => ("SERVICE_UNAVAILABLE", None),
        IngestError::Unrecoverable(_) => ("INTERNAL", None),
    };
    ServerEvent::MessageError {
        message: e.to_string(),
        code: code.to_string(),
        retry_after_ms,
    }
}

fn status_error_event(e: StatusError) -> ServerEvent {
    let code = match &e {
        StatusError::NotFound(_) => "NOT_FOUND",
        StatusError::NotParticipant { .. } => "NOT_AUTHORIZED",
        StatusError::Store(_) => "SERVICE_UNAVAILABLE",
        StatusError::Broker(_) => "SERVICE_UNAVAILABLE",
    };
    ServerEvent::MessageError {
        message: e.to_string(),
        code: code.to_string(),
        retry_after_ms: None,
    }
}

fn room_error_event(e: RoomError) -> ServerEvent {
    let code = match &e {
        RoomError::NotFound(_) => "NOT_FOUND",
        RoomError::NotParticipant { .. } | RoomError::Forbidden { .. } => "NOT_AUTHORIZED",
        RoomError::Store(_) => "SERVICE_UNAVAILABLE",
    };
    ServerEvent::MessageError {
        message: e.to_string(),
        code: code.to_string(),
        retry_after_ms: None,
    }
}
