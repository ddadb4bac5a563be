use crate::error::ApiError;
use crate::model::{Attachment, ClientEvent, Conversation, Message, ServerEvent};
use crate::registry::Registry;
use crate::typing::TypingTracker;
use crate::{conversations, messages, users};
use rusqlite::Connection;
use uuid::Uuid;

/// Start (or fetch) the conversation between the requester and another
/// user.
pub fn get_or_start_conversation(
    conn: &Connection,
    requester_id: Uuid,
    recipient_id: Uuid,
) -> Result<Conversation, ApiError> {
    if requester_id == recipient_id {
        return Err(ApiError::validation("cannot message yourself"));
    }
    if users::get(conn, &recipient_id)?.is_none() {
        return Err(ApiError::not_found("user not found"));
    }
    conversations::get_or_create(conn, requester_id, recipient_id)
}

/// Persist a message, update the conversation, then attempt the live
/// push. The push runs strictly after the durable write and its outcome
/// is not surfaced: the sender's success depends on persistence alone.
pub fn send_message(
    conn: &Connection,
    registry: &Registry,
    sender_id: Uuid,
    conversation_id: Uuid,
    content: &str,
    attachments: &[Attachment],
    max_len: usize,
) -> Result<Message, ApiError> {
    let conversation = conversations::get(conn, &conversation_id)?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    if !conversation.is_participant(&sender_id) {
        return Err(ApiError::forbidden("not a participant of this conversation"));
    }
    let message = messages::append(conn, &conversation, sender_id, content, attachments, max_len)?;
    conversations::record_new_message(
        conn,
        &conversation.id,
        &message.id,
        message.created_at,
        &message.recipient_id,
    )?;
    let delivered = registry.send_to_user(
        &message.recipient_id,
        ServerEvent::MessageReceive(message.clone()),
    );
    if !delivered {
        tracing::debug!(
            recipient = %message.recipient_id,
            "recipient offline, live push dropped"
        );
    }
    Ok(message)
}

/// Mark everything addressed to the reader as read and reset their
/// unread counter, in that order. A failure between the two writes
/// leaves the counter stale, which is an accepted degraded state.
pub fn mark_conversation_read(
    conn: &Connection,
    reader_id: Uuid,
    conversation_id: Uuid,
) -> Result<usize, ApiError> {
    let conversation = conversations::get(conn, &conversation_id)?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    if !conversation.is_participant(&reader_id) {
        return Err(ApiError::forbidden("not a participant of this conversation"));
    }
    let changed = messages::mark_all_read(conn, &conversation_id, &reader_id)?;
    conversations::mark_read(conn, &conversation_id, &reader_id)?;
    Ok(changed)
}

/// Relay a transient client event (typing, read receipt) to the other
/// party. Nothing here is persisted or retried.
pub fn relay_client_event(
    conn: &Connection,
    registry: &Registry,
    typing: &TypingTracker,
    user_id: Uuid,
    event: ClientEvent,
) {
    match event {
        ClientEvent::TypingStart {
            recipient_id,
            conversation_id,
        } => {
            if typing.typing(user_id, conversation_id) {
                let _ = registry.send_to_user(
                    &recipient_id,
                    ServerEvent::TypingStart {
                        user_id,
                        conversation_id,
                    },
                );
            }
        }
        ClientEvent::TypingStop {
            recipient_id,
            conversation_id,
        } => {
            typing.stopped(user_id, conversation_id);
            let _ = registry.send_to_user(
                &recipient_id,
                ServerEvent::TypingStop {
                    user_id,
                    conversation_id,
                },
            );
        }
        ClientEvent::MessageRead {
            conversation_id,
            message_id,
        } => {
            if let Ok(Some(conversation)) = conversations::get(conn, &conversation_id) {
                if let Some(other) = conversation.other_participant(&user_id) {
                    let _ = registry.send_to_user(
                        &other,
                        ServerEvent::MessageRead {
                            conversation_id,
                            message_id,
                            reader_id: user_id,
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tokio::sync::mpsc;

    fn setup() -> (Connection, Registry, Uuid, Uuid) {
        let conn = db::init_db(":memory:").unwrap();
        let a = users::create(&conn, "alice", "Alice", "hash", &[]).unwrap().id;
        let b = users::create(&conn, "bob", "Bob", "hash", &[]).unwrap().id;
        (conn, Registry::new(), a, b)
    }

    #[test]
    fn two_party_chat_scenario() {
        let (conn, registry, a, b) = setup();
        let conv = get_or_start_conversation(&conn, a, b).unwrap();

        let m1 = send_message(&conn, &registry, a, conv.id, "hi", &[], 5000).unwrap();
        let after = conversations::get(&conn, &conv.id).unwrap().unwrap();
        assert_eq!(after.unread_for(&b), 1);
        assert_eq!(after.last_message_id, Some(m1.id));

        mark_conversation_read(&conn, b, conv.id).unwrap();
        let after = conversations::get(&conn, &conv.id).unwrap().unwrap();
        assert_eq!(after.unread_for(&b), 0);

        let m2 = send_message(&conn, &registry, b, conv.id, "hello", &[], 5000).unwrap();
        let after = conversations::get(&conn, &conv.id).unwrap().unwrap();
        assert_eq!(after.unread_for(&a), 1);
        assert_eq!(after.unread_for(&b), 0);
        assert_eq!(after.last_message_id, Some(m2.id));
    }

    #[test]
    fn offline_push_still_succeeds_and_is_durable() {
        let (conn, registry, a, b) = setup();
        let conv = get_or_start_conversation(&conn, a, b).unwrap();
        // B has no registry entry: the send must still succeed
        let msg = send_message(&conn, &registry, a, conv.id, "while away", &[], 5000).unwrap();
        assert!(!registry.is_online(&b));
        let listed = messages::list(&conn, &conv.id, None, 50).unwrap();
        assert_eq!(listed, vec![msg]);
    }

    #[tokio::test]
    async fn push_carries_the_persisted_message() {
        let (conn, registry, a, b) = setup();
        let conv = get_or_start_conversation(&conn, a, b).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(b, tx);
        let sent = send_message(&conn, &registry, a, conv.id, "ping", &[], 5000).unwrap();
        match rx.recv().await {
            Some(ServerEvent::MessageReceive(msg)) => assert_eq!(msg, sent),
            other => panic!("expected message push, got {other:?}"),
        }
    }

    #[test]
    fn outsiders_are_rejected() {
        let (conn, registry, a, b) = setup();
        let outsider = users::create(&conn, "carol", "Carol", "hash", &[]).unwrap().id;
        let conv = get_or_start_conversation(&conn, a, b).unwrap();
        assert!(matches!(
            send_message(&conn, &registry, outsider, conv.id, "hi", &[], 5000),
            Err(ApiError::Authorization(_))
        ));
        assert!(matches!(
            mark_conversation_read(&conn, outsider, conv.id),
            Err(ApiError::Authorization(_))
        ));
        assert!(matches!(
            send_message(&conn, &registry, a, Uuid::new_v4(), "hi", &[], 5000),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn self_conversation_rejected_with_no_side_effects() {
        let (conn, _registry, a, _b) = setup();
        assert!(matches!(
            get_or_start_conversation(&conn, a, a),
            Err(ApiError::Validation(_))
        ));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn read_receipt_relayed_to_sender() {
        let (conn, registry, a, b) = setup();
        let conv = get_or_start_conversation(&conn, a, b).unwrap();
        let msg = send_message(&conn, &registry, a, conv.id, "seen?", &[], 5000).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(a, tx);
        let typing = TypingTracker::new(std::time::Duration::from_millis(0));
        relay_client_event(
            &conn,
            &registry,
            &typing,
            b,
            ClientEvent::MessageRead {
                conversation_id: conv.id,
                message_id: Some(msg.id),
            },
        );
        match rx.recv().await {
            Some(ServerEvent::MessageRead {
                conversation_id,
                message_id,
                reader_id,
            }) => {
                assert_eq!(conversation_id, conv.id);
                assert_eq!(message_id, Some(msg.id));
                assert_eq!(reader_id, b);
            }
            other => panic!("expected read receipt, got {other:?}"),
        }
    }
}
