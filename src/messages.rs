use crate::db;
use crate::error::ApiError;
use crate::model::{Attachment, AttachmentKind, Conversation, Message};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

/// Cursor for backward pagination.
#[derive(Clone, Copy)]
pub enum Cursor {
    Timestamp(i64),
    Id(Uuid),
}

/// Append a message to a conversation. Once this returns the message is
/// durable and visible to `list` regardless of what the live push does.
pub fn append(
    conn: &Connection,
    conversation: &Conversation,
    sender_id: Uuid,
    content: &str,
    attachments: &[Attachment],
    max_len: usize,
) -> Result<Message, ApiError> {
    let recipient_id = conversation
        .other_participant(&sender_id)
        .ok_or_else(|| ApiError::forbidden("not a participant of this conversation"))?;
    if content.trim().is_empty() {
        return Err(ApiError::validation("message content required"));
    }
    if content.chars().count() > max_len {
        return Err(ApiError::validation("message content too long"));
    }
    let id = Uuid::new_v4();
    let now = db::now();
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, recipient_id, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            conversation.id.to_string(),
            sender_id.to_string(),
            recipient_id.to_string(),
            content,
            now
        ],
    )?;
    for att in attachments {
        conn.execute(
            "INSERT INTO attachments (id, message_id, kind, url, name, size_bytes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                id.to_string(),
                att.kind.as_str(),
                att.url,
                att.name,
                att.size_bytes
            ],
        )?;
    }
    Ok(Message {
        id,
        conversation_id: conversation.id,
        sender_id,
        recipient_id,
        content: content.into(),
        attachments: attachments.to_vec(),
        is_read: false,
        read_at: None,
        created_at: now,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        conversation_id: Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap_or_default(),
        sender_id: Uuid::parse_str(row.get::<_, String>(2)?.as_str()).unwrap_or_default(),
        recipient_id: Uuid::parse_str(row.get::<_, String>(3)?.as_str()).unwrap_or_default(),
        content: row.get(4)?,
        attachments: Vec::new(),
        is_read: row.get::<_, i64>(5)? != 0,
        read_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const COLUMNS: &str =
    "id, conversation_id, sender_id, recipient_id, content, is_read, read_at, created_at";

fn load_attachments(conn: &Connection, message_id: &Uuid) -> Result<Vec<Attachment>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT kind, url, name, size_bytes FROM attachments WHERE message_id = ?1 ORDER BY rowid",
    )?;
    let atts = stmt
        .query_map([message_id.to_string()], |row| {
            Ok(Attachment {
                kind: AttachmentKind::parse(row.get::<_, String>(0)?.as_str())
                    .unwrap_or(AttachmentKind::File),
                url: row.get(1)?,
                name: row.get(2)?,
                size_bytes: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(atts)
}

pub fn get(conn: &Connection, id: &Uuid) -> Result<Option<Message>, ApiError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"))?;
    let msg = stmt.query_row([id.to_string()], row_to_message).optional()?;
    match msg {
        Some(mut msg) => {
            msg.attachments = load_attachments(conn, &msg.id)?;
            Ok(Some(msg))
        }
        None => Ok(None),
    }
}

/// The most recent `limit` messages older than the cursor, returned in
/// chronological order. Passing the oldest returned message as the next
/// cursor continues backward.
pub fn list(
    conn: &Connection,
    conversation_id: &Uuid,
    before: Option<Cursor>,
    limit: usize,
) -> Result<Vec<Message>, ApiError> {
    let limit = limit.clamp(1, 200);
    // rowid is the insertion-order tiebreaker for same-second messages
    let (ts, rowid) = match before {
        Some(Cursor::Timestamp(ts)) => (ts, 0),
        Some(Cursor::Id(id)) => {
            let mut stmt = conn.prepare("SELECT created_at, rowid FROM messages WHERE id = ?1")?;
            let found: Option<(i64, i64)> = stmt
                .query_row([id.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?;
            found.unwrap_or((i64::MAX, i64::MAX))
        }
        None => (i64::MAX, i64::MAX),
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM messages WHERE conversation_id = ?1 \
         AND (created_at < ?2 OR (created_at = ?2 AND rowid < ?3)) \
         ORDER BY created_at DESC, rowid DESC LIMIT ?4"
    ))?;
    let mut msgs = stmt
        .query_map(
            params![conversation_id.to_string(), ts, rowid, limit as i64],
            row_to_message,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    for msg in &mut msgs {
        msg.attachments = load_attachments(conn, &msg.id)?;
    }
    msgs.reverse();
    Ok(msgs)
}

/// Mark every unread message addressed to `reader_id` as read. Returns
/// the number of messages transitioned; calling again is a no-op.
pub fn mark_all_read(
    conn: &Connection,
    conversation_id: &Uuid,
    reader_id: &Uuid,
) -> Result<usize, ApiError> {
    let changed = conn.execute(
        "UPDATE messages SET is_read = 1, read_at = ?3 \
         WHERE conversation_id = ?1 AND recipient_id = ?2 AND is_read = 0",
        params![conversation_id.to_string(), reader_id.to_string(), db::now()],
    )?;
    Ok(changed)
}

/// Delete a message; only its sender may do so. Returns the owning
/// conversation id.
pub fn delete(conn: &Connection, message_id: &Uuid, requester_id: &Uuid) -> Result<Uuid, ApiError> {
    let mut stmt = conn.prepare("SELECT conversation_id, sender_id FROM messages WHERE id = ?1")?;
    let row: Option<(String, String)> = stmt
        .query_row([message_id.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?;
    let (conversation_id, sender_id) =
        row.ok_or_else(|| ApiError::not_found("message not found"))?;
    if sender_id != requester_id.to_string() {
        return Err(ApiError::forbidden("only the sender may delete a message"));
    }
    conn.execute("DELETE FROM messages WHERE id = ?1", [message_id.to_string()])?;
    Ok(Uuid::parse_str(&conversation_id).unwrap_or_default())
}
