use crate::error::ApiError;
use crate::model::{Conversation, ConversationView};
use crate::{db, messages, users};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

/// Normalize a participant pair; equality of a conversation is over the
/// unordered pair, so rows always store the sorted form.
pub fn pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Deterministic conversation id for two users, independent of argument
/// order.
pub fn conversation_id(a: Uuid, b: Uuid) -> Uuid {
    let (lo, hi) = pair(a, b);
    let name = format!("conversation:{}:{}", lo, hi);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let lo = Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap_or_default();
    let hi = Uuid::parse_str(row.get::<_, String>(2)?.as_str()).unwrap_or_default();
    Ok(Conversation {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        participants: [lo, hi],
        last_message_id: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        last_message_at: row.get(4)?,
        unread: [
            row.get::<_, i64>(5)?.max(0) as u32,
            row.get::<_, i64>(6)?.max(0) as u32,
        ],
        created_at: row.get(7)?,
    })
}

const COLUMNS: &str =
    "id, user_lo, user_hi, last_message_id, last_message_at, unread_lo, unread_hi, created_at";

/// Fetch the conversation between two users, creating it when absent.
/// The deterministic id plus the UNIQUE pair constraint make this an
/// atomic find-or-insert: racing first-contact requests converge on one
/// row.
pub fn get_or_create(conn: &Connection, a: Uuid, b: Uuid) -> Result<Conversation, ApiError> {
    if a == b {
        return Err(ApiError::validation("cannot message yourself"));
    }
    let (lo, hi) = pair(a, b);
    let id = conversation_id(a, b);
    let now = db::now();
    conn.execute(
        "INSERT OR IGNORE INTO conversations (id, user_lo, user_hi, last_message_at, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![id.to_string(), lo.to_string(), hi.to_string(), now],
    )?;
    get(conn, &id)?.ok_or_else(|| ApiError::Internal("conversation vanished after insert".into()))
}

pub fn get(conn: &Connection, id: &Uuid) -> Result<Option<Conversation>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM conversations WHERE id = ?1"
    ))?;
    let conv = stmt
        .query_row([id.to_string()], row_to_conversation)
        .optional()?;
    Ok(conv)
}

/// Advance the last-message pointer and bump the recipient's unread
/// counter. The increment happens inside the UPDATE so two in-flight
/// sends cannot lose a count to a read-modify-write race.
pub fn record_new_message(
    conn: &Connection,
    conversation_id: &Uuid,
    message_id: &Uuid,
    created_at: i64,
    recipient_id: &Uuid,
) -> Result<(), ApiError> {
    let changed = conn.execute(
        "UPDATE conversations SET last_message_id = ?2, last_message_at = ?3, \
         unread_lo = unread_lo + (user_lo = ?4), \
         unread_hi = unread_hi + (user_hi = ?4) \
         WHERE id = ?1",
        params![
            conversation_id.to_string(),
            message_id.to_string(),
            created_at,
            recipient_id.to_string()
        ],
    )?;
    if changed == 0 {
        return Err(ApiError::not_found("conversation not found"));
    }
    Ok(())
}

/// Reset the reader's unread counter. The other participant's counter is
/// untouched.
pub fn mark_read(conn: &Connection, conversation_id: &Uuid, reader_id: &Uuid) -> Result<(), ApiError> {
    let changed = conn.execute(
        "UPDATE conversations SET \
         unread_lo = CASE WHEN user_lo = ?2 THEN 0 ELSE unread_lo END, \
         unread_hi = CASE WHEN user_hi = ?2 THEN 0 ELSE unread_hi END \
         WHERE id = ?1",
        params![conversation_id.to_string(), reader_id.to_string()],
    )?;
    if changed == 0 {
        return Err(ApiError::not_found("conversation not found"));
    }
    Ok(())
}

/// Conversations for one user, most recently active first, with the
/// peer profile and latest message resolved.
pub fn list_for_user(conn: &Connection, user_id: &Uuid) -> Result<Vec<ConversationView>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM conversations WHERE user_lo = ?1 OR user_hi = ?1 \
         ORDER BY last_message_at DESC"
    ))?;
    let convs = stmt
        .query_map([user_id.to_string()], row_to_conversation)?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(convs.len());
    for conv in convs {
        let peer_id = conv
            .other_participant(user_id)
            .ok_or_else(|| ApiError::Internal("participant missing from own conversation".into()))?;
        let peer = users::get(conn, &peer_id)?
            .ok_or_else(|| ApiError::not_found("conversation peer not found"))?;
        let last_message = match conv.last_message_id {
            Some(id) => messages::get(conn, &id)?,
            None => None,
        };
        out.push(ConversationView {
            id: conv.id,
            peer,
            last_message,
            last_message_at: conv.last_message_at,
            unread_count: conv.unread_for(user_id),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users;

    fn seed_user(conn: &Connection, name: &str) -> Uuid {
        users::create(conn, name, name, "hash", &[]).unwrap().id
    }

    #[test]
    fn get_or_create_is_stable_across_argument_order() {
        let conn = db::init_db(":memory:").unwrap();
        let a = seed_user(&conn, "alice");
        let b = seed_user(&conn, "bob");
        let first = get_or_create(&conn, a, b).unwrap();
        let second = get_or_create(&conn, b, a).unwrap();
        assert_eq!(first.id, second.id);
        let (lo, hi) = pair(a, b);
        assert_eq!(first.participants, [lo, hi]);
        assert_eq!(first.unread, [0, 0]);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn self_conversation_rejected() {
        let conn = db::init_db(":memory:").unwrap();
        let a = seed_user(&conn, "alice");
        assert!(matches!(
            get_or_create(&conn, a, a),
            Err(ApiError::Validation(_))
        ));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn unread_accounting() {
        let conn = db::init_db(":memory:").unwrap();
        let a = seed_user(&conn, "alice");
        let b = seed_user(&conn, "bob");
        let conv = get_or_create(&conn, a, b).unwrap();
        for n in 1..=3i64 {
            let mid = Uuid::new_v4();
            record_new_message(&conn, &conv.id, &mid, n, &b).unwrap();
        }
        let conv = get(&conn, &conv.id).unwrap().unwrap();
        assert_eq!(conv.unread_for(&b), 3);
        assert_eq!(conv.unread_for(&a), 0);
        assert_eq!(conv.last_message_at, 3);

        mark_read(&conn, &conv.id, &b).unwrap();
        let conv = get(&conn, &conv.id).unwrap().unwrap();
        assert_eq!(conv.unread_for(&b), 0);

        // reading never touches the counterpart's counter
        let mid = Uuid::new_v4();
        record_new_message(&conn, &conv.id, &mid, 4, &a).unwrap();
        mark_read(&conn, &conv.id, &b).unwrap();
        let conv = get(&conn, &conv.id).unwrap().unwrap();
        assert_eq!(conv.unread_for(&a), 1);
        assert_eq!(conv.last_message_id, Some(mid));
    }

    #[test]
    fn listing_orders_by_activity() {
        let conn = db::init_db(":memory:").unwrap();
        let a = seed_user(&conn, "alice");
        let b = seed_user(&conn, "bob");
        let c = seed_user(&conn, "carol");
        let with_b = get_or_create(&conn, a, b).unwrap();
        let with_c = get_or_create(&conn, a, c).unwrap();
        record_new_message(&conn, &with_b.id, &Uuid::new_v4(), 100, &a).unwrap();
        record_new_message(&conn, &with_c.id, &Uuid::new_v4(), 200, &a).unwrap();
        let views = list_for_user(&conn, &a).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].id, with_c.id);
        assert_eq!(views[0].peer.id, c);
        assert_eq!(views[1].id, with_b.id);
        assert!(list_for_user(&conn, &b).unwrap().len() == 1);
    }
}
