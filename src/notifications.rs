use crate::db;
use crate::error::ApiError;
use crate::model::{Notification, NotificationKind, NotificationRef, ServerEvent};
use crate::registry::Registry;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub struct NewNotification {
    pub recipient_id: Uuid,
    pub sender_id: Uuid,
    pub kind: NotificationKind,
    pub body: String,
    pub reference: Option<NotificationRef>,
}

pub fn create(conn: &Connection, input: &NewNotification) -> Result<Notification, ApiError> {
    let id = Uuid::new_v4();
    let now = db::now();
    conn.execute(
        "INSERT INTO notifications (id, recipient_id, sender_id, kind, body, ref_kind, ref_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id.to_string(),
            input.recipient_id.to_string(),
            input.sender_id.to_string(),
            input.kind.as_str(),
            input.body,
            input.reference.map(|r| r.kind_str()),
            input.reference.map(|r| r.id().to_string()),
            now
        ],
    )?;
    Ok(Notification {
        id,
        recipient_id: input.recipient_id,
        sender_id: input.sender_id,
        kind: input.kind,
        body: input.body.clone(),
        reference: input.reference,
        is_read: false,
        created_at: now,
    })
}

/// Fire-and-forget sink for notification side effects. Persistence
/// failures are logged and swallowed so the triggering action never
/// fails; the live push is attempted regardless of the persistence
/// outcome.
pub fn dispatch(conn: &Connection, registry: &Registry, input: NewNotification) {
    let recipient_id = input.recipient_id;
    let kind = input.kind;
    let body = input.body.clone();
    if let Err(err) = create(conn, &input) {
        tracing::warn!(
            kind = kind.as_str(),
            "failed to persist notification: {err}"
        );
    }
    let _ = registry.send_to_user(
        &recipient_id,
        ServerEvent::NotificationNew {
            kind,
            message: body,
        },
    );
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let ref_kind: Option<String> = row.get(5)?;
    let ref_id: Option<String> = row.get(6)?;
    let reference = match (ref_kind, ref_id) {
        (Some(kind), Some(id)) => Uuid::parse_str(&id)
            .ok()
            .and_then(|id| NotificationRef::from_parts(&kind, id)),
        _ => None,
    };
    Ok(Notification {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        recipient_id: Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap_or_default(),
        sender_id: Uuid::parse_str(row.get::<_, String>(2)?.as_str()).unwrap_or_default(),
        kind: NotificationKind::parse(row.get::<_, String>(3)?.as_str())
            .unwrap_or(NotificationKind::Post),
        body: row.get(4)?,
        reference,
        is_read: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

const COLUMNS: &str =
    "id, recipient_id, sender_id, kind, body, ref_kind, ref_id, is_read, created_at";

/// Most recent notifications for a user, bounded.
pub fn list_for(
    conn: &Connection,
    user_id: &Uuid,
    limit: usize,
) -> Result<Vec<Notification>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM notifications WHERE recipient_id = ?1 \
         ORDER BY created_at DESC, rowid DESC LIMIT ?2"
    ))?;
    let items = stmt
        .query_map(params![user_id.to_string(), limit as i64], row_to_notification)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn mark_read(conn: &Connection, id: &Uuid) -> Result<Notification, ApiError> {
    conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE id = ?1",
        [id.to_string()],
    )?;
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1"))?;
    stmt.query_row([id.to_string()], row_to_notification)
        .optional()?
        .ok_or_else(|| ApiError::not_found("notification not found"))
}

pub fn mark_all_read(conn: &Connection, user_id: &Uuid) -> Result<usize, ApiError> {
    let changed = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND is_read = 0",
        [user_id.to_string()],
    )?;
    Ok(changed)
}

/// Delete a notification; only its recipient may do so.
pub fn delete(conn: &Connection, id: &Uuid, requester_id: &Uuid) -> Result<(), ApiError> {
    let mut stmt = conn.prepare("SELECT recipient_id FROM notifications WHERE id = ?1")?;
    let recipient: Option<String> = stmt
        .query_row([id.to_string()], |row| row.get(0))
        .optional()?;
    let recipient = recipient.ok_or_else(|| ApiError::not_found("notification not found"))?;
    if recipient != requester_id.to_string() {
        return Err(ApiError::forbidden("not your notification"));
    }
    conn.execute("DELETE FROM notifications WHERE id = ?1", [id.to_string()])?;
    Ok(())
}

/// Drop read notifications older than the retention window. Unread ones
/// are kept regardless of age.
pub fn prune_read(conn: &Connection, keep_days: i64) -> Result<usize, ApiError> {
    let cutoff = db::now() - keep_days * 24 * 60 * 60;
    let removed = conn.execute(
        "DELETE FROM notifications WHERE is_read = 1 AND created_at < ?1",
        [cutoff],
    )?;
    Ok(removed)
}
