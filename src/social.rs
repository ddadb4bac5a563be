use crate::db;
use crate::error::{conflict_on_unique, ApiError};
use crate::model::{Bookmark, BookmarkKind, Endorsement};
use crate::users;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const MAX_NOTE_LEN: usize = 500;

/// Endorse one of a user's listed skills.
pub fn endorse(
    conn: &Connection,
    from_id: &Uuid,
    to_id: &Uuid,
    skill: &str,
    note: Option<&str>,
) -> Result<Endorsement, ApiError> {
    if from_id == to_id {
        return Err(ApiError::validation("cannot endorse yourself"));
    }
    let target = users::get(conn, to_id)?.ok_or_else(|| ApiError::not_found("user not found"))?;
    if !target.skills.iter().any(|s| s == skill) {
        return Err(ApiError::validation("user does not list this skill"));
    }
    if let Some(note) = note {
        if note.chars().count() > MAX_NOTE_LEN {
            return Err(ApiError::validation("note too long"));
        }
    }
    let id = Uuid::new_v4();
    let now = db::now();
    conn.execute(
        "INSERT INTO endorsements (id, from_id, to_id, skill, note, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            from_id.to_string(),
            to_id.to_string(),
            skill,
            note,
            now
        ],
    )
    .map_err(|e| conflict_on_unique(e, "already endorsed this skill"))?;
    Ok(Endorsement {
        id,
        from_id: *from_id,
        to_id: *to_id,
        skill: skill.into(),
        note: note.map(Into::into),
        created_at: now,
    })
}

fn row_to_endorsement(row: &rusqlite::Row<'_>) -> rusqlite::Result<Endorsement> {
    Ok(Endorsement {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        from_id: Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap_or_default(),
        to_id: Uuid::parse_str(row.get::<_, String>(2)?.as_str()).unwrap_or_default(),
        skill: row.get(3)?,
        note: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Endorsements received by a user, newest first.
pub fn endorsements_for(conn: &Connection, to_id: &Uuid) -> Result<Vec<Endorsement>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT id, from_id, to_id, skill, note, created_at FROM endorsements \
         WHERE to_id = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let endorsements = stmt
        .query_map([to_id.to_string()], row_to_endorsement)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(endorsements)
}

/// Remove an endorsement; only the endorser may do so.
pub fn remove_endorsement(
    conn: &Connection,
    id: &Uuid,
    requester_id: &Uuid,
) -> Result<(), ApiError> {
    let mut stmt = conn.prepare("SELECT from_id FROM endorsements WHERE id = ?1")?;
    let from: Option<String> = stmt
        .query_row([id.to_string()], |row| row.get(0))
        .optional()?;
    let from = from.ok_or_else(|| ApiError::not_found("endorsement not found"))?;
    if from != requester_id.to_string() {
        return Err(ApiError::forbidden("not your endorsement"));
    }
    conn.execute("DELETE FROM endorsements WHERE id = ?1", [id.to_string()])?;
    Ok(())
}

/// Save an item to the caller's bookmarks. The (user, kind, item) triple
/// is unique; saving it twice is a conflict.
pub fn add_bookmark(
    conn: &Connection,
    user_id: &Uuid,
    item_kind: BookmarkKind,
    item_id: &Uuid,
    collection: Option<&str>,
    notes: Option<&str>,
) -> Result<Bookmark, ApiError> {
    if let Some(notes) = notes {
        if notes.chars().count() > MAX_NOTE_LEN {
            return Err(ApiError::validation("notes too long"));
        }
    }
    let collection = collection.unwrap_or("general");
    let id = Uuid::new_v4();
    let now = db::now();
    conn.execute(
        "INSERT INTO bookmarks (id, user_id, item_kind, item_id, collection, notes, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id.to_string(),
            user_id.to_string(),
            item_kind.as_str(),
            item_id.to_string(),
            collection,
            notes,
            now
        ],
    )
    .map_err(|e| conflict_on_unique(e, "item already bookmarked"))?;
    Ok(Bookmark {
        id,
        user_id: *user_id,
        item_kind,
        item_id: *item_id,
        collection: collection.into(),
        notes: notes.map(Into::into),
        created_at: now,
    })
}

fn row_to_bookmark(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bookmark> {
    Ok(Bookmark {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        user_id: Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap_or_default(),
        item_kind: BookmarkKind::parse(row.get::<_, String>(2)?.as_str())
            .unwrap_or(BookmarkKind::Post),
        item_id: Uuid::parse_str(row.get::<_, String>(3)?.as_str()).unwrap_or_default(),
        collection: row.get(4)?,
        notes: row.get(5)?,
        created_at: row.get(6)?,
    })
}

pub fn bookmarks_for(
    conn: &Connection,
    user_id: &Uuid,
    collection: Option<&str>,
) -> Result<Vec<Bookmark>, ApiError> {
    let base = "SELECT id, user_id, item_kind, item_id, collection, notes, created_at \
                FROM bookmarks WHERE user_id = ?1";
    let items = match collection {
        Some(c) => {
            let mut stmt = conn.prepare(&format!(
                "{base} AND collection = ?2 ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt
                .query_map(params![user_id.to_string(), c], row_to_bookmark)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt =
                conn.prepare(&format!("{base} ORDER BY created_at DESC, id DESC"))?;
            let rows = stmt
                .query_map([user_id.to_string()], row_to_bookmark)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(items)
}

/// Remove a bookmark; only its owner may do so.
pub fn remove_bookmark(conn: &Connection, id: &Uuid, requester_id: &Uuid) -> Result<(), ApiError> {
    let mut stmt = conn.prepare("SELECT user_id FROM bookmarks WHERE id = ?1")?;
    let owner: Option<String> = stmt
        .query_row([id.to_string()], |row| row.get(0))
        .optional()?;
    let owner = owner.ok_or_else(|| ApiError::not_found("bookmark not found"))?;
    if owner != requester_id.to_string() {
        return Err(ApiError::forbidden("not your bookmark"));
    }
    conn.execute("DELETE FROM bookmarks WHERE id = ?1", [id.to_string()])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Connection, Uuid, Uuid) {
        let conn = db::init_db(":memory:").unwrap();
        let a = users::create(&conn, "alice", "Alice", "hash", &[]).unwrap().id;
        let b = users::create(&conn, "bob", "Bob", "hash", &["rust".to_string()])
            .unwrap()
            .id;
        (conn, a, b)
    }

    #[test]
    fn endorse_guards() {
        let (conn, a, b) = setup();
        assert!(matches!(
            endorse(&conn, &a, &a, "rust", None),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            endorse(&conn, &a, &Uuid::new_v4(), "rust", None),
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            endorse(&conn, &a, &b, "cobol", None),
            Err(ApiError::Validation(_))
        ));
        let e = endorse(&conn, &a, &b, "rust", Some("solid work")).unwrap();
        assert!(matches!(
            endorse(&conn, &a, &b, "rust", None),
            Err(ApiError::Conflict(_))
        ));
        assert_eq!(endorsements_for(&conn, &b).unwrap(), vec![e.clone()]);

        assert!(matches!(
            remove_endorsement(&conn, &e.id, &b),
            Err(ApiError::Authorization(_))
        ));
        remove_endorsement(&conn, &e.id, &a).unwrap();
        assert!(endorsements_for(&conn, &b).unwrap().is_empty());
    }

    #[test]
    fn duplicate_bookmark_conflicts() {
        let (conn, a, _b) = setup();
        let item = Uuid::new_v4();
        add_bookmark(&conn, &a, BookmarkKind::Post, &item, None, None).unwrap();
        assert!(matches!(
            add_bookmark(&conn, &a, BookmarkKind::Post, &item, Some("reading"), None),
            Err(ApiError::Conflict(_))
        ));
        // exactly one record exists
        assert_eq!(bookmarks_for(&conn, &a, None).unwrap().len(), 1);
        // same item under a different kind is a distinct bookmark
        add_bookmark(&conn, &a, BookmarkKind::User, &item, None, None).unwrap();
        assert_eq!(bookmarks_for(&conn, &a, None).unwrap().len(), 2);
    }

    #[test]
    fn bookmark_collections_filter() {
        let (conn, a, _b) = setup();
        add_bookmark(&conn, &a, BookmarkKind::Post, &Uuid::new_v4(), Some("rust"), None).unwrap();
        add_bookmark(&conn, &a, BookmarkKind::Post, &Uuid::new_v4(), None, None).unwrap();
        assert_eq!(bookmarks_for(&conn, &a, Some("rust")).unwrap().len(), 1);
        assert_eq!(bookmarks_for(&conn, &a, Some("general")).unwrap().len(), 1);
        assert_eq!(bookmarks_for(&conn, &a, None).unwrap().len(), 2);
    }

    #[test]
    fn bookmark_delete_is_owner_only() {
        let (conn, a, b) = setup();
        let bm = add_bookmark(&conn, &a, BookmarkKind::Post, &Uuid::new_v4(), None, None).unwrap();
        assert!(matches!(
            remove_bookmark(&conn, &bm.id, &b),
            Err(ApiError::Authorization(_))
        ));
        remove_bookmark(&conn, &bm.id, &a).unwrap();
        assert!(matches!(
            remove_bookmark(&conn, &bm.id, &a),
            Err(ApiError::NotFound(_))
        ));
    }
}
