use crate::db;
use crate::error::{conflict_on_unique, ApiError};
use crate::model::User;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let skills: String = row.get(4)?;
    Ok(User {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        username: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
        skills: serde_json::from_str(&skills).unwrap_or_default(),
        created_at: row.get(5)?,
    })
}

const COLUMNS: &str = "id, username, display_name, avatar_url, skills, created_at";

/// Create a user. Usernames are unique case-insensitively.
pub fn create(
    conn: &Connection,
    username: &str,
    display_name: &str,
    password_hash: &str,
    skills: &[String],
) -> Result<User, ApiError> {
    let username = username.trim();
    if username.is_empty() || display_name.trim().is_empty() {
        return Err(ApiError::validation("username and display name required"));
    }
    let id = Uuid::new_v4();
    let now = db::now();
    let skills_json =
        serde_json::to_string(skills).map_err(|e| ApiError::Internal(e.to_string()))?;
    conn.execute(
        "INSERT INTO users (id, username, display_name, password_hash, skills, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            username,
            display_name,
            password_hash,
            skills_json,
            now
        ],
    )
    .map_err(|e| conflict_on_unique(e, "username already taken"))?;
    Ok(User {
        id,
        username: username.into(),
        display_name: display_name.into(),
        avatar_url: None,
        skills: skills.to_vec(),
        created_at: now,
    })
}

pub fn get(conn: &Connection, id: &Uuid) -> Result<Option<User>, ApiError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM users WHERE id = ?1"))?;
    Ok(stmt.query_row([id.to_string()], row_to_user).optional()?)
}

pub fn find_by_username(conn: &Connection, username: &str) -> Result<Option<User>, ApiError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM users WHERE username = ?1"))?;
    Ok(stmt.query_row([username], row_to_user).optional()?)
}

/// User plus stored password hash, for login verification.
pub fn credentials(conn: &Connection, username: &str) -> Result<Option<(User, String)>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS}, password_hash FROM users WHERE username = ?1"
    ))?;
    Ok(stmt
        .query_row([username], |row| Ok((row_to_user(row)?, row.get::<_, String>(6)?)))
        .optional()?)
}

pub fn is_following(conn: &Connection, follower: &Uuid, followee: &Uuid) -> Result<bool, ApiError> {
    let mut stmt =
        conn.prepare("SELECT 1 FROM follows WHERE follower_id = ?1 AND followee_id = ?2")?;
    let exists: Option<i64> = stmt
        .query_row(
            params![follower.to_string(), followee.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(exists.is_some())
}

/// File a follow request. The follow only takes effect once the target
/// accepts it.
pub fn request_follow(conn: &Connection, requester: &Uuid, target: &Uuid) -> Result<(), ApiError> {
    if requester == target {
        return Err(ApiError::validation("cannot follow yourself"));
    }
    if get(conn, target)?.is_none() {
        return Err(ApiError::not_found("user not found"));
    }
    if is_following(conn, requester, target)? {
        return Err(ApiError::validation("already following this user"));
    }
    conn.execute(
        "INSERT INTO follow_requests (requester_id, target_id, created_at) VALUES (?1, ?2, ?3)",
        params![requester.to_string(), target.to_string(), db::now()],
    )
    .map_err(|e| conflict_on_unique(e, "follow request already sent"))?;
    Ok(())
}

/// Accept a pending follow request addressed to `target`.
pub fn accept_follow(conn: &Connection, target: &Uuid, requester: &Uuid) -> Result<(), ApiError> {
    let removed = conn.execute(
        "DELETE FROM follow_requests WHERE requester_id = ?1 AND target_id = ?2",
        params![requester.to_string(), target.to_string()],
    )?;
    if removed == 0 {
        return Err(ApiError::not_found("no follow request from this user"));
    }
    conn.execute(
        "INSERT OR IGNORE INTO follows (follower_id, followee_id, created_at) VALUES (?1, ?2, ?3)",
        params![requester.to_string(), target.to_string(), db::now()],
    )?;
    Ok(())
}

pub fn unfollow(conn: &Connection, follower: &Uuid, followee: &Uuid) -> Result<(), ApiError> {
    let removed = conn.execute(
        "DELETE FROM follows WHERE follower_id = ?1 AND followee_id = ?2",
        params![follower.to_string(), followee.to_string()],
    )?;
    if removed == 0 {
        return Err(ApiError::validation("not following this user"));
    }
    Ok(())
}

pub fn followers(conn: &Connection, user_id: &Uuid) -> Result<Vec<User>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM users WHERE id IN \
         (SELECT follower_id FROM follows WHERE followee_id = ?1) ORDER BY username"
    ))?;
    let users = stmt
        .query_map([user_id.to_string()], row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

pub fn following(conn: &Connection, user_id: &Uuid) -> Result<Vec<User>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM users WHERE id IN \
         (SELECT followee_id FROM follows WHERE follower_id = ?1) ORDER BY username"
    ))?;
    let users = stmt
        .query_map([user_id.to_string()], row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_unique_case_insensitive() {
        let conn = db::init_db(":memory:").unwrap();
        create(&conn, "Alice", "Alice", "hash", &[]).unwrap();
        assert!(matches!(
            create(&conn, "alice", "Another", "hash", &[]),
            Err(ApiError::Conflict(_))
        ));
    }

    #[test]
    fn skills_round_trip() {
        let conn = db::init_db(":memory:").unwrap();
        let skills = vec!["rust".to_string(), "sql".to_string()];
        let user = create(&conn, "alice", "Alice", "hash", &skills).unwrap();
        let fetched = get(&conn, &user.id).unwrap().unwrap();
        assert_eq!(fetched.skills, skills);
        let (by_name, hash) = credentials(&conn, "alice").unwrap().unwrap();
        assert_eq!(by_name.id, user.id);
        assert_eq!(hash, "hash");
    }

    #[test]
    fn follow_request_lifecycle() {
        let conn = db::init_db(":memory:").unwrap();
        let a = create(&conn, "alice", "Alice", "hash", &[]).unwrap().id;
        let b = create(&conn, "bob", "Bob", "hash", &[]).unwrap().id;

        assert!(matches!(
            request_follow(&conn, &a, &a),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            request_follow(&conn, &a, &Uuid::new_v4()),
            Err(ApiError::NotFound(_))
        ));

        request_follow(&conn, &a, &b).unwrap();
        assert!(matches!(
            request_follow(&conn, &a, &b),
            Err(ApiError::Conflict(_))
        ));

        assert!(matches!(
            accept_follow(&conn, &b, &Uuid::new_v4()),
            Err(ApiError::NotFound(_))
        ));
        accept_follow(&conn, &b, &a).unwrap();
        assert!(is_following(&conn, &a, &b).unwrap());
        assert!(!is_following(&conn, &b, &a).unwrap());
        assert_eq!(followers(&conn, &b).unwrap()[0].id, a);
        assert_eq!(following(&conn, &a).unwrap()[0].id, b);

        // a second request while already following is rejected up front
        assert!(matches!(
            request_follow(&conn, &a, &b),
            Err(ApiError::Validation(_))
        ));

        unfollow(&conn, &a, &b).unwrap();
        assert!(!is_following(&conn, &a, &b).unwrap());
        assert!(matches!(
            unfollow(&conn, &a, &b),
            Err(ApiError::Validation(_))
        ));
    }
}
