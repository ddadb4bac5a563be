use crate::db;
use crate::error::ApiError;
use crate::model::{Comment, Post};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

static MENTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@([A-Za-z0-9_]+)").unwrap());

/// Resolve `@username` mentions in a piece of content to user ids,
/// excluding the author mentioning themselves.
pub fn scan_mentions(conn: &Connection, author_id: &Uuid, text: &str) -> Result<Vec<Uuid>, ApiError> {
    let mut out = Vec::new();
    for cap in MENTION_RE.captures_iter(text) {
        let uname = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        let mut stmt = conn.prepare("SELECT id FROM users WHERE username = ?1")?;
        let found: Option<String> = stmt.query_row([uname], |row| row.get(0)).optional()?;
        if let Some(id) = found.and_then(|s| Uuid::parse_str(&s).ok()) {
            if id != *author_id && !out.contains(&id) {
                out.push(id);
            }
        }
    }
    Ok(out)
}

pub fn create(
    conn: &Connection,
    author_id: &Uuid,
    content: &str,
    max_len: usize,
) -> Result<Post, ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::validation("post content required"));
    }
    if content.chars().count() > max_len {
        return Err(ApiError::validation("post content too long"));
    }
    let id = Uuid::new_v4();
    let now = db::now();
    conn.execute(
        "INSERT INTO posts (id, author_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), author_id.to_string(), content, now],
    )?;
    Ok(Post {
        id,
        author_id: *author_id,
        content: content.into(),
        created_at: now,
        like_count: 0,
        comment_count: 0,
    })
}

fn row_to_post(row: &rusqlite::Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        author_id: Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap_or_default(),
        content: row.get(2)?,
        created_at: row.get(3)?,
        like_count: row.get::<_, i64>(4)?.max(0) as u32,
        comment_count: row.get::<_, i64>(5)?.max(0) as u32,
    })
}

const POST_QUERY: &str = "SELECT p.id, p.author_id, p.content, p.created_at, \
 (SELECT COUNT(*) FROM post_likes l WHERE l.post_id = p.id), \
 (SELECT COUNT(*) FROM post_comments c WHERE c.post_id = p.id) \
 FROM posts p";

pub fn get(conn: &Connection, id: &Uuid) -> Result<Option<Post>, ApiError> {
    let mut stmt = conn.prepare(&format!("{POST_QUERY} WHERE p.id = ?1"))?;
    Ok(stmt.query_row([id.to_string()], row_to_post).optional()?)
}

pub fn list(conn: &Connection, limit: usize) -> Result<Vec<Post>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "{POST_QUERY} ORDER BY p.created_at DESC, p.id DESC LIMIT ?1"
    ))?;
    let posts = stmt
        .query_map([limit as i64], row_to_post)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(posts)
}

/// Like a post when not yet liked, otherwise remove the like. Returns
/// the new like count and whether the caller now likes the post.
pub fn toggle_like(
    conn: &Connection,
    post_id: &Uuid,
    user_id: &Uuid,
) -> Result<(u32, bool), ApiError> {
    if get(conn, post_id)?.is_none() {
        return Err(ApiError::not_found("post not found"));
    }
    let removed = conn.execute(
        "DELETE FROM post_likes WHERE post_id = ?1 AND user_id = ?2",
        params![post_id.to_string(), user_id.to_string()],
    )?;
    let is_liked = removed == 0;
    if is_liked {
        conn.execute(
            "INSERT INTO post_likes (post_id, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![post_id.to_string(), user_id.to_string(), db::now()],
        )?;
    }
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM post_likes WHERE post_id = ?1",
        [post_id.to_string()],
        |row| row.get(0),
    )?;
    Ok((count.max(0) as u32, is_liked))
}

pub fn add_comment(
    conn: &Connection,
    post_id: &Uuid,
    author_id: &Uuid,
    content: &str,
    max_len: usize,
) -> Result<Comment, ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::validation("comment content required"));
    }
    if content.chars().count() > max_len {
        return Err(ApiError::validation("comment content too long"));
    }
    if get(conn, post_id)?.is_none() {
        return Err(ApiError::not_found("post not found"));
    }
    let id = Uuid::new_v4();
    let now = db::now();
    conn.execute(
        "INSERT INTO post_comments (id, post_id, author_id, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id.to_string(),
            post_id.to_string(),
            author_id.to_string(),
            content,
            now
        ],
    )?;
    Ok(Comment {
        id,
        post_id: *post_id,
        author_id: *author_id,
        content: content.into(),
        created_at: now,
    })
}

pub fn list_comments(conn: &Connection, post_id: &Uuid) -> Result<Vec<Comment>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT id, post_id, author_id, content, created_at FROM post_comments \
         WHERE post_id = ?1 ORDER BY created_at, id",
    )?;
    let comments = stmt
        .query_map([post_id.to_string()], |row| {
            Ok(Comment {
                id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
                post_id: Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap_or_default(),
                author_id: Uuid::parse_str(row.get::<_, String>(2)?.as_str()).unwrap_or_default(),
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(comments)
}
