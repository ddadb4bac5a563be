use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub skills: Vec<String>,
    pub created_at: i64,
}

/// Durable two-party messaging thread. Participants are stored as the
/// sorted pair so a (B, A) lookup resolves to the same row as (A, B);
/// `unread` is index-aligned with `participants`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    pub last_message_id: Option<Uuid>,
    pub last_message_at: i64,
    pub unread: [u32; 2],
    pub created_at: i64,
}

impl Conversation {
    pub fn is_participant(&self, user_id: &Uuid) -> bool {
        self.participants.contains(user_id)
    }

    /// The counterpart of `user_id` in this conversation.
    pub fn other_participant(&self, user_id: &Uuid) -> Option<Uuid> {
        if self.participants[0] == *user_id {
            Some(self.participants[1])
        } else if self.participants[1] == *user_id {
            Some(self.participants[0])
        } else {
            None
        }
    }

    pub fn unread_for(&self, user_id: &Uuid) -> u32 {
        self.participants
            .iter()
            .position(|p| p == user_id)
            .map(|i| self.unread[i])
            .unwrap_or(0)
    }
}

/// Conversation as listed for one caller: the other participant's
/// profile, the latest message and the caller's unread counter.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConversationView {
    pub id: Uuid,
    pub peer: User,
    pub last_message: Option<Message>,
    pub last_message_at: i64,
    pub unread_count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(AttachmentKind::Image),
            "file" => Some(AttachmentKind::File),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
    pub size_bytes: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub is_read: bool,
    pub read_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
    FollowRequest,
    FollowAccepted,
    Message,
    Endorsement,
    Mention,
    Post,
    Share,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Like => "like",
            NotificationKind::Comment => "comment",
            NotificationKind::Follow => "follow",
            NotificationKind::FollowRequest => "follow_request",
            NotificationKind::FollowAccepted => "follow_accepted",
            NotificationKind::Message => "message",
            NotificationKind::Endorsement => "endorsement",
            NotificationKind::Mention => "mention",
            NotificationKind::Post => "post",
            NotificationKind::Share => "share",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "like" => Some(NotificationKind::Like),
            "comment" => Some(NotificationKind::Comment),
            "follow" => Some(NotificationKind::Follow),
            "follow_request" => Some(NotificationKind::FollowRequest),
            "follow_accepted" => Some(NotificationKind::FollowAccepted),
            "message" => Some(NotificationKind::Message),
            "endorsement" => Some(NotificationKind::Endorsement),
            "mention" => Some(NotificationKind::Mention),
            "post" => Some(NotificationKind::Post),
            "share" => Some(NotificationKind::Share),
        _ => None,
        }
    }
}

/// Back-reference carried by a notification. A tagged union instead of a
/// spread of nullable columns keeps a follow notification from pointing
/// at a post.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NotificationRef {
    User(Uuid),
    Post(Uuid),
    Conversation(Uuid),
    Endorsement(Uuid),
}

impl NotificationRef {
    pub fn kind_str(&self) -> &'static str {
        match self {
            NotificationRef::User(_) => "user",
            NotificationRef::Post(_) => "post",
            NotificationRef::Conversation(_) => "conversation",
            NotificationRef::Endorsement(_) => "endorsement",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            NotificationRef::User(id)
            | NotificationRef::Post(id)
            | NotificationRef::Conversation(id)
            | NotificationRef::Endorsement(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "user" => Some(NotificationRef::User(id)),
            "post" => Some(NotificationRef::Post(id)),
            "conversation" => Some(NotificationRef::Conversation(id)),
            "endorsement" => Some(NotificationRef::Endorsement(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub sender_id: Uuid,
    pub kind: NotificationKind,
    pub body: String,
    pub reference: Option<NotificationRef>,
    pub is_read: bool,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: i64,
    pub like_count: u32,
    pub comment_count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: Uuid,
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Endorsement {
    pub id: Uuid,
    pub from_id: Uuid,
    pub to_id: Uuid,
    pub skill: String,
    pub note: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkKind {
    Post,
    User,
}

impl BookmarkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookmarkKind::Post => "post",
            BookmarkKind::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "post" => Some(BookmarkKind::Post),
            "user" => Some(BookmarkKind::User),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Bookmark {
    pub id: Uuid,
    pub user_id: Uuid,
    pub item_kind: BookmarkKind,
    pub item_id: Uuid,
    pub collection: String,
    pub notes: Option<String>,
    pub created_at: i64,
}

/// Events pushed server -> client over the live channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:receive")]
    MessageReceive(Message),
    #[serde(rename = "notification:new")]
    NotificationNew {
        kind: NotificationKind,
        message: String,
    },
    #[serde(rename = "user:online")]
    UserOnline { user_id: Uuid },
    #[serde(rename = "user:offline")]
    UserOffline { user_id: Uuid },
    #[serde(rename = "typing:start")]
    TypingStart {
        user_id: Uuid,
        conversation_id: Uuid,
    },
    #[serde(rename = "typing:stop")]
    TypingStop {
        user_id: Uuid,
        conversation_id: Uuid,
    },
    #[serde(rename = "message:read")]
    MessageRead {
        conversation_id: Uuid,
        message_id: Option<Uuid>,
        reader_id: Uuid,
    },
}

/// Events accepted client -> server over the live channel. Everything
/// here is transient UI state; none of it is persisted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "typing:start")]
    TypingStart {
        recipient_id: Uuid,
        conversation_id: Uuid,
    },
    #[serde(rename = "typing:stop")]
    TypingStop {
        recipient_id: Uuid,
        conversation_id: Uuid,
    },
    #[serde(rename = "message:read")]
    MessageRead {
        conversation_id: Uuid,
        message_id: Option<Uuid>,
    },
}
