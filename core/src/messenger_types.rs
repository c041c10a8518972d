/// Shared types for the Messenger layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub type UserId = u64;
pub type MessageId = u64;

/// The authenticated local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub username: String,
}

/// User record as the backend serialises it (ORM keys accepted as aliases)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(alias = "ID")]
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default)]
    pub following_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_following: Option<bool>,
}

/// Identity metadata shown next to a peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    pub email: Option<String>,
    pub followers_count: u64,
    pub following_count: u64,
    pub is_following: Option<bool>,
}

/// A conversation partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: UserId,
    pub username: String,
    pub metadata: PeerMetadata,
    /// Not resolved yet; `username` is a stand-in
    #[serde(default)]
    pub placeholder: bool,
}

impl Peer {
    pub fn placeholder(id: UserId) -> Self {
        Self {
            id,
            username: "Unknown User".to_string(),
            metadata: PeerMetadata::default(),
            placeholder: true,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

impl From<UserProfile> for Peer {
    fn from(user: UserProfile) -> Self {
        Self {
            id: user.id,
            username: user.username,
            metadata: PeerMetadata {
                email: user.email.filter(|e| !e.is_empty()),
                followers_count: user.followers_count,
                following_count: user.following_count,
                is_following: user.is_following,
            },
            placeholder: false,
        }
    }
}

/// One direct message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(
        alias = "ID",
        default,
        deserialize_with = "non_zero_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<MessageId>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(alias = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<UserProfile>,
}

// The backend emits `0` for rows it never persisted.
fn non_zero_id<'de, D>(deserializer: D) -> std::result::Result<Option<MessageId>, D::Error>
where
    D: Deserializer<'de>,
{
    let id = Option::<MessageId>::deserialize(deserializer)?;
    Ok(id.filter(|id| *id != 0))
}

impl Message {
    pub fn new(
        id: Option<MessageId>,
        sender_id: UserId,
        receiver_id: UserId,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sender_id,
            receiver_id,
            content: content.into(),
            created_at,
            sender: None,
            receiver: None,
        }
    }

    /// Ordering key: timestamp first, id breaks ties (absent id sorts first).
    /// Participants and content order id-less messages sharing a timestamp.
    pub fn sort_key(&self) -> (DateTime<Utc>, Option<MessageId>, UserId, UserId, &str) {
        (
            self.created_at,
            self.id,
            self.sender_id,
            self.receiver_id,
            self.content.as_str(),
        )
    }

    /// Same logical message: equal ids, or equal values when an id is missing
    pub fn same_identity(&self, other: &Message) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id, self.receiver_id)
    }
}

/// Unordered pair of participants identifying one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.low == id || self.high == id
    }

    /// The participant that is not `me` (`None` when `me` is not a participant)
    pub fn other(&self, me: UserId) -> Option<UserId> {
        if self.low == me {
            Some(self.high)
        } else if self.high == me {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dm:{}:{}", self.low, self.high)
    }
}

/// Summary of one conversation thread (for list views)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    /// The other party's id
    pub peer_id: UserId,
    /// Preview text of the last message
    pub last_preview: String,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub unread: usize,
}

/// Change notifications emitted by the conversation store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// Authoritative history replaced the conversation's sequence
    HistoryLoaded { key: ConversationKey, len: usize },
    /// A message was merged in at `index`
    MessageAdded {
        key: ConversationKey,
        index: usize,
        message: Message,
        active: bool,
    },
    /// Active selection moved
    SelectionChanged { peer_id: Option<UserId> },
}

impl ConversationEvent {
    /// Conversation the event belongs to (`None` for selection changes)
    pub fn key(&self) -> Option<ConversationKey> {
        match self {
            ConversationEvent::HistoryLoaded { key, .. } => Some(*key),
            ConversationEvent::MessageAdded { key, .. } => Some(*key),
            ConversationEvent::SelectionChanged { .. } => None,
        }
    }
}

/// Inbound push frames the client understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    NewMessage { message: Message },
}

/// `{token}` returned by login/register
#[derive(Debug, Clone, Deserialize)]
pub struct AuthToken {
    pub token: String,
}

/// A feed post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    #[serde(alias = "ID")]
    pub id: u64,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    #[serde(alias = "CreatedAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// One page of `/feed`
#[derive(Debug, Clone, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub posts: Vec<Post>,
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    pub total_pages: u64,
    pub total_count: u64,
}

/// One page of `/friends/users`
#[derive(Debug, Clone, Deserialize)]
pub struct UserPage {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub users: Vec<UserProfile>,
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    pub total_pages: u64,
    pub total_count: u64,
}

// Go encodes empty slices as `null`.
pub(crate) fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
